//! Per-connection protocol engine: frame parsing, request/stream dispatch,
//! and liveness bookkeeping.
//!
//! Inbound frames are parsed sequentially per socket (arrival order), but
//! each envelope dispatch runs in its own task, so requests on one
//! connection execute concurrently and only per-request emission order is
//! guaranteed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use manifold_core::{generate_id, Context, Envelope, Router, RouterResult, RpcError};

use crate::channels::{ChannelManager, SocketSink};
use crate::config::WsServerConfig;
use crate::protocol::{ChannelRequest, InboundFrame, ServerMessage};

/// What the engine knows about one peer.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub socket_id: String,
    pub remote_addr: Option<SocketAddr>,
}

/// Builds the base [`Context`] for each request on a connection; the
/// engine then attaches the request id and cancellation.
pub type ContextFactory = Arc<dyn Fn(&ConnectionInfo) -> Context + Send + Sync>;

pub(crate) struct Connection {
    pub id: String,
    pub remote_addr: Option<SocketAddr>,
    pub alive: AtomicBool,
    pub outbound: mpsc::UnboundedSender<Message>,
    /// Cancelled when the socket goes away; every request token is linked
    /// to it.
    pub cancel: CancellationToken,
    pub active_requests: DashMap<String, CancellationToken>,
    pub active_streams: DashMap<String, CancellationToken>,
}

impl Connection {
    pub(crate) fn send_json<T: Serialize>(&self, value: &T) {
        match serde_json::to_string(value) {
            Ok(text) => {
                let _ = self.outbound.send(Message::Text(text.into()));
            }
            Err(err) => {
                tracing::error!(socket_id = %self.id, "failed to serialize outbound message: {err}");
            }
        }
    }
}

/// Shared state behind one listening server.
pub(crate) struct EngineState {
    pub connections: Arc<DashMap<String, Arc<Connection>>>,
    pub router: Arc<Router>,
    pub channels: Arc<ChannelManager>,
    pub context_factory: Option<ContextFactory>,
    pub config: WsServerConfig,
}

/// Delivery seam for the channel manager over the connection table.
pub(crate) struct ConnectionsSink(pub Arc<DashMap<String, Arc<Connection>>>);

impl SocketSink for ConnectionsSink {
    fn send_to_socket(&self, socket_id: &str, message: &ServerMessage) {
        if let Some(conn) = self.0.get(socket_id) {
            conn.send_json(message);
        }
    }
}

/// Drive one accepted WebSocket until it closes.
pub(crate) async fn handle_socket(
    socket: WebSocket,
    state: Arc<EngineState>,
    remote_addr: Option<SocketAddr>,
) {
    let socket_id = generate_id();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let conn = Arc::new(Connection {
        id: socket_id.clone(),
        remote_addr,
        alive: AtomicBool::new(true),
        outbound: outbound_tx,
        cancel: CancellationToken::new(),
        active_requests: DashMap::new(),
        active_streams: DashMap::new(),
    });
    state.connections.insert(socket_id.clone(), conn.clone());
    tracing::info!(socket_id = %socket_id, remote = ?remote_addr, "websocket connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: everything outbound funnels through one task so concurrent
    // request tasks never interleave partial frames. On cancellation the
    // already-queued frames (a close frame included) are flushed first.
    let writer_cancel = conn.cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                message = outbound_rx.recv() => match message {
                    Some(message) => {
                        let is_close = matches!(message, Message::Close(_));
                        if ws_tx.send(message).await.is_err() || is_close {
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_cancel.cancelled() => {
                    while let Ok(message) = outbound_rx.try_recv() {
                        let is_close = matches!(message, Message::Close(_));
                        if ws_tx.send(message).await.is_err() || is_close {
                            break;
                        }
                    }
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => break,
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => process_frame(&state, &conn, text.as_str()).await,
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => process_frame(&state, &conn, text).await,
                    Err(_) => conn.send_json(&ServerMessage::invalid_envelope(
                        None,
                        "binary frames must contain UTF-8 JSON",
                    )),
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = conn.outbound.send(Message::Pong(payload));
                }
                Some(Ok(Message::Pong(_))) => {
                    conn.alive.store(true, Ordering::SeqCst);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    tracing::debug!(socket_id = %conn.id, "websocket read error: {err}");
                    break;
                }
            },
        }
    }

    state.connections.remove(&socket_id);
    conn.cancel.cancel();
    state.channels.unsubscribe_all(&socket_id);
    let _ = writer.await;
    tracing::info!(socket_id = %socket_id, "websocket disconnected");
}

fn base_context(state: &EngineState, conn: &Connection, request_id: &str) -> Context {
    let info = ConnectionInfo {
        socket_id: conn.id.clone(),
        remote_addr: conn.remote_addr,
    };
    let base = match &state.context_factory {
        Some(factory) => factory(&info),
        None => Context::new(request_id),
    };
    base.with_request_id(request_id)
}

/// A token cancelled when either parent fires (upstream signal from the
/// context factory, or the connection going away).
fn linked_token(upstream: &CancellationToken, connection: &CancellationToken) -> CancellationToken {
    let token = upstream.child_token();
    let conn = connection.clone();
    let watched = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = conn.cancelled() => watched.cancel(),
            _ = watched.cancelled() => {}
        }
    });
    token
}

async fn process_frame(state: &Arc<EngineState>, conn: &Arc<Connection>, text: &str) {
    match InboundFrame::parse(text) {
        Ok(InboundFrame::Channel(request)) => handle_channel_message(state, conn, request).await,
        Ok(InboundFrame::Envelope(raw)) => dispatch_envelope(state, conn, raw),
        Err(err) => conn.send_json(&ServerMessage::from_error(None, &err)),
    }
}

async fn handle_channel_message(
    state: &Arc<EngineState>,
    conn: &Arc<Connection>,
    request: ChannelRequest,
) {
    match request {
        ChannelRequest::Subscribe { id, channel } => {
            let ctx = base_context(state, conn, id.as_deref().unwrap_or(&conn.id));
            match state.channels.subscribe(&conn.id, &channel, &ctx).await {
                Ok(outcome) => conn.send_json(&ServerMessage::Subscribed {
                    id,
                    channel,
                    members: outcome.members,
                }),
                Err(err) => conn.send_json(&ServerMessage::from_error(id, &err)),
            }
        }
        ChannelRequest::Unsubscribe { id, channel } => {
            state.channels.unsubscribe(&conn.id, &channel);
            conn.send_json(&ServerMessage::Unsubscribed { id, channel });
        }
        ChannelRequest::Publish {
            id,
            channel,
            event,
            data,
        } => {
            let ctx = base_context(state, conn, id.as_deref().unwrap_or(&conn.id));
            if let Err(err) = state
                .channels
                .publish(&conn.id, &channel, &event, data, &ctx)
                .await
            {
                conn.send_json(&ServerMessage::from_error(id, &err));
            }
        }
        ChannelRequest::Ping { id } => {
            conn.send_json(&ServerMessage::Pong { id });
        }
    }
}

fn dispatch_envelope(state: &Arc<EngineState>, conn: &Arc<Connection>, raw: Value) {
    let frame_id = raw
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty());

    // The dispatchable shape: a non-empty procedure plus a known type tag.
    let procedure_ok = raw
        .get("procedure")
        .and_then(Value::as_str)
        .is_some_and(|p| !p.is_empty());
    if !procedure_ok || raw.get("type").is_none() {
        conn.send_json(&ServerMessage::invalid_envelope(
            frame_id,
            "envelope requires 'procedure' and 'type'",
        ));
        return;
    }
    let mut envelope: Envelope = match serde_json::from_value(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            conn.send_json(&ServerMessage::invalid_envelope(
                frame_id,
                format!("malformed envelope: {err}"),
            ));
            return;
        }
    };
    if envelope.id.is_empty() {
        envelope.id = generate_id();
    }
    let request_id = envelope.id.clone();
    let procedure = envelope.procedure.clone();

    let base = base_context(state, conn, &request_id);
    let token = linked_token(base.cancellation(), &conn.cancel);
    let ctx = base.with_cancellation(token.clone());
    conn.active_requests.insert(request_id.clone(), token.clone());

    let router = state.router.clone();
    let conn = conn.clone();
    tokio::spawn(async move {
        let task = {
            let conn = conn.clone();
            let request_id = request_id.clone();
            tokio::spawn(async move {
                match router.handle(envelope, ctx).await {
                    RouterResult::Response(env) | RouterResult::Error(env) => conn.send_json(&env),
                    RouterResult::Stream(mut envelopes) => {
                        // The request slot becomes a stream slot.
                        conn.active_requests.remove(&request_id);
                        conn.active_streams.insert(request_id.clone(), token.clone());
                        loop {
                            tokio::select! {
                                _ = token.cancelled() => break,
                                item = envelopes.next() => match item {
                                    Some(env) => conn.send_json(&env),
                                    None => break,
                                },
                            }
                        }
                        conn.active_streams.remove(&request_id);
                    }
                }
            })
        };
        if task.await.is_err() {
            // A panic escaped the router; the client still gets a terminal.
            conn.send_json(&Envelope::error(
                format!("{request_id}:error"),
                procedure,
                &RpcError::internal("handler task failed"),
            ));
        }
        conn.active_requests.remove(&request_id);
    });
}

/// One heartbeat pass: sockets that missed the previous ping are
/// terminated, everyone else is pinged and must pong before the next pass.
pub(crate) async fn heartbeat_sweep(state: &Arc<EngineState>) {
    let mut dead = Vec::new();
    for entry in state.connections.iter() {
        let conn = entry.value();
        if !conn.alive.swap(false, Ordering::SeqCst) {
            dead.push(conn.clone());
        } else {
            let _ = conn.outbound.send(Message::Ping(Default::default()));
        }
    }
    for conn in dead {
        tracing::info!(socket_id = %conn.id, "terminating unresponsive socket");
        state.connections.remove(&conn.id);
        conn.cancel.cancel();
        state.channels.unsubscribe_all(&conn.id);
    }
}
