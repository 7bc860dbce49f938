//! The listening server: accept loop, heartbeat, and graceful shutdown.

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use manifold_core::{Context, Router};

use crate::channels::{ChannelHooks, ChannelManager};
use crate::config::WsServerConfig;
use crate::engine::{self, ConnectionInfo, ConnectionsSink, ContextFactory, EngineState};

/// Builder for a [`WsServer`].
pub struct WsServerBuilder {
    config: WsServerConfig,
    router: Arc<Router>,
    hooks: ChannelHooks,
    context_factory: Option<ContextFactory>,
}

impl WsServerBuilder {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            config: WsServerConfig::default(),
            router,
            hooks: ChannelHooks::default(),
            context_factory: None,
        }
    }

    pub fn config(mut self, config: WsServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.path = path.into();
        self
    }

    pub fn max_payload_size(mut self, bytes: usize) -> Self {
        self.config.max_payload_size = bytes;
        self
    }

    /// Heartbeat cadence; `Duration::ZERO` disables the heartbeat.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Decide channel subscriptions. Without a hook only public channels
    /// are joinable.
    pub fn authorize_channels<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str, &Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.hooks = self.hooks.authorize(f);
        self
    }

    /// Compute the presence `info` object for joining members.
    pub fn presence_data<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str, &Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        self.hooks = self.hooks.presence_data(f);
        self
    }

    /// Veto client-originated publishes.
    pub fn on_publish<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str, &str, &Value, &Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.hooks = self.hooks.on_publish(f);
        self
    }

    /// Seed per-request contexts (auth, tracing, upstream cancellation)
    /// from connection information.
    pub fn context_factory<F>(mut self, f: F) -> Self
    where
        F: Fn(&ConnectionInfo) -> Context + Send + Sync + 'static,
    {
        self.context_factory = Some(Arc::new(f));
        self
    }

    /// Bind the listener and start serving.
    pub async fn start(self) -> std::io::Result<WsServer> {
        let connections = Arc::new(DashMap::new());
        let channels = Arc::new(ChannelManager::new(
            Arc::new(ConnectionsSink(connections.clone())),
            self.hooks,
        ));
        let state = Arc::new(EngineState {
            connections,
            router: self.router,
            channels,
            context_factory: self.context_factory,
            config: self.config,
        });

        let listener =
            tokio::net::TcpListener::bind((state.config.host.as_str(), state.config.port)).await?;
        let local_addr = listener.local_addr()?;

        let app = axum::Router::new()
            .route(&state.config.path, get(ws_upgrade))
            .with_state(state.clone());

        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        let server_task = tokio::spawn(
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(serve_shutdown.cancelled_owned())
            .into_future(),
        );

        let heartbeat_task = match state.config.heartbeat_interval_ms {
            0 => None,
            interval_ms => {
                let state = state.clone();
                let shutdown = shutdown.clone();
                Some(tokio::spawn(async move {
                    let interval = Duration::from_millis(interval_ms);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(interval) => engine::heartbeat_sweep(&state).await,
                        }
                    }
                }))
            }
        };

        tracing::info!(addr = %local_addr, path = %state.config.path, "websocket server listening");
        Ok(WsServer {
            state,
            local_addr,
            shutdown,
            server_task,
            heartbeat_task,
        })
    }
}

/// A running WebSocket server.
pub struct WsServer {
    state: Arc<EngineState>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    server_task: JoinHandle<std::io::Result<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl WsServer {
    pub fn builder(router: Arc<Router>) -> WsServerBuilder {
        WsServerBuilder::new(router)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }

    /// The channel manager, for server-side broadcasts.
    pub fn channels(&self) -> Arc<ChannelManager> {
        self.state.channels.clone()
    }

    /// Stop the heartbeat, tell every client we are going away (1001),
    /// drop all connections, and wait for the listener to close.
    pub async fn shutdown(self) {
        tracing::info!(addr = %self.local_addr, "websocket server shutting down");
        self.shutdown.cancel();
        if let Some(heartbeat) = self.heartbeat_task {
            let _ = heartbeat.await;
        }

        for entry in self.state.connections.iter() {
            let conn = entry.value();
            let _ = conn.outbound.send(Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: "server shutting down".into(),
            })));
            conn.cancel.cancel();
        }
        self.state.connections.clear();

        if let Err(err) = self.server_task.await {
            tracing::warn!("server task ended abnormally: {err}");
        }
    }
}

async fn ws_upgrade(
    State(state): State<Arc<EngineState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let max_payload = state.config.max_payload_size;
    ws.max_message_size(max_payload)
        .on_upgrade(move |socket| engine::handle_socket(socket, state, Some(remote_addr)))
}
