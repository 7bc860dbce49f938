//! A chat backend on the Manifold runtime: a couple of procedures, a
//! stream, an audit event, and presence channels, all over one WebSocket
//! endpoint.
//!
//! Try it with a WebSocket client:
//!
//! ```text
//! {"id":"1","procedure":"rooms.list","type":"request"}
//! {"id":"2","type":"subscribe","channel":"presence-room-lobby"}
//! {"id":"3","type":"publish","channel":"presence-room-lobby","event":"message","data":{"text":"hello"}}
//! ```

use std::time::Duration;

use serde_json::{json, Value};

use manifold::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,demo_chat=debug".into()),
        )
        .init();

    let mut registry = Registry::new();

    registry.register_procedure(
        "rooms.list",
        |_payload, _ctx| async move {
            Ok(json!([
                { "name": "lobby", "topic": "general chatter" },
                { "name": "rust", "topic": "ownership and friends" },
            ]))
        },
        ProcedureOptions::default()
            .summary("List chat rooms")
            .intercept(Cached::ttl(Duration::from_secs(10)))
            .intercept(Dedup::new()),
    )?;

    registry.register_procedure(
        "rooms.topic",
        |payload: Value, ctx: Context| async move {
            // Nested call: resolve the topic through the room list.
            let rooms = ctx.call("rooms.list", Value::Null).await?;
            let name = payload.get("name").and_then(Value::as_str).unwrap_or("lobby");
            rooms
                .as_array()
                .and_then(|rooms| rooms.iter().find(|r| r["name"] == name))
                .map(|room| room["topic"].clone())
                .ok_or_else(|| RpcError::not_found(format!("room '{name}'")))
        },
        ProcedureOptions::default().summary("Topic of one room"),
    )?;

    registry.register_stream(
        "rooms.ticker",
        |_payload, _ctx| async move {
            let items = futures_util::stream::iter((0..5).map(|i| Ok(json!({ "tick": i }))));
            Ok(Box::pin(items) as PayloadStream)
        },
        StreamOptions::default().summary("A short demo ticker"),
    )?;

    registry.register_event(
        "audit.message",
        |payload, _ctx| async move {
            tracing::info!(payload = %payload, "audit event recorded");
            Ok(())
        },
        EventOptions::default(),
    )?;

    let router = Router::builder(registry)
        .intercept(Logged::debug())
        .intercept(RateLimit::per_window(100, Duration::from_secs(60)))
        .event_dispatch(EventDispatcher::new())
        .build();

    let server = WsServer::builder(router)
        .host("127.0.0.1")
        .port(9100)
        .authorize_channels(|_socket, _channel, ctx: &Context| {
            // Presence and private channels need an authenticated caller.
            let allowed = ctx.auth().authenticated;
            async move { allowed }
        })
        .presence_data(|socket, _channel, _ctx| {
            let name = format!("guest-{}", &socket[..6.min(socket.len())]);
            async move { json!({ "name": name }) }
        })
        .context_factory(|info| {
            Context::new(info.socket_id.clone())
                .with_auth(AuthInfo::principal(format!("anon:{}", info.socket_id)))
        })
        .start()
        .await?;

    tracing::info!(addr = %server.local_addr(), "demo chat server up");
    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}
