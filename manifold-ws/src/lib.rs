//! WebSocket transport for the Manifold runtime.
//!
//! One listening server exposes the whole registry: request/response
//! envelopes, streams, events, and the Pusher-style channel subsystem
//! (public/private/presence subscriptions with broadcast fan-out) all ride
//! a single connection.

pub mod channels;
pub mod config;
mod engine;
pub mod protocol;
pub mod server;

pub use channels::{
    AuthorizeFn, ChannelHooks, ChannelManager, ChannelType, PresenceDataFn, PublishHookFn,
    SocketSink, Subscribed,
};
pub use config::WsServerConfig;
pub use engine::{ConnectionInfo, ContextFactory};
pub use protocol::{ChannelRequest, InboundFrame, MemberInfo, ServerMessage};
pub use server::{WsServer, WsServerBuilder};
