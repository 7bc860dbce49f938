//! Pusher-style channel manager: public/private/presence subscriptions,
//! presence member tracking, and broadcast fan-out.
//!
//! All channel state lives behind one manager-wide lock; hooks run outside
//! it and deliveries happen against a snapshot of the subscriber set, so
//! per-channel broadcast order is the lock-acquisition order.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value;

use manifold_core::{Context, RpcError};

use crate::protocol::{MemberInfo, ServerMessage};

/// Channel flavor, derived from the name prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelType {
    Public,
    Private,
    Presence,
}

impl ChannelType {
    pub fn of(name: &str) -> ChannelType {
        if name.starts_with("presence-") {
            ChannelType::Presence
        } else if name.starts_with("private-") {
            ChannelType::Private
        } else {
            ChannelType::Public
        }
    }
}

/// Delivery seam: the engine implements this over its connection table.
pub trait SocketSink: Send + Sync + 'static {
    fn send_to_socket(&self, socket_id: &str, message: &ServerMessage);
}

type HookFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Decides whether a socket may join a channel. Without a hook, only
/// public channels are joinable.
pub type AuthorizeFn = Arc<dyn Fn(&str, &str, &Context) -> HookFuture<bool> + Send + Sync>;
/// Produces the presence `info` object for a joining member.
pub type PresenceDataFn = Arc<dyn Fn(&str, &str, &Context) -> HookFuture<Value> + Send + Sync>;
/// Vetoes client-originated publishes: `(socket, channel, event, data, ctx)`.
pub type PublishHookFn =
    Arc<dyn Fn(&str, &str, &str, &Value, &Context) -> HookFuture<bool> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ChannelHooks {
    pub authorize: Option<AuthorizeFn>,
    pub presence_data: Option<PresenceDataFn>,
    pub on_publish: Option<PublishHookFn>,
}

impl ChannelHooks {
    pub fn authorize<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str, &Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.authorize = Some(Arc::new(move |socket, channel, ctx| Box::pin(f(socket, channel, ctx))));
        self
    }

    pub fn presence_data<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str, &Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        self.presence_data = Some(Arc::new(move |socket, channel, ctx| Box::pin(f(socket, channel, ctx))));
        self
    }

    pub fn on_publish<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str, &str, &Value, &Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.on_publish = Some(Arc::new(move |socket, channel, event, data, ctx| {
            Box::pin(f(socket, channel, event, data, ctx))
        }));
        self
    }
}

struct Member {
    user_id: Option<String>,
    info: Value,
    joined_at: Instant,
}

impl Member {
    fn to_info(&self, socket_id: &str) -> MemberInfo {
        MemberInfo {
            id: socket_id.to_string(),
            user_id: self.user_id.clone(),
            info: self.info.clone(),
        }
    }
}

struct ChannelState {
    channel_type: ChannelType,
    subscribers: HashSet<String>,
    members: HashMap<String, Member>,
    #[allow(dead_code)]
    created_at: Instant,
}

impl ChannelState {
    fn new(channel_type: ChannelType) -> Self {
        Self {
            channel_type,
            subscribers: HashSet::new(),
            members: HashMap::new(),
            created_at: Instant::now(),
        }
    }

    fn member_list(&self) -> Vec<MemberInfo> {
        let mut members: Vec<_> = self
            .members
            .iter()
            .map(|(socket_id, member)| (member.joined_at, member.to_info(socket_id)))
            .collect();
        members.sort_by_key(|(joined_at, _)| *joined_at);
        members.into_iter().map(|(_, info)| info).collect()
    }
}

#[derive(Default)]
struct Maps {
    channels: HashMap<String, ChannelState>,
    by_socket: HashMap<String, HashSet<String>>,
}

/// The outcome of a successful subscribe.
#[derive(Debug)]
pub struct Subscribed {
    /// Full member list (presence channels only), including the joiner.
    pub members: Option<Vec<MemberInfo>>,
    /// False when the socket was already subscribed.
    pub newly_joined: bool,
}

/// Channel subscription state and broadcast fan-out.
///
/// A channel exists exactly while it has subscribers: it is created on the
/// first subscribe and dropped on the last unsubscribe. On presence
/// channels the member map always mirrors the subscriber set.
pub struct ChannelManager {
    inner: Mutex<Maps>,
    hooks: ChannelHooks,
    sink: Arc<dyn SocketSink>,
}

impl ChannelManager {
    pub fn new(sink: Arc<dyn SocketSink>, hooks: ChannelHooks) -> Self {
        Self {
            inner: Mutex::new(Maps::default()),
            hooks,
            sink,
        }
    }

    /// Subscribe a socket to a channel.
    ///
    /// Authorization: the configured hook decides; with no hook, only
    /// public channels are joinable. Presence joins compute member info via
    /// the `presence_data` hook and notify existing subscribers with a
    /// `member_added` event.
    pub async fn subscribe(
        &self,
        socket_id: &str,
        channel: &str,
        ctx: &Context,
    ) -> Result<Subscribed, RpcError> {
        let channel_type = ChannelType::of(channel);

        let authorized = match &self.hooks.authorize {
            Some(hook) => hook(socket_id, channel, ctx).await,
            None => channel_type == ChannelType::Public,
        };
        if !authorized {
            return Err(RpcError::permission_denied(format!(
                "subscription to '{channel}' denied"
            )));
        }

        let presence_info = if channel_type == ChannelType::Presence {
            match &self.hooks.presence_data {
                Some(hook) => Some(hook(socket_id, channel, ctx).await),
                None => Some(Value::Object(Default::default())),
            }
        } else {
            None
        };

        let (outcome, notify) = {
            let mut maps = self.inner.lock().expect("channel lock poisoned");
            let state = maps
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| ChannelState::new(channel_type));

            if state.subscribers.contains(socket_id) {
                let members = (channel_type == ChannelType::Presence).then(|| state.member_list());
                (
                    Subscribed {
                        members,
                        newly_joined: false,
                    },
                    None,
                )
            } else {
                state.subscribers.insert(socket_id.to_string());
                let mut notify = None;
                let members = presence_info.map(|info| {
                    let member = Member {
                        user_id: ctx.auth().principal.clone(),
                        info,
                        joined_at: Instant::now(),
                    };
                    let added = member.to_info(socket_id);
                    // Notify everyone already in the channel, not the joiner.
                    let recipients: Vec<String> = state
                        .subscribers
                        .iter()
                        .filter(|s| s.as_str() != socket_id)
                        .cloned()
                        .collect();
                    state.members.insert(socket_id.to_string(), member);
                    notify = Some((recipients, added));
                    state.member_list()
                });
                maps.by_socket
                    .entry(socket_id.to_string())
                    .or_default()
                    .insert(channel.to_string());
                (
                    Subscribed {
                        members,
                        newly_joined: true,
                    },
                    notify,
                )
            }
        };

        if let Some((recipients, added)) = notify {
            let message = ServerMessage::Event {
                channel: channel.to_string(),
                event: "member_added".to_string(),
                data: serde_json::to_value(&added).unwrap_or(Value::Null),
            };
            for recipient in recipients {
                self.sink.send_to_socket(&recipient, &message);
            }
            tracing::debug!(socket_id, channel, "presence member added");
        }

        Ok(outcome)
    }

    /// Remove a socket from a channel. Returns `false` when it was not
    /// subscribed. The channel is dropped once its last subscriber leaves.
    pub fn unsubscribe(&self, socket_id: &str, channel: &str) -> bool {
        let notify = {
            let mut maps = self.inner.lock().expect("channel lock poisoned");
            let Some(state) = maps.channels.get_mut(channel) else {
                return false;
            };
            if !state.subscribers.remove(socket_id) {
                return false;
            }
            let removed = state.members.remove(socket_id);
            let recipients: Vec<String> = state.subscribers.iter().cloned().collect();
            if state.subscribers.is_empty() {
                maps.channels.remove(channel);
            }
            if let Some(set) = maps.by_socket.get_mut(socket_id) {
                set.remove(channel);
                if set.is_empty() {
                    maps.by_socket.remove(socket_id);
                }
            }
            removed.map(|member| (recipients, member.user_id))
        };

        if let Some((recipients, user_id)) = notify {
            let mut data = serde_json::json!({ "id": socket_id });
            if let Some(user_id) = user_id {
                data["userId"] = Value::String(user_id);
            }
            let message = ServerMessage::Event {
                channel: channel.to_string(),
                event: "member_removed".to_string(),
                data,
            };
            for recipient in recipients {
                self.sink.send_to_socket(&recipient, &message);
            }
            tracing::debug!(socket_id, channel, "presence member removed");
        }
        true
    }

    /// Deliver an event to every subscriber except `except`. Unknown
    /// channels are a no-op.
    pub fn broadcast(&self, channel: &str, event: &str, data: Value, except: Option<&str>) {
        let recipients: Vec<String> = {
            let maps = self.inner.lock().expect("channel lock poisoned");
            let Some(state) = maps.channels.get(channel) else {
                return;
            };
            state
                .subscribers
                .iter()
                .filter(|s| Some(s.as_str()) != except)
                .cloned()
                .collect()
        };
        let message = ServerMessage::Event {
            channel: channel.to_string(),
            event: event.to_string(),
            data,
        };
        for recipient in recipients {
            self.sink.send_to_socket(&recipient, &message);
        }
    }

    /// Client-originated publish. The caller must already be subscribed;
    /// the `on_publish` hook may veto. The sender is excluded from the
    /// fan-out.
    pub async fn publish(
        &self,
        socket_id: &str,
        channel: &str,
        event: &str,
        data: Value,
        ctx: &Context,
    ) -> Result<(), RpcError> {
        let subscribed = {
            let maps = self.inner.lock().expect("channel lock poisoned");
            maps.channels
                .get(channel)
                .is_some_and(|state| state.subscribers.contains(socket_id))
        };
        if !subscribed {
            return Err(RpcError::permission_denied(format!(
                "publish to '{channel}' requires a subscription"
            )));
        }
        if let Some(hook) = &self.hooks.on_publish {
            if !hook(socket_id, channel, event, &data, ctx).await {
                return Err(RpcError::permission_denied(format!(
                    "publish to '{channel}' rejected"
                )));
            }
        }
        self.broadcast(channel, event, data, Some(socket_id));
        Ok(())
    }

    /// Tear down every subscription a socket holds (disconnect path).
    pub fn unsubscribe_all(&self, socket_id: &str) {
        // Snapshot first: unsubscribe mutates the index we iterate.
        let channels: Vec<String> = {
            let maps = self.inner.lock().expect("channel lock poisoned");
            maps.by_socket
                .get(socket_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };
        for channel in channels {
            self.unsubscribe(socket_id, &channel);
        }
    }

    // ── Introspection ────────────────────────────────────────────────────

    pub fn channel_count(&self) -> usize {
        self.inner.lock().expect("channel lock poisoned").channels.len()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("channel lock poisoned")
            .channels
            .keys()
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .expect("channel lock poisoned")
            .channels
            .get(channel)
            .map(|s| s.subscribers.len())
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self, socket_id: &str, channel: &str) -> bool {
        self.inner
            .lock()
            .expect("channel lock poisoned")
            .channels
            .get(channel)
            .is_some_and(|s| s.subscribers.contains(socket_id))
    }

    /// Member list of a presence channel, in join order.
    pub fn members(&self, channel: &str) -> Option<Vec<MemberInfo>> {
        let maps = self.inner.lock().expect("channel lock poisoned");
        let state = maps.channels.get(channel)?;
        (state.channel_type == ChannelType::Presence).then(|| state.member_list())
    }

    /// Channels a socket is subscribed to.
    pub fn socket_channels(&self, socket_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .expect("channel lock poisoned")
            .by_socket
            .get(socket_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_type_from_prefix() {
        assert_eq!(ChannelType::of("chat-lobby"), ChannelType::Public);
        assert_eq!(ChannelType::of("private-billing"), ChannelType::Private);
        assert_eq!(ChannelType::of("presence-room-42"), ChannelType::Presence);
    }
}
