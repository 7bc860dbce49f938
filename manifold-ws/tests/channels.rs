//! Channel manager behavior with a recording delivery sink.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use manifold_core::{AuthInfo, Context, ErrorCode};
use manifold_ws::{ChannelHooks, ChannelManager, ServerMessage, SocketSink};

/// Captures every delivered message as `(socket_id, json)`.
#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<(String, Value)>>,
}

impl RecordingSink {
    fn sent(&self) -> Vec<(String, Value)> {
        self.messages.lock().unwrap().clone()
    }

    fn sent_to(&self, socket_id: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|(to, _)| to == socket_id)
            .map(|(_, msg)| msg)
            .collect()
    }

    fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }
}

impl SocketSink for RecordingSink {
    fn send_to_socket(&self, socket_id: &str, message: &ServerMessage) {
        self.messages
            .lock()
            .unwrap()
            .push((socket_id.to_string(), serde_json::to_value(message).unwrap()));
    }
}

fn manager(hooks: ChannelHooks) -> (Arc<ChannelManager>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    (Arc::new(ChannelManager::new(sink.clone(), hooks)), sink)
}

fn allow_all() -> ChannelHooks {
    ChannelHooks::default().authorize(|_, _, _| async { true })
}

fn ctx(id: &str) -> Context {
    Context::new(id)
}

#[tokio::test]
async fn public_channels_are_joinable_without_hooks() {
    let (manager, _sink) = manager(ChannelHooks::default());
    let outcome = manager.subscribe("a", "chat-lobby", &ctx("1")).await.unwrap();
    assert!(outcome.newly_joined);
    assert!(outcome.members.is_none());
    assert!(manager.is_subscribed("a", "chat-lobby"));
}

#[tokio::test]
async fn private_channels_are_denied_by_default() {
    let (manager, _sink) = manager(ChannelHooks::default());
    for channel in ["private-billing", "presence-room-1"] {
        let err = manager.subscribe("a", channel, &ctx("1")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
        assert_eq!(err.status(), 403);
    }
    assert_eq!(manager.channel_count(), 0);
}

#[tokio::test]
async fn authorize_hook_grants_and_denies() {
    let hooks = ChannelHooks::default().authorize(|_, channel, _| {
        let allowed = channel.ends_with("-ok");
        async move { allowed }
    });
    let (manager, _sink) = manager(hooks);

    manager.subscribe("a", "private-room-ok", &ctx("1")).await.unwrap();
    let err = manager.subscribe("a", "private-room-no", &ctx("2")).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PermissionDenied);
}

#[tokio::test]
async fn channel_exists_exactly_while_subscribed() {
    let (manager, _sink) = manager(ChannelHooks::default());
    assert_eq!(manager.channel_count(), 0);

    manager.subscribe("a", "chat-lobby", &ctx("1")).await.unwrap();
    manager.subscribe("b", "chat-lobby", &ctx("2")).await.unwrap();
    assert_eq!(manager.channel_count(), 1);
    assert_eq!(manager.subscriber_count("chat-lobby"), 2);

    manager.unsubscribe("a", "chat-lobby");
    assert_eq!(manager.subscriber_count("chat-lobby"), 1);

    manager.unsubscribe("b", "chat-lobby");
    assert_eq!(manager.channel_count(), 0);
}

#[tokio::test]
async fn resubscribe_is_idempotent() {
    let (manager, _sink) = manager(allow_all());
    let first = manager.subscribe("a", "presence-room", &ctx("1")).await.unwrap();
    assert!(first.newly_joined);

    let second = manager.subscribe("a", "presence-room", &ctx("2")).await.unwrap();
    assert!(!second.newly_joined);
    // The repeat subscribe still reports the member list.
    assert_eq!(second.members.unwrap().len(), 1);
    assert_eq!(manager.subscriber_count("presence-room"), 1);
}

#[tokio::test]
async fn presence_join_notifies_existing_subscribers_only() {
    let hooks = allow_all().presence_data(|socket, _, _| {
        let name = format!("user-{socket}");
        async move { serde_json::json!({ "name": name }) }
    });
    let (manager, sink) = manager(hooks);

    manager.subscribe("b", "presence-room-42", &ctx("1")).await.unwrap();
    sink.clear();

    let ctx_a = ctx("2").with_auth(AuthInfo::principal("ada"));
    let outcome = manager.subscribe("a", "presence-room-42", &ctx_a).await.unwrap();

    // The joiner gets the full member list, including itself.
    let members = outcome.members.unwrap();
    assert_eq!(members.len(), 2);
    assert!(members.iter().any(|m| m.id == "a" && m.info["name"] == "user-a"));

    // Only the existing subscriber was notified.
    let to_b = sink.sent_to("b");
    assert_eq!(to_b.len(), 1);
    assert_eq!(to_b[0]["type"], "event");
    assert_eq!(to_b[0]["channel"], "presence-room-42");
    assert_eq!(to_b[0]["event"], "member_added");
    assert_eq!(to_b[0]["data"]["id"], "a");
    assert_eq!(to_b[0]["data"]["userId"], "ada");
    assert_eq!(to_b[0]["data"]["info"]["name"], "user-a");
    assert!(sink.sent_to("a").is_empty());
}

#[tokio::test]
async fn presence_members_mirror_subscribers() {
    let (manager, _sink) = manager(allow_all());
    for socket in ["a", "b", "c"] {
        manager.subscribe(socket, "presence-room", &ctx(socket)).await.unwrap();
    }
    let members = manager.members("presence-room").unwrap();
    assert_eq!(members.len(), manager.subscriber_count("presence-room"));

    manager.unsubscribe("b", "presence-room");
    let members = manager.members("presence-room").unwrap();
    assert_eq!(members.len(), 2);
    assert!(members.iter().all(|m| m.id != "b"));
}

#[tokio::test]
async fn presence_leave_broadcasts_member_removed() {
    let (manager, sink) = manager(allow_all());
    let ctx_a = ctx("1").with_auth(AuthInfo::principal("ada"));
    manager.subscribe("a", "presence-room", &ctx_a).await.unwrap();
    manager.subscribe("b", "presence-room", &ctx("2")).await.unwrap();
    sink.clear();

    manager.unsubscribe("a", "presence-room");

    let to_b = sink.sent_to("b");
    assert_eq!(to_b.len(), 1);
    assert_eq!(to_b[0]["event"], "member_removed");
    assert_eq!(to_b[0]["data"]["id"], "a");
    assert_eq!(to_b[0]["data"]["userId"], "ada");
}

#[tokio::test]
async fn broadcast_excludes_the_given_socket() {
    let (manager, sink) = manager(ChannelHooks::default());
    for socket in ["a", "b", "c"] {
        manager.subscribe(socket, "chat-lobby", &ctx(socket)).await.unwrap();
    }
    sink.clear();

    manager.broadcast("chat-lobby", "message", serde_json::json!({ "text": "hi" }), Some("a"));

    assert!(sink.sent_to("a").is_empty());
    for socket in ["b", "c"] {
        let msgs = sink.sent_to(socket);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["event"], "message");
        assert_eq!(msgs[0]["data"]["text"], "hi");
    }
}

#[tokio::test]
async fn broadcast_to_unknown_channel_is_a_no_op() {
    let (manager, sink) = manager(ChannelHooks::default());
    manager.broadcast("ghost", "message", Value::Null, None);
    assert!(sink.sent().is_empty());
}

#[tokio::test]
async fn publish_requires_subscription() {
    let (manager, _sink) = manager(ChannelHooks::default());
    manager.subscribe("a", "chat-lobby", &ctx("1")).await.unwrap();

    let err = manager
        .publish("c", "chat-lobby", "message", Value::Null, &ctx("2"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PermissionDenied);
    assert_eq!(err.status(), 403);
}

#[tokio::test]
async fn publish_excludes_the_sender() {
    let (manager, sink) = manager(ChannelHooks::default());
    manager.subscribe("a", "chat-lobby", &ctx("1")).await.unwrap();
    manager.subscribe("b", "chat-lobby", &ctx("2")).await.unwrap();
    sink.clear();

    manager
        .publish("a", "chat-lobby", "message", serde_json::json!({ "n": 1 }), &ctx("3"))
        .await
        .unwrap();

    assert!(sink.sent_to("a").is_empty());
    assert_eq!(sink.sent_to("b").len(), 1);
}

#[tokio::test]
async fn on_publish_hook_can_veto() {
    let hooks = ChannelHooks::default().on_publish(|_, _, event, _, _| {
        let allowed = event != "forbidden";
        async move { allowed }
    });
    let (manager, sink) = manager(hooks);
    manager.subscribe("a", "chat-lobby", &ctx("1")).await.unwrap();
    manager.subscribe("b", "chat-lobby", &ctx("2")).await.unwrap();
    sink.clear();

    let err = manager
        .publish("a", "chat-lobby", "forbidden", Value::Null, &ctx("3"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PermissionDenied);
    assert!(sink.sent().is_empty());

    manager
        .publish("a", "chat-lobby", "message", Value::Null, &ctx("4"))
        .await
        .unwrap();
    assert_eq!(sink.sent_to("b").len(), 1);
}

#[tokio::test]
async fn disconnect_cleans_up_every_subscription() {
    let (manager, sink) = manager(allow_all());
    manager.subscribe("a", "chat-lobby", &ctx("1")).await.unwrap();
    manager.subscribe("a", "presence-room", &ctx("2")).await.unwrap();
    manager.subscribe("b", "presence-room", &ctx("3")).await.unwrap();
    sink.clear();

    manager.unsubscribe_all("a");

    assert!(manager.socket_channels("a").is_empty());
    // chat-lobby lost its only subscriber and was dropped.
    assert_eq!(manager.channel_names(), vec!["presence-room".to_string()]);
    // b saw the presence leave.
    let to_b = sink.sent_to("b");
    assert_eq!(to_b.len(), 1);
    assert_eq!(to_b[0]["event"], "member_removed");
}

#[tokio::test]
async fn reverse_index_matches_subscriber_sets() {
    let (manager, _sink) = manager(allow_all());
    manager.subscribe("a", "chat-lobby", &ctx("1")).await.unwrap();
    manager.subscribe("a", "presence-room", &ctx("2")).await.unwrap();
    manager.subscribe("b", "chat-lobby", &ctx("3")).await.unwrap();

    let mut a_channels = manager.socket_channels("a");
    a_channels.sort();
    assert_eq!(a_channels, ["chat-lobby", "presence-room"]);
    assert_eq!(manager.socket_channels("b"), ["chat-lobby"]);
    assert_eq!(manager.subscriber_count("chat-lobby"), 2);
}
