//! Wire messages for the channel protocol layered next to envelopes.
//!
//! A frame is either a channel-protocol message (recognized by its `type`
//! field) or an envelope handed to the router. Parsing never fails hard: a
//! malformed frame becomes an `INVALID_ENVELOPE` reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use manifold_core::{ErrorCode, RpcError};

/// Channel-protocol message from a client.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelRequest {
    Subscribe {
        #[serde(default)]
        id: Option<String>,
        channel: String,
    },
    Unsubscribe {
        #[serde(default)]
        id: Option<String>,
        channel: String,
    },
    Publish {
        #[serde(default)]
        id: Option<String>,
        channel: String,
        event: String,
        #[serde(default)]
        data: Value,
    },
    Ping {
        #[serde(default)]
        id: Option<String>,
    },
}

/// Identity and info of one presence-channel member.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub info: Value,
}

/// Message from the server to a client.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Subscribed {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        channel: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        members: Option<Vec<MemberInfo>>,
    },
    Unsubscribed {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        channel: String,
    },
    /// Channel broadcast; carries no id.
    Event {
        channel: String,
        event: String,
        data: Value,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        code: ErrorCode,
        status: u16,
        message: String,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl ServerMessage {
    pub fn from_error(id: Option<String>, err: &RpcError) -> Self {
        ServerMessage::Error {
            id,
            code: err.code,
            status: err.status(),
            message: err.message.clone(),
        }
    }

    pub fn invalid_envelope(id: Option<String>, message: impl Into<String>) -> Self {
        Self::from_error(id, &RpcError::new(ErrorCode::InvalidEnvelope, message))
    }
}

/// One parsed inbound frame.
#[derive(Debug)]
pub enum InboundFrame {
    Channel(ChannelRequest),
    /// Raw envelope value; the engine validates `procedure`/`type` before
    /// constructing an [`Envelope`](manifold_core::Envelope).
    Envelope(Value),
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<InboundFrame, RpcError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| RpcError::new(ErrorCode::InvalidEnvelope, format!("frame is not valid JSON: {e}")))?;
        let kind = value.get("type").and_then(Value::as_str);
        match kind {
            Some("subscribe" | "unsubscribe" | "publish" | "ping") => {
                let request = serde_json::from_value(value).map_err(|e| {
                    RpcError::new(ErrorCode::InvalidEnvelope, format!("malformed channel message: {e}"))
                })?;
                Ok(InboundFrame::Channel(request))
            }
            _ => Ok(InboundFrame::Envelope(value)),
        }
    }
}
