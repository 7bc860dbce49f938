use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

/// Envelope type tag. The serialized form is the wire string
/// (`request`, `stream:chunk`, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "request")]
    Request,
    #[serde(rename = "response")]
    Response,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "stream:start")]
    StreamStart,
    #[serde(rename = "stream:chunk")]
    StreamChunk,
    #[serde(rename = "stream:end")]
    StreamEnd,
    #[serde(rename = "event")]
    Event,
}

/// The transport-agnostic unit transferred across the boundary of the core.
///
/// The `id` is unique per logical request within a connection and is
/// preserved on every envelope emitted for that request: the response, every
/// stream chunk, the terminating `stream:end`, or the error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Empty when the client omitted it; transports assign a fresh id.
    #[serde(default)]
    pub id: String,
    pub procedure: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Envelope {
    /// A fresh request envelope.
    pub fn request(id: impl Into<String>, procedure: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            procedure: procedure.into(),
            kind: EnvelopeKind::Request,
            payload,
            metadata: HashMap::new(),
        }
    }

    /// An event envelope (fire-and-forget).
    pub fn event(id: impl Into<String>, procedure: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: EnvelopeKind::Event,
            ..Self::request(id, procedure, payload)
        }
    }

    /// The response to a request, carrying the same id and procedure.
    pub fn response_to(request: &Envelope, payload: Value) -> Self {
        Self {
            id: request.id.clone(),
            procedure: request.procedure.clone(),
            kind: EnvelopeKind::Response,
            payload,
            metadata: HashMap::new(),
        }
    }

    /// A stream chunk carrying the initiating request's id.
    pub fn stream_chunk(id: impl Into<String>, procedure: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            procedure: procedure.into(),
            kind: EnvelopeKind::StreamChunk,
            payload,
            metadata: HashMap::new(),
        }
    }

    /// The terminal `stream:end` marker for a stream.
    pub fn stream_end(id: impl Into<String>, procedure: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            procedure: procedure.into(),
            kind: EnvelopeKind::StreamEnd,
            payload: Value::Null,
            metadata: HashMap::new(),
        }
    }

    /// An error envelope for the given request id.
    pub fn error(id: impl Into<String>, procedure: impl Into<String>, err: &RpcError) -> Self {
        Self {
            id: id.into(),
            procedure: procedure.into(),
            kind: EnvelopeKind::Error,
            payload: err.to_payload(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EnvelopeKind::Response | EnvelopeKind::Error | EnvelopeKind::StreamEnd
        )
    }
}
