//! Pluggable payload codecs.
//!
//! The core moves payloads around as [`serde_json::Value`]; codecs translate
//! between those values and wire bytes at the transport boundary. JSON and a
//! line-oriented text codec ship here; anything richer (CSV, msgpack, ...)
//! is a collaborator implementing [`Codec`].

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{ErrorCode, RpcError};

pub trait Codec: Send + Sync + 'static {
    /// MIME type this codec handles.
    fn content_type(&self) -> &'static str;

    fn encode(&self, value: &Value) -> Result<Vec<u8>, RpcError>;

    fn decode(&self, bytes: &[u8]) -> Result<Value, RpcError>;
}

pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, RpcError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, RpcError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Plain-text codec: strings pass through, everything else is rendered as
/// JSON text. Decoding always yields a string value.
pub struct TextCodec;

impl Codec for TextCodec {
    fn content_type(&self) -> &'static str {
        "text/plain"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, RpcError> {
        match value {
            Value::String(s) => Ok(s.clone().into_bytes()),
            other => Ok(other.to_string().into_bytes()),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, RpcError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| RpcError::new(ErrorCode::InvalidType, format!("invalid utf-8: {e}")))?;
        Ok(Value::String(text.to_string()))
    }
}

/// Codecs keyed by content type. JSON and text are pre-registered.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<&'static str, Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            codecs: HashMap::new(),
        };
        registry.register(JsonCodec);
        registry.register(TextCodec);
        registry
    }

    pub fn register(&mut self, codec: impl Codec) {
        let codec = Arc::new(codec);
        self.codecs.insert(codec.content_type(), codec);
    }

    pub fn get(&self, content_type: &str) -> Option<Arc<dyn Codec>> {
        // Ignore parameters such as `; charset=utf-8`.
        let base = content_type.split(';').next().unwrap_or(content_type).trim();
        self.codecs.get(base).cloned()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}
