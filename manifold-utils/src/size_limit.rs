use futures_util::future::BoxFuture;
use serde_json::Value;

use manifold_core::{
    Context, Envelope, EnvelopeInterceptor, ErrorCode, HandlerOutput, Next, RpcError,
};

const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Rejects oversized payloads (and optionally responses) with
/// `RESOURCE_EXHAUSTED`.
///
/// Sizes are estimated from the JSON serialization length, which matches
/// what the transport would put on the wire.
pub struct SizeLimit {
    max_payload: usize,
    max_response: Option<usize>,
}

impl SizeLimit {
    /// Default limit: 1 MiB request payloads, unlimited responses.
    pub fn new() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_response: None,
        }
    }

    pub fn max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    pub fn max_response(mut self, bytes: usize) -> Self {
        self.max_response = Some(bytes);
        self
    }
}

impl Default for SizeLimit {
    fn default() -> Self {
        Self::new()
    }
}

fn byte_estimate(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

fn too_large(what: &str, actual: usize, limit: usize) -> RpcError {
    RpcError::new(
        ErrorCode::ResourceExhausted,
        format!("{what} of {actual} bytes exceeds the {limit} byte limit"),
    )
    .with_details(serde_json::json!({ "limitBytes": limit, "actualBytes": actual }))
}

impl EnvelopeInterceptor for SizeLimit {
    fn name(&self) -> &'static str {
        "size-limit"
    }

    fn around(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> BoxFuture<'static, Result<HandlerOutput, RpcError>> {
        let max_payload = self.max_payload;
        let max_response = self.max_response;

        let actual = byte_estimate(&envelope.payload);
        if actual > max_payload {
            return Box::pin(async move { Err(too_large("payload", actual, max_payload)) });
        }

        Box::pin(async move {
            let output = next.run(envelope, ctx).await?;
            if let (HandlerOutput::Single(value), Some(limit)) = (&output, max_response) {
                let actual = byte_estimate(value);
                if actual > limit {
                    return Err(too_large("response", actual, limit));
                }
            }
            Ok(output)
        })
    }
}
