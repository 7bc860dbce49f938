use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable error codes shared by every transport.
///
/// Each code carries an HTTP-analog status and a retryability flag so that
/// transport adapters and clients agree on semantics without inspecting
/// messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    ValidationError,
    InvalidType,
    InvalidEnvelope,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    DeadlineExceeded,
    UnprocessableEntity,
    RateLimited,
    ResourceExhausted,
    Cancelled,
    InternalError,
    DataLoss,
    StreamError,
    Unknown,
    Unimplemented,
    BadGateway,
    Unavailable,
    GatewayTimeout,
    CallingDepthExceeded,
    BulkheadOverflow,
    BulkheadQueueTimeout,
}

/// Whether an error was caused by the caller or by the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Client,
    Server,
}

impl ErrorCode {
    /// HTTP-analog status for this code.
    pub fn status(self) -> u16 {
        match self {
            ErrorCode::InvalidArgument
            | ErrorCode::ValidationError
            | ErrorCode::InvalidType
            | ErrorCode::InvalidEnvelope => 400,
            ErrorCode::Unauthenticated => 401,
            ErrorCode::PermissionDenied => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::AlreadyExists => 409,
            ErrorCode::FailedPrecondition => 412,
            ErrorCode::DeadlineExceeded => 408,
            ErrorCode::UnprocessableEntity => 422,
            ErrorCode::RateLimited | ErrorCode::ResourceExhausted => 429,
            ErrorCode::Cancelled => 499,
            ErrorCode::InternalError
            | ErrorCode::DataLoss
            | ErrorCode::StreamError
            | ErrorCode::Unknown
            | ErrorCode::CallingDepthExceeded => 500,
            ErrorCode::Unimplemented => 501,
            ErrorCode::BadGateway => 502,
            ErrorCode::Unavailable
            | ErrorCode::BulkheadOverflow
            | ErrorCode::BulkheadQueueTimeout => 503,
            ErrorCode::GatewayTimeout => 504,
        }
    }

    pub fn category(self) -> ErrorCategory {
        if self.status() < 500 {
            ErrorCategory::Client
        } else {
            ErrorCategory::Server
        }
    }

    /// Whether a client may retry the request that produced this error.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Unavailable
                | ErrorCode::ResourceExhausted
                | ErrorCode::DeadlineExceeded
                | ErrorCode::RateLimited
                | ErrorCode::BadGateway
                | ErrorCode::GatewayTimeout
                | ErrorCode::InternalError
                | ErrorCode::Unknown
                | ErrorCode::StreamError
                | ErrorCode::BulkheadOverflow
                | ErrorCode::BulkheadQueueTimeout
        )
    }

    /// The wire representation (`SCREAMING_SNAKE_CASE`).
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::InvalidType => "INVALID_TYPE",
            ErrorCode::InvalidEnvelope => "INVALID_ENVELOPE",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::UnprocessableEntity => "UNPROCESSABLE_ENTITY",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::DataLoss => "DATA_LOSS",
            ErrorCode::StreamError => "STREAM_ERROR",
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::Unimplemented => "UNIMPLEMENTED",
            ErrorCode::BadGateway => "BAD_GATEWAY",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::GatewayTimeout => "GATEWAY_TIMEOUT",
            ErrorCode::CallingDepthExceeded => "CALLING_DEPTH_EXCEEDED",
            ErrorCode::BulkheadOverflow => "BULKHEAD_OVERFLOW",
            ErrorCode::BulkheadQueueTimeout => "BULKHEAD_QUEUE_TIMEOUT",
        }
    }

    /// WebSocket close code for errors that terminate a connection (4000-range).
    pub fn close_code(self) -> u16 {
        4000 + self.status()
    }

    fn from_str(code: &str) -> Option<ErrorCode> {
        serde_json::from_value(Value::String(code.to_string())).ok()
    }
}

/// The error type carried through handlers, interceptors, and onto the wire.
///
/// Serialized as `{ "code": "...", "message": "...", "details": ... }` in the
/// payload of an error envelope. No stack traces ever reach the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::NotFound, format!("{what} not found"))
    }

    pub fn already_exists(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::AlreadyExists, format!("{what} already exists"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "request was cancelled")
    }

    pub fn status(&self) -> u16 {
        self.code.status()
    }

    pub fn retryable(&self) -> bool {
        self.code.retryable()
    }

    /// The payload placed inside an error envelope.
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "code": self.code.as_str(),
                "message": self.message,
            })
        })
    }

    /// Recover an `RpcError` from an error-envelope payload.
    ///
    /// Unknown or malformed payloads collapse to `UNKNOWN` so that nested
    /// calls always observe a well-formed error.
    pub fn from_payload(payload: &Value) -> Self {
        let code = payload
            .get("code")
            .and_then(Value::as_str)
            .and_then(ErrorCode::from_str)
            .unwrap_or(ErrorCode::Unknown);
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        Self {
            code,
            message,
            details: payload.get("details").cloned(),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::new(ErrorCode::InvalidType, err.to_string())
    }
}
