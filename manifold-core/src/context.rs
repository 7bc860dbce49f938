use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, RpcError};

/// Nested `ctx.call` depth beyond which the router rejects the call.
pub const MAX_CALLING_LEVEL: u32 = 100;

/// Authenticated principal information attached to a request.
#[derive(Clone, Debug, Default)]
pub struct AuthInfo {
    pub principal: Option<String>,
    pub authenticated: bool,
    pub claims: Option<Value>,
    pub roles: Vec<String>,
    pub scopes: Vec<String>,
}

impl AuthInfo {
    pub fn principal(principal: impl Into<String>) -> Self {
        Self {
            principal: Some(principal.into()),
            authenticated: true,
            ..Self::default()
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// W3C-style trace identifiers propagated through nested calls.
#[derive(Clone, Debug, Default)]
pub struct TraceContext {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// A fresh root trace (random ids).
    pub fn root() -> Self {
        Self {
            trace_id: Some(uuid::Uuid::new_v4().simple().to_string()),
            span_id: Some(uuid::Uuid::new_v4().simple().to_string()),
            parent_span_id: None,
        }
    }
}

/// The function a `Context` uses to re-enter the router. Installed by the
/// transport (or by the router itself) before a handler runs.
pub type CallFn =
    Arc<dyn Fn(String, Value, Context) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

#[derive(Clone, Default)]
struct Extensions {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

/// Per-request ambient state. Immutable; all modification happens through
/// `with_*` derivations that return a new `Context` sharing nothing mutable.
///
/// Cloning is cheap (a handful of `Arc` bumps), so handlers and interceptors
/// pass contexts by value.
#[derive(Clone)]
pub struct Context {
    request_id: Arc<str>,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
    auth: Arc<AuthInfo>,
    tracing: Arc<TraceContext>,
    extensions: Arc<Extensions>,
    call_fn: Option<CallFn>,
    calling_level: u32,
}

impl Context {
    /// A context for a request entering from a transport (`calling_level` 1).
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Arc::from(request_id.into()),
            deadline: None,
            cancellation: CancellationToken::new(),
            auth: Arc::new(AuthInfo::default()),
            tracing: Arc::new(TraceContext::default()),
            extensions: Arc::new(Extensions::default()),
            call_fn: None,
            calling_level: 1,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time remaining until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn deadline_exceeded(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn auth(&self) -> &AuthInfo {
        &self.auth
    }

    pub fn tracing(&self) -> &TraceContext {
        &self.tracing
    }

    pub fn calling_level(&self) -> u32 {
        self.calling_level
    }

    pub fn has_call_fn(&self) -> bool {
        self.call_fn.is_some()
    }

    // ── Derivations ──────────────────────────────────────────────────────

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Arc::from(request_id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_auth(mut self, auth: AuthInfo) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    pub fn with_tracing(mut self, tracing: TraceContext) -> Self {
        self.tracing = Arc::new(tracing);
        self
    }

    pub fn with_call_fn(mut self, call_fn: CallFn) -> Self {
        self.call_fn = Some(call_fn);
        self
    }

    /// Attach a typed extension value. Keys are set-once: if a value of the
    /// same type is already present the existing value wins and the new one
    /// is dropped.
    pub fn with_extension<T: Any + Send + Sync>(mut self, value: T) -> Self {
        let key = TypeId::of::<T>();
        if self.extensions.map.contains_key(&key) {
            tracing::warn!(
                extension = std::any::type_name::<T>(),
                "extension already set; keeping the original value"
            );
            return self;
        }
        let mut ext = (*self.extensions).clone();
        ext.map.insert(key, Arc::new(value));
        self.extensions = Arc::new(ext);
        self
    }

    pub fn extension<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.extensions
            .map
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    /// Derive the context a nested `call` runs under: same request id, auth,
    /// tracing, cancellation, and call function, one calling level deeper.
    pub fn child_for_call(&self) -> Self {
        let mut child = self.clone();
        child.calling_level = self.calling_level.saturating_add(1);
        child
    }

    // ── Nested calls ─────────────────────────────────────────────────────

    /// Invoke another registered handler through the router, preserving
    /// auth, tracing, and the request id, at `calling_level + 1`.
    ///
    /// Fails with `CALLING_DEPTH_EXCEEDED` once the depth cap is hit.
    pub async fn call(&self, procedure: &str, payload: Value) -> Result<Value, RpcError> {
        let call_fn = self.call_fn.clone().ok_or_else(|| {
            RpcError::new(
                ErrorCode::FailedPrecondition,
                "context has no call function installed",
            )
        })?;
        let child = self.child_for_call();
        call_fn(procedure.to_string(), payload, child).await
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("request_id", &self.request_id)
            .field("calling_level", &self.calling_level)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
