use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures_core::Stream;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::{CallFn, Context, MAX_CALLING_LEVEL};
use crate::envelope::Envelope;
use crate::error::{ErrorCode, RpcError};
use crate::interceptor::{EnvelopeInterceptor, HandlerOutput, Next, Terminal};
use crate::registry::{AnyHandler, EventEntry, Registry};

/// A lazy sequence of reply envelopes produced for one stream request.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

/// The outcome of routing one envelope. Exactly one terminal envelope is
/// always emitted on the reply path: the response, the error, or the
/// `stream:end`/error that closes a stream.
pub enum RouterResult {
    Response(Envelope),
    Error(Envelope),
    Stream(EnvelopeStream),
}

impl RouterResult {
    /// Unwrap a unary outcome as `Result<payload, error>` (test helper and
    /// nested-call plumbing).
    pub fn into_unary(self) -> Result<Value, RpcError> {
        match self {
            RouterResult::Response(env) => Ok(env.payload),
            RouterResult::Error(env) => Err(RpcError::from_payload(&env.payload)),
            RouterResult::Stream(_) => Err(RpcError::new(
                ErrorCode::UnprocessableEntity,
                "expected a unary result but the handler produced a stream",
            )),
        }
    }
}

/// How event envelopes reach their handler. The default awaits the handler
/// inline; `manifold-events` provides a dispatcher with fan-out, delivery
/// guarantees, and retry.
pub trait EventDispatch: Send + Sync + 'static {
    fn dispatch(
        &self,
        entry: Arc<EventEntry>,
        payload: Value,
        ctx: Context,
    ) -> BoxFuture<'static, Result<(), RpcError>>;
}

/// Awaits the event handler once, no retry.
pub struct InlineDispatch;

impl EventDispatch for InlineDispatch {
    fn dispatch(
        &self,
        entry: Arc<EventEntry>,
        payload: Value,
        ctx: Context,
    ) -> BoxFuture<'static, Result<(), RpcError>> {
        let handler = entry.handler.clone();
        Box::pin(async move { handler(payload, ctx).await })
    }
}

/// Dispatches envelopes through the interceptor chain to registered
/// handlers.
///
/// The chain for a dispatch is `[global..., per-handler..., handler]` in
/// onion order. Nested handler-to-handler calls re-enter `handle` through
/// the call function the router installs into each [`Context`], with the
/// calling level capped at [`MAX_CALLING_LEVEL`].
pub struct Router {
    registry: Arc<Registry>,
    global_interceptors: Vec<Arc<dyn EnvelopeInterceptor>>,
    event_dispatch: Arc<dyn EventDispatch>,
}

pub struct RouterBuilder {
    registry: Registry,
    global_interceptors: Vec<Arc<dyn EnvelopeInterceptor>>,
    event_dispatch: Option<Arc<dyn EventDispatch>>,
}

impl RouterBuilder {
    /// Add a global interceptor. Globals run before per-handler
    /// interceptors, in registration order.
    pub fn intercept(mut self, interceptor: impl EnvelopeInterceptor) -> Self {
        self.global_interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn event_dispatch(mut self, dispatch: impl EventDispatch) -> Self {
        self.event_dispatch = Some(Arc::new(dispatch));
        self
    }

    pub fn build(self) -> Arc<Router> {
        Arc::new(Router {
            registry: Arc::new(self.registry),
            global_interceptors: self.global_interceptors,
            event_dispatch: self.event_dispatch.unwrap_or_else(|| Arc::new(InlineDispatch)),
        })
    }
}

impl Router {
    /// Freeze a registry and start building a router over it.
    pub fn builder(registry: Registry) -> RouterBuilder {
        RouterBuilder {
            registry,
            global_interceptors: Vec::new(),
            event_dispatch: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The call function injected into contexts so handlers can invoke
    /// other handlers (`ctx.call`). Holds a weak reference; calls made
    /// after the router is dropped fail with `UNAVAILABLE`.
    pub fn context_call_fn(self: &Arc<Self>) -> CallFn {
        let router = Arc::downgrade(self);
        Arc::new(move |procedure, payload, ctx| {
            let router = router.clone();
            Box::pin(async move {
                let Some(router) = router.upgrade() else {
                    return Err(RpcError::new(ErrorCode::Unavailable, "router has shut down"));
                };
                let envelope = Envelope::request(ctx.request_id().to_string(), procedure, payload);
                router.handle(envelope, ctx).await.into_unary()
            })
        })
    }

    /// Route one envelope to its handler and produce the reply.
    pub async fn handle(self: &Arc<Self>, envelope: Envelope, ctx: Context) -> RouterResult {
        let ctx = if ctx.has_call_fn() {
            ctx
        } else {
            ctx.with_call_fn(self.context_call_fn())
        };

        let id = envelope.id.clone();
        let procedure = envelope.procedure.clone();

        if ctx.calling_level() > MAX_CALLING_LEVEL {
            let err = RpcError::new(
                ErrorCode::CallingDepthExceeded,
                format!("nested call depth exceeded {MAX_CALLING_LEVEL}"),
            );
            tracing::warn!(procedure = %procedure, level = ctx.calling_level(), "calling depth exceeded");
            return RouterResult::Error(Envelope::error(id, procedure, &err));
        }
        if ctx.is_cancelled() {
            return RouterResult::Error(Envelope::error(id, procedure, &RpcError::cancelled()));
        }
        if ctx.deadline_exceeded() {
            let err = RpcError::new(ErrorCode::DeadlineExceeded, "deadline exceeded before dispatch");
            return RouterResult::Error(Envelope::error(id, procedure, &err));
        }

        let Some(handler) = self.registry.get(&procedure) else {
            let err = RpcError::new(
                ErrorCode::NotFound,
                format!("no handler registered for '{procedure}'"),
            );
            return RouterResult::Error(Envelope::error(id, procedure, &err));
        };

        tracing::debug!(
            procedure = %procedure,
            kind = handler.kind().as_str(),
            request_id = ctx.request_id(),
            level = ctx.calling_level(),
            "dispatch"
        );

        let chain: Arc<[Arc<dyn EnvelopeInterceptor>]> = self
            .global_interceptors
            .iter()
            .chain(handler.interceptors().iter())
            .cloned()
            .collect::<Vec<_>>()
            .into();
        let terminal = self.terminal_for(&handler);
        let cancel = ctx.cancellation().clone();

        match Next::new(chain, terminal).run(envelope, ctx).await {
            Ok(HandlerOutput::Single(payload)) => RouterResult::Response(Envelope {
                id,
                procedure,
                kind: crate::envelope::EnvelopeKind::Response,
                payload,
                metadata: Default::default(),
            }),
            Ok(HandlerOutput::Stream(items)) => {
                RouterResult::Stream(Box::pin(ChunkStream::new(id, procedure, items, cancel)))
            }
            Err(err) => {
                if err.code.category() == crate::error::ErrorCategory::Server {
                    tracing::warn!(procedure = %procedure, code = err.code.as_str(), "handler failed: {}", err.message);
                }
                RouterResult::Error(Envelope::error(id, procedure, &err))
            }
        }
    }

    fn terminal_for(&self, handler: &AnyHandler) -> Terminal {
        match handler {
            AnyHandler::Procedure(entry) => {
                let entry = entry.clone();
                Arc::new(move |envelope: Envelope, ctx: Context| {
                    let handler = entry.handler.clone();
                    Box::pin(async move {
                        handler(envelope.payload, ctx).await.map(HandlerOutput::Single)
                    })
                })
            }
            AnyHandler::Stream(entry) => {
                let entry = entry.clone();
                Arc::new(move |envelope: Envelope, ctx: Context| {
                    let handler = entry.handler.clone();
                    Box::pin(async move {
                        handler(envelope.payload, ctx).await.map(HandlerOutput::Stream)
                    })
                })
            }
            AnyHandler::Event(entry) => {
                let entry = entry.clone();
                let dispatch = self.event_dispatch.clone();
                Arc::new(move |envelope: Envelope, ctx: Context| {
                    let fut = dispatch.dispatch(entry.clone(), envelope.payload, ctx);
                    Box::pin(async move { fut.await.map(|()| HandlerOutput::Single(Value::Null)) })
                })
            }
        }
    }
}

/// Wraps a handler's payload stream into reply envelopes: one
/// `stream:chunk` per item, then a single terminal `stream:end` (or an
/// error envelope). The cancellation token is observed between chunks.
struct ChunkStream {
    id: String,
    procedure: String,
    inner: Option<crate::registry::PayloadStream>,
    cancel: CancellationToken,
}

impl ChunkStream {
    fn new(
        id: String,
        procedure: String,
        inner: crate::registry::PayloadStream,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            procedure,
            inner: Some(inner),
            cancel,
        }
    }
}

impl Stream for ChunkStream {
    type Item = Envelope;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Envelope>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        if this.cancel.is_cancelled() {
            this.inner = None;
            return Poll::Ready(Some(Envelope::error(
                this.id.clone(),
                this.procedure.clone(),
                &RpcError::cancelled(),
            )));
        }
        match inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(payload))) => Poll::Ready(Some(Envelope::stream_chunk(
                this.id.clone(),
                this.procedure.clone(),
                payload,
            ))),
            Poll::Ready(Some(Err(err))) => {
                this.inner = None;
                Poll::Ready(Some(Envelope::error(
                    this.id.clone(),
                    this.procedure.clone(),
                    &err,
                )))
            }
            Poll::Ready(None) => {
                this.inner = None;
                Poll::Ready(Some(Envelope::stream_end(
                    this.id.clone(),
                    this.procedure.clone(),
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;
    use crate::registry::{EventOptions, PayloadStream, ProcedureOptions, StreamOptions};
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(procedure: &str, payload: Value) -> Envelope {
        Envelope::request("1", procedure, payload)
    }

    #[tokio::test]
    async fn procedure_success_round_trip() {
        let mut registry = Registry::new();
        registry
            .register_procedure(
                "users.get",
                |payload, _ctx| async move {
                    let id = payload.get("id").cloned().unwrap_or(Value::Null);
                    Ok(serde_json::json!({ "id": id, "name": "Alice" }))
                },
                ProcedureOptions::default(),
            )
            .unwrap();
        let router = Router::builder(registry).build();

        let result = router
            .handle(request("users.get", serde_json::json!({ "id": "u-1" })), Context::new("1"))
            .await;
        match result {
            RouterResult::Response(env) => {
                assert_eq!(env.id, "1");
                assert_eq!(env.kind, EnvelopeKind::Response);
                assert_eq!(env.payload, serde_json::json!({ "id": "u-1", "name": "Alice" }));
            }
            _ => panic!("expected response"),
        }
    }

    #[tokio::test]
    async fn unknown_procedure_is_not_found() {
        let router = Router::builder(Registry::new()).build();
        let result = router.handle(request("nope", Value::Null), Context::new("1")).await;
        match result {
            RouterResult::Error(env) => {
                assert_eq!(env.id, "1");
                assert_eq!(env.payload["code"], "NOT_FOUND");
            }
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn nested_call_depth_is_capped_at_100_invocations() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        let counter = invocations.clone();
        registry
            .register_procedure(
                "recursive",
                move |payload, ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let depth = payload.get("d").and_then(Value::as_i64).unwrap_or(0);
                        ctx.call("recursive", serde_json::json!({ "d": depth + 1 })).await
                    }
                },
                ProcedureOptions::default(),
            )
            .unwrap();
        let router = Router::builder(registry).build();

        let result = router
            .handle(request("recursive", serde_json::json!({ "d": 0 })), Context::new("1"))
            .await;
        match result {
            RouterResult::Error(env) => {
                assert_eq!(env.payload["code"], "CALLING_DEPTH_EXCEEDED");
            }
            _ => panic!("expected error"),
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn nested_call_preserves_request_identity() {
        let mut registry = Registry::new();
        registry
            .register_procedure(
                "inner.whoami",
                |_payload, ctx| async move {
                    Ok(serde_json::json!({
                        "requestId": ctx.request_id(),
                        "level": ctx.calling_level(),
                        "principal": ctx.auth().principal,
                    }))
                },
                ProcedureOptions::default(),
            )
            .unwrap();
        registry
            .register_procedure(
                "outer.delegate",
                |_payload, ctx| async move { ctx.call("inner.whoami", Value::Null).await },
                ProcedureOptions::default(),
            )
            .unwrap();
        let router = Router::builder(registry).build();

        let ctx = Context::new("req-7").with_auth(crate::context::AuthInfo::principal("ada"));
        let result = router.handle(request("outer.delegate", Value::Null), ctx).await;
        let payload = match result {
            RouterResult::Response(env) => env.payload,
            _ => panic!("expected response"),
        };
        assert_eq!(payload["requestId"], "req-7");
        assert_eq!(payload["level"], 2);
        assert_eq!(payload["principal"], "ada");
    }

    #[tokio::test]
    async fn stream_chunks_share_the_request_id_and_end_cleanly() {
        let mut registry = Registry::new();
        registry
            .register_stream(
                "numbers.count",
                |_payload, _ctx| async move {
                    let items = futures_util::stream::iter((0..3).map(|n| Ok(serde_json::json!(n))));
                    Ok(Box::pin(items) as PayloadStream)
                },
                StreamOptions::default(),
            )
            .unwrap();
        let router = Router::builder(registry).build();

        let result = router
            .handle(Envelope::request("s-1", "numbers.count", Value::Null), Context::new("s-1"))
            .await;
        let envelopes: Vec<Envelope> = match result {
            RouterResult::Stream(s) => s.collect().await,
            _ => panic!("expected stream"),
        };
        assert_eq!(envelopes.len(), 4);
        for env in &envelopes {
            assert_eq!(env.id, "s-1");
        }
        assert!(envelopes[..3].iter().all(|e| e.kind == EnvelopeKind::StreamChunk));
        assert_eq!(envelopes[3].kind, EnvelopeKind::StreamEnd);
    }

    #[tokio::test]
    async fn stream_failure_terminates_with_an_error_envelope() {
        let mut registry = Registry::new();
        registry
            .register_stream(
                "flaky.feed",
                |_payload, _ctx| async move {
                    let items = futures_util::stream::iter(vec![
                        Ok(serde_json::json!(1)),
                        Err(RpcError::new(ErrorCode::StreamError, "source went away")),
                    ]);
                    Ok(Box::pin(items) as PayloadStream)
                },
                StreamOptions::default(),
            )
            .unwrap();
        let router = Router::builder(registry).build();

        let result = router
            .handle(Envelope::request("s-2", "flaky.feed", Value::Null), Context::new("s-2"))
            .await;
        let envelopes: Vec<Envelope> = match result {
            RouterResult::Stream(s) => s.collect().await,
            _ => panic!("expected stream"),
        };
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].kind, EnvelopeKind::StreamChunk);
        assert_eq!(envelopes[1].kind, EnvelopeKind::Error);
        assert_eq!(envelopes[1].payload["code"], "STREAM_ERROR");
    }

    #[tokio::test]
    async fn event_envelope_is_acked_after_dispatch() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        let counter = seen.clone();
        registry
            .register_event(
                "audit.record",
                move |_payload, _ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                EventOptions::default(),
            )
            .unwrap();
        let router = Router::builder(registry).build();

        let result = router
            .handle(Envelope::event("e-1", "audit.record", serde_json::json!({})), Context::new("e-1"))
            .await;
        match result {
            RouterResult::Response(env) => assert!(env.payload.is_null()),
            _ => panic!("expected ack"),
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn global_interceptors_run_before_handler_interceptors() {
        use crate::interceptor::{HandlerOutput, Next};

        struct Mark(&'static str, Arc<std::sync::Mutex<Vec<&'static str>>>);
        impl EnvelopeInterceptor for Mark {
            fn around(
                &self,
                envelope: Envelope,
                ctx: Context,
                next: Next,
            ) -> BoxFuture<'static, Result<HandlerOutput, RpcError>> {
                self.1.lock().unwrap().push(self.0);
                next.run(envelope, ctx)
            }
        }

        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = Registry::new();
        registry
            .register_procedure(
                "t.echo",
                |payload, _| async move { Ok(payload) },
                ProcedureOptions::default().intercept(Mark("handler", log.clone())),
            )
            .unwrap();
        let router = Router::builder(registry).intercept(Mark("global", log.clone())).build();

        router.handle(request("t.echo", Value::Null), Context::new("1")).await;
        assert_eq!(*log.lock().unwrap(), vec!["global", "handler"]);
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let mut registry = Registry::new();
        registry
            .register_procedure("t.echo", |p, _| async move { Ok(p) }, ProcedureOptions::default())
            .unwrap();
        let router = Router::builder(registry).build();

        let ctx = Context::new("1");
        ctx.cancellation().cancel();
        match router.handle(request("t.echo", Value::Null), ctx).await {
            RouterResult::Error(env) => assert_eq!(env.payload["code"], "CANCELLED"),
            _ => panic!("expected error"),
        }
    }
}
