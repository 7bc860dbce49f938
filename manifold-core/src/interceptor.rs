use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::context::Context;
use crate::envelope::Envelope;
use crate::error::RpcError;
use crate::registry::PayloadStream;

/// What a handler (or the chain around it) produces.
pub enum HandlerOutput {
    /// A single result payload (procedures, event acks).
    Single(Value),
    /// A lazy sequence of payloads (streams).
    Stream(PayloadStream),
}

impl HandlerOutput {
    pub fn is_stream(&self) -> bool {
        matches!(self, HandlerOutput::Stream(_))
    }
}

impl std::fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerOutput::Single(value) => f.debug_tuple("Single").field(value).finish(),
            HandlerOutput::Stream(_) => f.debug_tuple("Stream").field(&"..").finish(),
        }
    }
}

/// Middleware wrapping handler execution in onion fashion: stage N runs
/// before stage N+1 and wraps its result. The chain for a dispatch is
/// `[global interceptors..., per-handler interceptors..., handler]`.
///
/// `Next::run` consumes the continuation, so a stage cannot invoke it twice;
/// a stage that never calls it short-circuits the chain (caches, limiters).
pub trait EnvelopeInterceptor: Send + Sync + 'static {
    /// Name used in logs and diagnostics.
    fn name(&self) -> &'static str {
        "interceptor"
    }

    fn around(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> BoxFuture<'static, Result<HandlerOutput, RpcError>>;
}

/// The terminal stage of a chain: the handler adapter itself.
pub type Terminal =
    Arc<dyn Fn(Envelope, Context) -> BoxFuture<'static, Result<HandlerOutput, RpcError>> + Send + Sync>;

/// The rest of the chain, handed to each interceptor stage.
pub struct Next {
    chain: Arc<[Arc<dyn EnvelopeInterceptor>]>,
    index: usize,
    terminal: Terminal,
}

impl Next {
    /// Build a chain over the given stages, ending at `terminal`.
    pub fn new(chain: Arc<[Arc<dyn EnvelopeInterceptor>]>, terminal: Terminal) -> Self {
        Self {
            chain,
            index: 0,
            terminal,
        }
    }

    /// A chain with no interceptor stages (useful in tests).
    pub fn terminal_only(terminal: Terminal) -> Self {
        Self::new(Arc::from(Vec::new()), terminal)
    }

    /// Run the remainder of the chain. Consumes `self`: the continuation can
    /// be invoked at most once by construction.
    pub fn run(
        self,
        envelope: Envelope,
        ctx: Context,
    ) -> BoxFuture<'static, Result<HandlerOutput, RpcError>> {
        match self.chain.get(self.index).cloned() {
            Some(stage) => {
                let rest = Next {
                    chain: self.chain,
                    index: self.index + 1,
                    terminal: self.terminal,
                };
                tracing::trace!(stage = stage.name(), procedure = %envelope.procedure, "interceptor");
                stage.around(envelope, ctx, rest)
            }
            None => (self.terminal)(envelope, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records the order it runs in, before and after `next`.
    struct Tracer {
        label: &'static str,
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl EnvelopeInterceptor for Tracer {
        fn name(&self) -> &'static str {
            self.label
        }

        fn around(
            &self,
            envelope: Envelope,
            ctx: Context,
            next: Next,
        ) -> BoxFuture<'static, Result<HandlerOutput, RpcError>> {
            let label = self.label;
            let log = self.log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(format!("{label}:before"));
                let result = next.run(envelope, ctx).await;
                log.lock().unwrap().push(format!("{label}:after"));
                result
            })
        }
    }

    fn counting_terminal(counter: Arc<AtomicUsize>) -> Terminal {
        Arc::new(move |envelope, _ctx| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerOutput::Single(envelope.payload))
            })
        })
    }

    #[tokio::test]
    async fn onion_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain: Arc<[Arc<dyn EnvelopeInterceptor>]> = Arc::from(vec![
            Arc::new(Tracer { label: "outer", log: log.clone() }) as Arc<dyn EnvelopeInterceptor>,
            Arc::new(Tracer { label: "inner", log: log.clone() }),
        ]);
        let counter = Arc::new(AtomicUsize::new(0));
        let next = Next::new(chain, counting_terminal(counter.clone()));

        let env = Envelope::request("1", "t.echo", serde_json::json!(7));
        let out = next.run(env, Context::new("1")).await.unwrap();
        match out {
            HandlerOutput::Single(v) => assert_eq!(v, serde_json::json!(7)),
            HandlerOutput::Stream(_) => panic!("expected single"),
        }

        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:before", "inner:before", "inner:after", "outer:after"]
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    /// An interceptor that answers without invoking the rest of the chain.
    struct ShortCircuit;

    impl EnvelopeInterceptor for ShortCircuit {
        fn around(
            &self,
            _envelope: Envelope,
            _ctx: Context,
            _next: Next,
        ) -> BoxFuture<'static, Result<HandlerOutput, RpcError>> {
            Box::pin(async { Ok(HandlerOutput::Single(serde_json::json!("cached"))) })
        }
    }

    #[tokio::test]
    async fn short_circuit_skips_the_terminal() {
        let counter = Arc::new(AtomicUsize::new(0));
        let chain: Arc<[Arc<dyn EnvelopeInterceptor>]> =
            Arc::from(vec![Arc::new(ShortCircuit) as Arc<dyn EnvelopeInterceptor>]);
        let next = Next::new(chain, counting_terminal(counter.clone()));

        let env = Envelope::request("1", "t.echo", Value::Null);
        let out = next.run(env, Context::new("1")).await.unwrap();
        assert!(matches!(out, HandlerOutput::Single(v) if v == serde_json::json!("cached")));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
