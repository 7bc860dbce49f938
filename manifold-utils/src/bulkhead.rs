use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;

use manifold_core::{
    Context, Envelope, EnvelopeInterceptor, ErrorCode, HandlerOutput, Next, RpcError,
};

struct ProcState {
    slots: Arc<tokio::sync::Semaphore>,
    queued: AtomicUsize,
}

/// Per-procedure concurrency limiter with an optional FIFO wait queue.
///
/// Up to `limit` dispatches of a procedure run at once. Excess dispatches
/// queue (FIFO, bounded by `max_queue`) until a slot frees; a full queue
/// rejects immediately with `BULKHEAD_OVERFLOW`, and queued waiters that
/// outlive `queue_timeout` fail with `BULKHEAD_QUEUE_TIMEOUT`. Both map to
/// status 503.
pub struct Bulkhead {
    limit: usize,
    max_queue: usize,
    queue_timeout: Option<Duration>,
    states: Arc<DashMap<String, Arc<ProcState>>>,
}

impl Bulkhead {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            max_queue: 0,
            queue_timeout: None,
            states: Arc::new(DashMap::new()),
        }
    }

    pub fn max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    fn state_for(&self, procedure: &str) -> Arc<ProcState> {
        self.states
            .entry(procedure.to_string())
            .or_insert_with(|| {
                Arc::new(ProcState {
                    slots: Arc::new(tokio::sync::Semaphore::new(self.limit)),
                    queued: AtomicUsize::new(0),
                })
            })
            .clone()
    }
}

impl EnvelopeInterceptor for Bulkhead {
    fn name(&self) -> &'static str {
        "bulkhead"
    }

    fn around(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> BoxFuture<'static, Result<HandlerOutput, RpcError>> {
        let state = self.state_for(&envelope.procedure);
        let max_queue = self.max_queue;
        let queue_timeout = self.queue_timeout;

        Box::pin(async move {
            let procedure = envelope.procedure.clone();
            let permit = match state.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    if state.queued.fetch_add(1, Ordering::SeqCst) >= max_queue {
                        state.queued.fetch_sub(1, Ordering::SeqCst);
                        return Err(RpcError::new(
                            ErrorCode::BulkheadOverflow,
                            format!("concurrency limit reached for '{procedure}' and the queue is full"),
                        )
                        .with_details(serde_json::json!({ "procedure": procedure })));
                    }
                    let acquired = match queue_timeout {
                        Some(timeout) => {
                            match tokio::time::timeout(timeout, state.slots.clone().acquire_owned()).await {
                                Ok(result) => result,
                                Err(_) => {
                                    state.queued.fetch_sub(1, Ordering::SeqCst);
                                    return Err(RpcError::new(
                                        ErrorCode::BulkheadQueueTimeout,
                                        format!("timed out waiting for a '{procedure}' slot"),
                                    )
                                    .with_details(serde_json::json!({ "procedure": procedure })));
                                }
                            }
                        }
                        None => state.slots.clone().acquire_owned().await,
                    };
                    state.queued.fetch_sub(1, Ordering::SeqCst);
                    acquired.map_err(|_| RpcError::internal("bulkhead semaphore closed"))?
                }
            };

            let result = next.run(envelope, ctx).await;
            drop(permit);
            result
        })
    }
}
