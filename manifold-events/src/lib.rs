//! Event delivery engine: fan-out dispatch of event envelopes to their
//! registered handlers with a configurable delivery guarantee.
//!
//! Best-effort events run the handler once and log failures. At-least-once
//! events retry per the handler's [`RetryPolicy`] with linearly growing
//! backoff. Delivery is fire-and-forget from the caller's point of view:
//! the ack goes out as soon as the delivery task is enqueued.
//!
//! Backpressure is enforced via a semaphore bounding the number of
//! concurrently executing deliveries. When the limit is reached, dispatch
//! blocks until a slot becomes available.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Semaphore;

use manifold_core::registry::EventEntry;
use manifold_core::router::EventDispatch;
use manifold_core::{Context, DeliveryGuarantee, RpcError};

/// Default maximum concurrent deliveries.
pub const DEFAULT_MAX_CONCURRENCY: usize = 1024;

/// Fan-out dispatcher for registered event handlers.
///
/// `EventDispatcher` is `Clone` and can be shared across threads; plug it
/// into the router with `Router::builder(...).event_dispatch(...)`.
#[derive(Clone)]
pub struct EventDispatcher {
    semaphore: Option<Arc<Semaphore>>,
}

impl EventDispatcher {
    /// Create a dispatcher with the default concurrency limit (1024).
    pub fn new() -> Self {
        Self::with_concurrency(DEFAULT_MAX_CONCURRENCY)
    }

    /// Create a dispatcher with a custom concurrency limit.
    pub fn with_concurrency(max_concurrent: usize) -> Self {
        Self {
            semaphore: Some(Arc::new(Semaphore::new(max_concurrent))),
        }
    }

    /// Create a dispatcher with no concurrency limit.
    ///
    /// WARNING: without backpressure, emitting faster than handlers can
    /// process grows memory without bound.
    pub fn unbounded() -> Self {
        Self { semaphore: None }
    }

    /// Run the delivery (including retries) to completion. Used by the
    /// spawned delivery task; also callable directly when the caller wants
    /// to wait for the outcome.
    pub async fn deliver_now(
        entry: Arc<EventEntry>,
        payload: Value,
        ctx: Context,
    ) -> Result<(), RpcError> {
        let handler = entry.handler.clone();
        match entry.delivery() {
            DeliveryGuarantee::BestEffort => handler(payload, ctx).await,
            DeliveryGuarantee::AtLeastOnce => {
                let policy = entry.retry();
                let attempts = policy.max_attempts.max(1);
                let mut last_err = None;
                for attempt in 1..=attempts {
                    match handler(payload.clone(), ctx.clone()).await {
                        Ok(()) => return Ok(()),
                        Err(err) => {
                            tracing::warn!(
                                event = %entry.name,
                                attempt,
                                code = err.code.as_str(),
                                "event delivery attempt failed: {}",
                                err.message
                            );
                            last_err = Some(err);
                            if attempt < attempts {
                                tokio::time::sleep(policy.backoff * attempt).await;
                            }
                        }
                    }
                }
                Err(last_err.unwrap_or_else(|| RpcError::internal("event delivery failed")))
            }
        }
    }
}

impl EventDispatch for EventDispatcher {
    fn dispatch(
        &self,
        entry: Arc<EventEntry>,
        payload: Value,
        ctx: Context,
    ) -> BoxFuture<'static, Result<(), RpcError>> {
        let semaphore = self.semaphore.clone();
        Box::pin(async move {
            let permit = match semaphore {
                Some(sem) => Some(
                    sem.acquire_owned()
                        .await
                        .map_err(|_| RpcError::internal("event dispatcher is shut down"))?,
                ),
                None => None,
            };
            let name = entry.name.clone();
            tokio::spawn(async move {
                let result = Self::deliver_now(entry, payload, ctx).await;
                if let Err(err) = result {
                    tracing::error!(event = %name, code = err.code.as_str(), "event delivery gave up: {}", err.message);
                }
                drop(permit);
            });
            Ok(())
        })
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
