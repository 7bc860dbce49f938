use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;

use manifold_core::{
    Context, Envelope, EnvelopeInterceptor, EnvelopeKind, HandlerOutput, Next, RpcError,
};

use crate::fingerprint::payload_fingerprint;

type SharedResult = Option<Result<Value, RpcError>>;

struct InFlight {
    rx: watch::Receiver<SharedResult>,
    created_at: Instant,
    epoch: u64,
}

type KeyFn = Arc<dyn Fn(&Envelope, &Context) -> String + Send + Sync>;

/// Coalesces concurrent identical requests onto one handler execution.
///
/// The first arrival for a key becomes the leader and runs the rest of the
/// chain; every concurrent arrival with the same key waits on the leader's
/// result and receives its own clone, so callers cannot observe each
/// other's mutations. After a successful completion the entry lingers
/// briefly (default 10 ms) to catch near-simultaneous arrivals; failures
/// are dropped immediately so retries re-execute. Entries older than the
/// ttl (default 30 s) are reaped when new leaders register.
///
/// Only unary results are coalesced; stream results pass through and any
/// waiters that piled up on one receive an error.
pub struct Dedup {
    in_flight: Arc<DashMap<String, InFlight>>,
    epochs: AtomicU64,
    ttl: Duration,
    linger: Duration,
    procedures: Option<Vec<String>>,
    keyer: Option<KeyFn>,
}

impl Dedup {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            epochs: AtomicU64::new(0),
            ttl: Duration::from_secs(30),
            linger: Duration::from_millis(10),
            procedures: None,
            keyer: None,
        }
    }

    /// Restrict coalescing to the given procedures.
    pub fn procedures(mut self, procedures: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.procedures = Some(procedures.into_iter().map(Into::into).collect());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    pub fn key_fn(
        mut self,
        keyer: impl Fn(&Envelope, &Context) -> String + Send + Sync + 'static,
    ) -> Self {
        self.keyer = Some(Arc::new(keyer));
        self
    }

    fn applies(&self, envelope: &Envelope) -> bool {
        if envelope.kind != EnvelopeKind::Request {
            return false;
        }
        match &self.procedures {
            Some(list) => list.iter().any(|p| p == &envelope.procedure),
            None => true,
        }
    }

    fn key_for(&self, envelope: &Envelope, ctx: &Context) -> String {
        match &self.keyer {
            Some(f) => f(envelope, ctx),
            None => payload_fingerprint("dedup", envelope),
        }
    }

    /// In-flight entries currently tracked (diagnostics).
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

impl Default for Dedup {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeInterceptor for Dedup {
    fn name(&self) -> &'static str {
        "dedup"
    }

    fn around(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> BoxFuture<'static, Result<HandlerOutput, RpcError>> {
        if !self.applies(&envelope) {
            return next.run(envelope, ctx);
        }
        let key = self.key_for(&envelope, &ctx);
        let map = self.in_flight.clone();
        let ttl = self.ttl;
        let linger = self.linger;
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);

        enum Role {
            Leader(watch::Sender<SharedResult>),
            Waiter(watch::Receiver<SharedResult>),
        }

        let role = match map.entry(key.clone()) {
            Entry::Occupied(occupied) => Role::Waiter(occupied.get().rx.clone()),
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(InFlight {
                    rx,
                    created_at: Instant::now(),
                    epoch,
                });
                Role::Leader(tx)
            }
        };

        match role {
            Role::Waiter(mut rx) => Box::pin(async move {
                let outcome = rx
                    .wait_for(|value| value.is_some())
                    .await
                    .map_err(|_| RpcError::internal("coalesced execution was abandoned"))?
                    .clone();
                match outcome {
                    // The clone above is a deep copy: waiters get
                    // mutation-independent results.
                    Some(Ok(value)) => Ok(HandlerOutput::Single(value)),
                    Some(Err(err)) => Err(err),
                    None => unreachable!("wait_for only yields set values"),
                }
            }),
            Role::Leader(tx) => Box::pin(async move {
                // Reap abandoned entries while we are here.
                map.retain(|_, entry| entry.epoch == epoch || entry.created_at.elapsed() < ttl);

                match next.run(envelope, ctx).await {
                    Ok(HandlerOutput::Single(value)) => {
                        let _ = tx.send(Some(Ok(value.clone())));
                        // Keep the entry around briefly for stragglers.
                        tokio::spawn(async move {
                            tokio::time::sleep(linger).await;
                            map.remove_if(&key, |_, entry| entry.epoch == epoch);
                        });
                        Ok(HandlerOutput::Single(value))
                    }
                    Ok(HandlerOutput::Stream(stream)) => {
                        map.remove_if(&key, |_, entry| entry.epoch == epoch);
                        let _ = tx.send(Some(Err(RpcError::internal(
                            "stream results are not deduplicated",
                        ))));
                        Ok(HandlerOutput::Stream(stream))
                    }
                    Err(err) => {
                        // Failures leave immediately so retries re-execute.
                        map.remove_if(&key, |_, entry| entry.epoch == epoch);
                        let _ = tx.send(Some(Err(err.clone())));
                        Err(err)
                    }
                }
            }),
        }
    }
}
