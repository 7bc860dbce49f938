use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;

use manifold_cache::{CacheEntry, CacheStore, Freshness, InMemoryStore};
use manifold_core::{
    Context, Envelope, EnvelopeInterceptor, EnvelopeKind, HandlerOutput, Next, RpcError,
};

use crate::fingerprint::payload_fingerprint;

type KeyFn = Arc<dyn Fn(&Envelope, &Context) -> String + Send + Sync>;

/// Caches unary results by payload fingerprint.
///
/// Fresh hits answer from the store without touching the handler. With a
/// stale grace configured (stale-while-revalidate), a hit past its ttl but
/// inside the grace answers with the stale value and starts at most one
/// background refresh for that key. Values are serialized on store and
/// deserialized on read, so every caller gets an independent copy.
///
/// Only successful results are cached unless [`Cached::cache_errors`] is
/// set. Stream results always pass through uncached.
pub struct Cached {
    ttl: Duration,
    stale_grace: Option<Duration>,
    store: Arc<dyn CacheStore>,
    keyer: Option<KeyFn>,
    tags: Vec<String>,
    cache_errors: bool,
    pending: Arc<DashMap<String, ()>>,
}

impl Cached {
    /// Cache successful results for `ttl` in a private in-memory store.
    pub fn ttl(ttl: Duration) -> Self {
        Self::with_store(ttl, InMemoryStore::new())
    }

    pub fn with_store(ttl: Duration, store: impl CacheStore) -> Self {
        Self {
            ttl,
            stale_grace: None,
            store: Arc::new(store),
            keyer: None,
            tags: Vec::new(),
            cache_errors: false,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Enable stale-while-revalidate with the given grace window.
    pub fn stale_while_revalidate(mut self, grace: Duration) -> Self {
        self.stale_grace = Some(grace);
        self
    }

    /// Tag stored entries for group invalidation via
    /// [`CacheStore::remove_by_tag`].
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Also cache error outcomes (replayed as errors on hit).
    pub fn cache_errors(mut self) -> Self {
        self.cache_errors = true;
        self
    }

    pub fn key_fn(
        mut self,
        keyer: impl Fn(&Envelope, &Context) -> String + Send + Sync + 'static,
    ) -> Self {
        self.keyer = Some(Arc::new(keyer));
        self
    }

    pub fn store(&self) -> Arc<dyn CacheStore> {
        self.store.clone()
    }

    fn key_for(&self, envelope: &Envelope, ctx: &Context) -> String {
        match &self.keyer {
            Some(f) => f(envelope, ctx),
            None => payload_fingerprint("cache", envelope),
        }
    }

    fn encode(outcome: &Result<Value, RpcError>) -> String {
        let wrapped = match outcome {
            Ok(value) => serde_json::json!({ "ok": value }),
            Err(err) => serde_json::json!({ "err": err.to_payload() }),
        };
        wrapped.to_string()
    }

    fn decode(raw: &str) -> Option<Result<Value, RpcError>> {
        let wrapped: Value = serde_json::from_str(raw).ok()?;
        if let Some(value) = wrapped.get("ok") {
            return Some(Ok(value.clone()));
        }
        wrapped.get("err").map(|payload| Err(RpcError::from_payload(payload)))
    }

}

impl EnvelopeInterceptor for Cached {
    fn name(&self) -> &'static str {
        "cached"
    }

    fn around(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> BoxFuture<'static, Result<HandlerOutput, RpcError>> {
        if envelope.kind != EnvelopeKind::Request {
            return next.run(envelope, ctx);
        }
        let key = self.key_for(&envelope, &ctx);
        let store = self.store.clone();
        let stale_grace = self.stale_grace;
        let cache_errors = self.cache_errors;
        let pending = self.pending.clone();
        let ttl = self.ttl;
        let tags = self.tags.clone();

        Box::pin(async move {
            let make_entry = move |outcome: &Result<Value, RpcError>| {
                CacheEntry::new(Cached::encode(outcome), ttl).with_tags(tags.clone())
            };

            if let Some(entry) = store.get(&key).await {
                match entry.freshness(stale_grace.unwrap_or(Duration::ZERO)) {
                    Freshness::Fresh => match Cached::decode(&entry.value) {
                        Some(Ok(value)) => return Ok(HandlerOutput::Single(value)),
                        Some(Err(err)) => return Err(err),
                        None => store.remove(&key).await,
                    },
                    Freshness::Stale => {
                        if let Some(outcome) = Cached::decode(&entry.value) {
                            // Serve stale; at most one refresh per key runs
                            // in the background.
                            if pending.insert(key.clone(), ()).is_none() {
                                let refresh_env = envelope.clone();
                                let refresh_ctx = ctx.clone();
                                tokio::spawn(async move {
                                    match next.run(refresh_env, refresh_ctx).await {
                                        Ok(HandlerOutput::Single(value)) => {
                                            store.set(&key, make_entry(&Ok(value))).await;
                                        }
                                        Ok(HandlerOutput::Stream(_)) => {}
                                        Err(err) => {
                                            tracing::debug!(key = %key, "background revalidation failed: {err}");
                                            if cache_errors {
                                                store.set(&key, make_entry(&Err(err))).await;
                                            }
                                        }
                                    }
                                    pending.remove(&key);
                                });
                            }
                            return match outcome {
                                Ok(value) => Ok(HandlerOutput::Single(value)),
                                Err(err) => Err(err),
                            };
                        }
                        store.remove(&key).await;
                    }
                    Freshness::Expired => {}
                }
            }

            match next.run(envelope, ctx).await {
                Ok(HandlerOutput::Single(value)) => {
                    store.set(&key, make_entry(&Ok(value.clone()))).await;
                    Ok(HandlerOutput::Single(value))
                }
                Ok(HandlerOutput::Stream(stream)) => Ok(HandlerOutput::Stream(stream)),
                Err(err) => {
                    if cache_errors {
                        store.set(&key, make_entry(&Err(err.clone()))).await;
                    }
                    Err(err)
                }
            }
        })
    }
}
