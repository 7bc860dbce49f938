//! TTL/LRU cache substrate backing the request-level interceptors (cache,
//! dedup, rate-limit bookkeeping).
//!
//! Values are stored as serialized strings against fingerprint keys. The
//! store keeps entries past their expiry so that stale-while-revalidate
//! consumers can still read them within a grace window; callers decide what
//! staleness means via [`CacheEntry::freshness`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// One cached value with its lifecycle instants.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub value: String,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub tags: Vec<String>,
}

impl CacheEntry {
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value: value.into(),
            created_at: now,
            expires_at: now + ttl,
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }

    /// Freshness relative to an optional stale grace after expiry.
    pub fn freshness(&self, stale_grace: Duration) -> Freshness {
        let now = Instant::now();
        if now < self.expires_at {
            Freshness::Fresh
        } else if now < self.expires_at + stale_grace {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Past expiry but within the stale grace: usable while a refresh runs.
    Stale,
    Expired,
}

/// Pluggable cache backend trait.
///
/// Implement this to swap the default in-memory store for Redis, a
/// filesystem, or an object store. Stores return entries regardless of
/// expiry; eviction of long-expired entries is a store concern.
pub trait CacheStore: Send + Sync + 'static {
    fn get<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = Option<CacheEntry>> + Send + 'a>>;
    fn set<'a>(&'a self, key: &'a str, entry: CacheEntry) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
    fn remove<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
    fn clear(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
    fn remove_by_prefix<'a>(&'a self, prefix: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
    fn remove_by_tag<'a>(&'a self, tag: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

struct Stored {
    entry: CacheEntry,
    last_access: Instant,
}

/// Default in-memory store backed by `DashMap`, with optional LRU capacity.
///
/// When a capacity is set, inserting beyond it first drops entries expired
/// past the configured grace horizon, then the least recently accessed
/// entry.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<DashMap<String, Stored>>,
    max_entries: Option<usize>,
    stale_horizon: Duration,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            max_entries: None,
            stale_horizon: Duration::from_secs(60),
        }
    }

    /// Bound the store to `max_entries` live entries.
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            ..Self::new()
        }
    }

    /// How long past expiry entries stay readable (the SWR grace horizon).
    pub fn stale_horizon(mut self, horizon: Duration) -> Self {
        self.stale_horizon = horizon;
        self
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drop entries expired beyond the stale horizon.
    pub fn purge_expired(&self) {
        let horizon = self.stale_horizon;
        self.inner
            .retain(|_, stored| Instant::now() < stored.entry.expires_at + horizon);
    }

    fn evict_for_capacity(&self) {
        let Some(max) = self.max_entries else { return };
        if self.inner.len() < max {
            return;
        }
        self.purge_expired();
        while self.inner.len() >= max {
            // Least recently accessed entry goes first.
            let oldest = self
                .inner
                .iter()
                .min_by_key(|kv| kv.value().last_access)
                .map(|kv| kv.key().clone());
            match oldest {
                Some(key) => {
                    self.inner.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for InMemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = Option<CacheEntry>> + Send + 'a>> {
        Box::pin(async move {
            let mut stored = self.inner.get_mut(key)?;
            if Instant::now() >= stored.entry.expires_at + self.stale_horizon {
                drop(stored);
                self.inner.remove(key);
                return None;
            }
            stored.last_access = Instant::now();
            Some(stored.entry.clone())
        })
    }

    fn set<'a>(&'a self, key: &'a str, entry: CacheEntry) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if !self.inner.contains_key(key) {
                self.evict_for_capacity();
            }
            self.inner.insert(
                key.to_string(),
                Stored {
                    entry,
                    last_access: Instant::now(),
                },
            );
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.inner.remove(key);
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.inner.clear();
        })
    }

    fn remove_by_prefix<'a>(&'a self, prefix: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.inner.retain(|k, _| !k.starts_with(prefix));
        })
    }

    fn remove_by_tag<'a>(&'a self, tag: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.inner.retain(|_, stored| !stored.entry.tags.iter().any(|t| t == tag));
        })
    }
}
