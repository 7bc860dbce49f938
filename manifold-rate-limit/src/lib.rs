pub mod rules;
pub use rules::{matches_pattern, RateRule, RuleSet};

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// The outcome of one rate-limit check.
#[derive(Clone, Copy, Debug)]
pub struct RateDecision {
    pub allowed: bool,
    /// Requests currently counted inside the window (including this one if
    /// it was allowed).
    pub count: usize,
    pub limit: u64,
    /// When the window opens up again (oldest recorded hit + window).
    pub reset_at: Instant,
}

impl RateDecision {
    /// Seconds until the caller may retry, rounded up.
    pub fn retry_after(&self) -> u64 {
        let remaining = self.reset_at.saturating_duration_since(Instant::now());
        remaining.as_secs_f64().ceil() as u64
    }
}

/// Trait for pluggable rate-limiting backends.
pub trait RateLimitBackend: Send + Sync + 'static {
    /// Record a hit for `key` and decide whether it is allowed.
    fn check(&self, key: &str, limit: u64, window: Duration) -> RateDecision;
}

/// In-memory sliding-window limiter.
///
/// Each key holds the instants of its recent hits. A check prunes instants
/// older than the window, then records the new hit; rejected hits are not
/// recorded, so a burst of denied requests does not extend the window.
#[derive(Clone, Default)]
pub struct SlidingWindow {
    hits: Arc<DashMap<String, Vec<Instant>>>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked_keys(&self) -> usize {
        self.hits.len()
    }
}

impl RateLimitBackend for SlidingWindow {
    fn check(&self, key: &str, limit: u64, window: Duration) -> RateDecision {
        let now = Instant::now();
        let mut entry = self.hits.entry(key.to_string()).or_default();
        let hits = entry.value_mut();

        hits.retain(|instant| now.duration_since(*instant) < window);
        hits.push(now);

        let count = hits.len();
        let allowed = count as u64 <= limit;
        if !allowed {
            // Do not let a denied attempt count against the window.
            hits.pop();
        }
        let oldest = hits.first().copied().unwrap_or(now);
        RateDecision {
            allowed,
            count: hits.len(),
            limit,
            reset_at: oldest + window,
        }
    }
}

/// Clonable handle to a rate-limit backend.
#[derive(Clone)]
pub struct RateLimitRegistry {
    backend: Arc<dyn RateLimitBackend>,
}

impl RateLimitRegistry {
    pub fn new(backend: impl RateLimitBackend) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn check(&self, key: &str, limit: u64, window: Duration) -> RateDecision {
        self.backend.check(key, limit, window)
    }
}

impl Default for RateLimitRegistry {
    fn default() -> Self {
        Self::new(SlidingWindow::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn allows_up_to_the_limit() {
        let limiter = SlidingWindow::new();
        for i in 1..=3 {
            let decision = limiter.check("key", 3, Duration::from_secs(1));
            assert!(decision.allowed, "request {i} should pass");
            assert_eq!(decision.count, i);
        }
    }

    #[test]
    fn rejects_the_limit_plus_one() {
        let limiter = SlidingWindow::new();
        for _ in 0..2 {
            assert!(limiter.check("key", 2, Duration::from_secs(1)).allowed);
        }
        let denied = limiter.check("key", 2, Duration::from_secs(1));
        assert!(!denied.allowed);
        assert_eq!(denied.count, 2);
        assert!(denied.retry_after() >= 1);
    }

    #[test]
    fn window_slides() {
        let limiter = SlidingWindow::new();
        let window = Duration::from_millis(100);
        assert!(limiter.check("key", 1, window).allowed);
        assert!(!limiter.check("key", 1, window).allowed);

        sleep(Duration::from_millis(110));
        assert!(limiter.check("key", 1, window).allowed);
    }

    #[test]
    fn denied_attempts_do_not_extend_the_window() {
        let limiter = SlidingWindow::new();
        let window = Duration::from_millis(200);
        let first = limiter.check("key", 1, window);
        assert!(first.allowed);

        sleep(Duration::from_millis(50));
        let denied = limiter.check("key", 1, window);
        assert!(!denied.allowed);
        // reset_at still tracks the first (allowed) hit only.
        assert_eq!(denied.reset_at, first.reset_at);
    }

    #[test]
    fn reset_at_tracks_the_oldest_recorded_hit() {
        let limiter = SlidingWindow::new();
        let window = Duration::from_millis(500);
        let decision = limiter.check("key", 3, window);
        let expected = decision.reset_at;

        sleep(Duration::from_millis(20));
        let later = limiter.check("key", 3, window);
        assert_eq!(later.reset_at, expected);
    }

    #[test]
    fn independent_keys() {
        let limiter = SlidingWindow::new();
        assert!(limiter.check("a", 1, Duration::from_secs(1)).allowed);
        assert!(!limiter.check("a", 1, Duration::from_secs(1)).allowed);
        assert!(limiter.check("b", 1, Duration::from_secs(1)).allowed);
    }
}
