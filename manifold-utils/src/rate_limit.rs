use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use manifold_core::{
    Context, Envelope, EnvelopeInterceptor, EnvelopeKind, ErrorCode, HandlerOutput, Next, RpcError,
};
use manifold_rate_limit::{RateLimitBackend, RuleSet, SlidingWindow};

/// Sliding-window rate limiting keyed by caller identity.
///
/// Keys prefer the authenticated principal (`user:<sub>`), then the client
/// address from forwarding headers (`ip:<addr>`), then fall back to a
/// global per-procedure bucket. Per-procedure limits are selected via
/// dotted-glob [`RuleSet`] rules; a default limit applies to procedures no
/// rule matches.
pub struct RateLimit {
    backend: Arc<dyn RateLimitBackend>,
    rules: RuleSet,
    default_limit: Option<(u64, Duration)>,
}

impl RateLimit {
    /// Limit every procedure to `limit` requests per `window`.
    pub fn per_window(limit: u64, window: Duration) -> Self {
        Self {
            backend: Arc::new(SlidingWindow::new()),
            rules: RuleSet::new(),
            default_limit: Some((limit, window)),
        }
    }

    /// Start from rules only; unmatched procedures are unlimited.
    pub fn rules(rules: RuleSet) -> Self {
        Self {
            backend: Arc::new(SlidingWindow::new()),
            rules,
            default_limit: None,
        }
    }

    pub fn rule(mut self, pattern: impl Into<String>, limit: u64, window: Duration) -> Self {
        self.rules = std::mem::take(&mut self.rules).rule(pattern, limit, window);
        self
    }

    pub fn backend(mut self, backend: impl RateLimitBackend) -> Self {
        self.backend = Arc::new(backend);
        self
    }

    fn limit_for(&self, procedure: &str) -> Option<(u64, Duration)> {
        self.rules
            .resolve(procedure)
            .map(|rule| (rule.limit, rule.window))
            .or(self.default_limit)
    }
}

/// The identity key a request is counted against.
fn limit_key(envelope: &Envelope, ctx: &Context) -> String {
    let auth = ctx.auth();
    if auth.authenticated {
        if let Some(principal) = &auth.principal {
            return format!("user:{principal}");
        }
    }
    let forwarded = envelope
        .metadata
        .get("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| envelope.metadata.get("x-real-ip").map(String::as_str));
    if let Some(ip) = forwarded {
        return format!("ip:{ip}");
    }
    format!("global:{}", envelope.procedure)
}

impl EnvelopeInterceptor for RateLimit {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn around(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> BoxFuture<'static, Result<HandlerOutput, RpcError>> {
        if matches!(
            envelope.kind,
            EnvelopeKind::Response | EnvelopeKind::Error | EnvelopeKind::StreamChunk | EnvelopeKind::StreamEnd
        ) {
            return next.run(envelope, ctx);
        }
        let Some((limit, window)) = self.limit_for(&envelope.procedure) else {
            return next.run(envelope, ctx);
        };

        let key = limit_key(&envelope, &ctx);
        let decision = self.backend.check(&key, limit, window);
        if !decision.allowed {
            let retry_after = decision.retry_after();
            tracing::debug!(procedure = %envelope.procedure, key = %key, "rate limited");
            return Box::pin(async move {
                Err(RpcError::new(
                    ErrorCode::RateLimited,
                    format!("rate limit of {limit} per window exceeded"),
                )
                .with_details(serde_json::json!({
                    "retryAfter": retry_after,
                    "limit": limit,
                })))
            });
        }
        next.run(envelope, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::{AuthInfo, Terminal};
    use serde_json::Value;

    fn ok_terminal() -> Terminal {
        Arc::new(|_envelope, _ctx| Box::pin(async { Ok(HandlerOutput::Single(Value::Null)) }))
    }

    fn request() -> Envelope {
        Envelope::request("1", "users.get", Value::Null)
    }

    #[tokio::test]
    async fn limit_plus_one_is_rejected() {
        let limiter = RateLimit::per_window(3, Duration::from_secs(1));
        for _ in 0..3 {
            limiter
                .around(request(), Context::new("1"), Next::terminal_only(ok_terminal()))
                .await
                .unwrap();
        }
        let err = limiter
            .around(request(), Context::new("1"), Next::terminal_only(ok_terminal()))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RateLimited);
        let details = err.details.unwrap();
        assert_eq!(details["limit"], 3);
        assert!(details["retryAfter"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn window_rollover_admits_again() {
        let limiter = RateLimit::per_window(1, Duration::from_millis(50));
        limiter
            .around(request(), Context::new("1"), Next::terminal_only(ok_terminal()))
            .await
            .unwrap();
        assert!(limiter
            .around(request(), Context::new("2"), Next::terminal_only(ok_terminal()))
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        limiter
            .around(request(), Context::new("3"), Next::terminal_only(ok_terminal()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn authenticated_callers_get_separate_buckets() {
        let limiter = RateLimit::per_window(1, Duration::from_secs(1));
        for user in ["ada", "grace"] {
            let ctx = Context::new("1").with_auth(AuthInfo::principal(user));
            limiter
                .around(request(), ctx, Next::terminal_only(ok_terminal()))
                .await
                .unwrap();
        }
        // Same user again: over the limit.
        let ctx = Context::new("2").with_auth(AuthInfo::principal("ada"));
        assert!(limiter
            .around(request(), ctx, Next::terminal_only(ok_terminal()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn forwarded_ip_is_used_for_anonymous_callers() {
        let limiter = RateLimit::per_window(1, Duration::from_secs(1));
        let from_ip = |ip: &str| {
            Envelope::request("1", "users.get", Value::Null)
                .with_metadata("x-forwarded-for", format!("{ip}, 10.0.0.1"))
        };

        limiter
            .around(from_ip("1.2.3.4"), Context::new("1"), Next::terminal_only(ok_terminal()))
            .await
            .unwrap();
        limiter
            .around(from_ip("5.6.7.8"), Context::new("2"), Next::terminal_only(ok_terminal()))
            .await
            .unwrap();
        assert!(limiter
            .around(from_ip("1.2.3.4"), Context::new("3"), Next::terminal_only(ok_terminal()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn rules_select_per_procedure_limits() {
        let limiter = RateLimit::rules(
            RuleSet::new().rule("admin.**", 1, Duration::from_secs(1)),
        );

        let admin = Envelope::request("1", "admin.users.delete", Value::Null);
        limiter
            .around(admin.clone(), Context::new("1"), Next::terminal_only(ok_terminal()))
            .await
            .unwrap();
        assert!(limiter
            .around(admin, Context::new("2"), Next::terminal_only(ok_terminal()))
            .await
            .is_err());

        // Unmatched procedures are unlimited.
        for i in 0..5 {
            limiter
                .around(request(), Context::new(format!("{i}")), Next::terminal_only(ok_terminal()))
                .await
                .unwrap();
        }
    }
}
