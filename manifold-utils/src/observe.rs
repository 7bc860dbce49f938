use futures_util::future::BoxFuture;
use manifold_core::{Context, Envelope, EnvelopeInterceptor, HandlerOutput, Next, RpcError};

/// Log level for `Logged` and `Timed` interceptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Log a message at the given level using `tracing`.
pub fn log_at_level(level: LogLevel, procedure: &str, msg: &str) {
    match level {
        LogLevel::Trace => tracing::trace!(procedure = procedure, "{}", msg),
        LogLevel::Debug => tracing::debug!(procedure = procedure, "{}", msg),
        LogLevel::Info => tracing::info!(procedure = procedure, "{}", msg),
        LogLevel::Warn => tracing::warn!(procedure = procedure, "{}", msg),
        LogLevel::Error => tracing::error!(procedure = procedure, "{}", msg),
    }
}

// ---------------------------------------------------------------------------
// Logged
// ---------------------------------------------------------------------------

/// Logs entry and exit of a dispatch at the specified level.
pub struct Logged {
    pub level: LogLevel,
}

impl Logged {
    pub fn new() -> Self {
        Logged { level: LogLevel::Info }
    }
    pub fn info() -> Self {
        Logged { level: LogLevel::Info }
    }
    pub fn debug() -> Self {
        Logged { level: LogLevel::Debug }
    }
    pub fn warn() -> Self {
        Logged { level: LogLevel::Warn }
    }
    pub fn trace() -> Self {
        Logged { level: LogLevel::Trace }
    }
    pub fn level(level: LogLevel) -> Self {
        Logged { level }
    }
}

impl Default for Logged {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeInterceptor for Logged {
    fn name(&self) -> &'static str {
        "logged"
    }

    fn around(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> BoxFuture<'static, Result<HandlerOutput, RpcError>> {
        let level = self.level;
        Box::pin(async move {
            let procedure = envelope.procedure.clone();
            log_at_level(level, &procedure, "entering");
            let result = next.run(envelope, ctx).await;
            match &result {
                Ok(_) => log_at_level(level, &procedure, "exiting"),
                Err(err) => log_at_level(level, &procedure, &format!("failed code={}", err.code.as_str())),
            }
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Timed
// ---------------------------------------------------------------------------

/// Measures and logs the execution time of a dispatch.
///
/// If `threshold_ms` is set, only logs when execution exceeds the threshold.
pub struct Timed {
    pub level: LogLevel,
    pub threshold_ms: Option<u64>,
}

impl Timed {
    pub fn new() -> Self {
        Timed { level: LogLevel::Info, threshold_ms: None }
    }
    pub fn info() -> Self {
        Timed { level: LogLevel::Info, threshold_ms: None }
    }
    pub fn debug() -> Self {
        Timed { level: LogLevel::Debug, threshold_ms: None }
    }
    pub fn threshold(ms: u64) -> Self {
        Timed { level: LogLevel::Info, threshold_ms: Some(ms) }
    }
    pub fn threshold_warn(ms: u64) -> Self {
        Timed { level: LogLevel::Warn, threshold_ms: Some(ms) }
    }
}

impl Default for Timed {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeInterceptor for Timed {
    fn name(&self) -> &'static str {
        "timed"
    }

    fn around(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> BoxFuture<'static, Result<HandlerOutput, RpcError>> {
        let level = self.level;
        let threshold_ms = self.threshold_ms;
        Box::pin(async move {
            let procedure = envelope.procedure.clone();
            let start = std::time::Instant::now();
            let result = next.run(envelope, ctx).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;
            match threshold_ms {
                Some(threshold) if elapsed_ms <= threshold => {}
                _ => log_at_level(level, &procedure, &format!("elapsed_ms={elapsed_ms}")),
            }
            result
        })
    }
}
