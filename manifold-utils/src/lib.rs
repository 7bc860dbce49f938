//! Request-level interceptors for the Manifold router.
//!
//! All interceptors here implement
//! [`EnvelopeInterceptor`](manifold_core::EnvelopeInterceptor) and can be
//! attached globally (`Router::builder(...).intercept(...)`) or per handler
//! (`ProcedureOptions::default().intercept(...)`).

mod bulkhead;
mod cached;
mod dedup;
mod fingerprint;
mod guard;
mod observe;
mod rate_limit;
mod size_limit;
mod validate;

pub use bulkhead::Bulkhead;
pub use cached::Cached;
pub use dedup::Dedup;
pub use fingerprint::payload_fingerprint;
pub use guard::{Authorize, Guard};
pub use observe::{Logged, LogLevel, Timed};
pub use rate_limit::RateLimit;
pub use size_limit::SizeLimit;
pub use validate::{SchemaAdapter, Validation, ValidatorRegistry};
