//! Manifold — a unified multi-protocol service runtime.
//!
//! Register named procedure/stream/event handlers once; the runtime routes
//! traffic arriving over any enabled transport to the same handlers with
//! consistent semantics (interceptor chain, cancellation, error taxonomy).
//!
//! This facade crate re-exports the sub-crates behind feature flags.
//! Import everything you need with:
//!
//! ```ignore
//! use manifold::prelude::*;
//! ```
//!
//! # Feature flags
//!
//! | Feature      | Default | Crate                 |
//! |--------------|---------|-----------------------|
//! | `events`     | **yes** | `manifold-events`     |
//! | `utils`      | **yes** | `manifold-utils`      |
//! | `ws`         | **yes** | `manifold-ws`         |
//! | `cache`      | no      | `manifold-cache`      |
//! | `rate-limit` | no      | `manifold-rate-limit` |
//! | `full`       | no      | All of the above      |

// Re-export everything from manifold-core at the top level for convenience.
pub use manifold_core::*;

#[cfg(feature = "cache")]
pub use manifold_cache;

#[cfg(feature = "rate-limit")]
pub use manifold_rate_limit;

#[cfg(feature = "events")]
pub use manifold_events;

#[cfg(feature = "utils")]
pub use manifold_utils;

#[cfg(feature = "ws")]
pub use manifold_ws;

pub mod prelude {
    //! The types almost every Manifold service touches.

    pub use manifold_core::{
        AuthInfo, Context, Envelope, EnvelopeKind, ErrorCode, EventOptions, HandlerKind,
        PayloadStream, ProcedureOptions, Registry, Router, RouterResult, RpcError, StreamOptions,
    };

    #[cfg(feature = "events")]
    pub use manifold_events::EventDispatcher;

    #[cfg(feature = "utils")]
    pub use manifold_utils::{
        Authorize, Bulkhead, Cached, Dedup, Guard, Logged, RateLimit, SizeLimit, Timed, Validation,
        ValidatorRegistry,
    };

    #[cfg(feature = "ws")]
    pub use manifold_ws::{WsServer, WsServerConfig};
}
