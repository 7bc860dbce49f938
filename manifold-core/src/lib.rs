//! Core dispatch plane for the Manifold runtime.
//!
//! One handler registry, one router: procedures, streams, and events are
//! registered once and reached identically from every transport. The
//! router composes an onion-model interceptor chain around each dispatch
//! and guarantees exactly one terminal envelope per accepted request.

pub mod codec;
pub mod context;
pub mod envelope;
pub mod error;
pub mod etag;
pub mod id;
pub mod interceptor;
pub mod registry;
pub mod router;

pub use codec::{Codec, CodecRegistry, JsonCodec, TextCodec};
pub use context::{AuthInfo, CallFn, Context, TraceContext, MAX_CALLING_LEVEL};
pub use envelope::{Envelope, EnvelopeKind};
pub use error::{ErrorCategory, ErrorCode, RpcError};
pub use id::{generate_id, IdGenerator, DEFAULT_ID_LENGTH, URL_ALPHABET};
pub use interceptor::{EnvelopeInterceptor, HandlerOutput, Next, Terminal};
pub use registry::{
    AnyHandler, DeliveryGuarantee, EventEntry, EventOptions, HandlerKind, HandlerMeta,
    PayloadStream, ProcedureEntry, ProcedureOptions, Registry, RetryPolicy, StreamDirection,
    StreamEntry, StreamOptions,
};
pub use router::{EnvelopeStream, EventDispatch, InlineDispatch, Router, RouterBuilder, RouterResult};
