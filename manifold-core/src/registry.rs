use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::context::Context;
use crate::error::{ErrorCode, RpcError};
use crate::interceptor::EnvelopeInterceptor;

/// Handler flavor. Names are unique across the union of all three kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Procedure,
    Stream,
    Event,
}

impl HandlerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerKind::Procedure => "procedure",
            HandlerKind::Stream => "stream",
            HandlerKind::Event => "event",
        }
    }
}

/// Which side produces the stream payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StreamDirection {
    #[default]
    Server,
    Client,
    Duplex,
}

/// Delivery guarantee for event handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeliveryGuarantee {
    #[default]
    BestEffort,
    AtLeastOnce,
}

/// Retry policy applied by the event delivery engine for `AtLeastOnce`
/// handlers. Delay grows linearly: `backoff * attempt`.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

/// HTTP mapping hint for downstream adapters (not interpreted by the core).
#[derive(Clone, Debug)]
pub struct HttpHint {
    pub path: String,
    pub method: String,
}

/// gRPC mapping hint for downstream adapters.
#[derive(Clone, Debug)]
pub struct GrpcHint {
    pub service: String,
    pub method: String,
}

/// Metadata attached to a registered handler. Everything is optional;
/// downstream consumers (doc generators, protocol adapters) read what they
/// understand.
#[derive(Clone, Debug, Default)]
pub struct HandlerMeta {
    pub summary: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub content_types: Vec<String>,
    pub stream_direction: Option<StreamDirection>,
    pub delivery: Option<DeliveryGuarantee>,
    pub retry: Option<RetryPolicy>,
    pub http: Option<HttpHint>,
    pub json_rpc_method: Option<String>,
    pub grpc: Option<GrpcHint>,
}

/// A lazy sequence of payload items produced by a stream handler.
pub type PayloadStream = Pin<Box<dyn Stream<Item = Result<Value, RpcError>> + Send>>;

pub type ProcedureFn =
    Arc<dyn Fn(Value, Context) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;
pub type StreamFn =
    Arc<dyn Fn(Value, Context) -> BoxFuture<'static, Result<PayloadStream, RpcError>> + Send + Sync>;
pub type EventFn =
    Arc<dyn Fn(Value, Context) -> BoxFuture<'static, Result<(), RpcError>> + Send + Sync>;

/// Options for [`Registry::register_procedure`].
#[derive(Clone, Default)]
pub struct ProcedureOptions {
    pub meta: HandlerMeta,
    pub interceptors: Vec<Arc<dyn EnvelopeInterceptor>>,
}

impl ProcedureOptions {
    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.meta.summary = Some(summary.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.meta.tags.push(tag.into());
        self
    }

    pub fn http(mut self, method: impl Into<String>, path: impl Into<String>) -> Self {
        self.meta.http = Some(HttpHint {
            method: method.into(),
            path: path.into(),
        });
        self
    }

    pub fn json_rpc(mut self, method: impl Into<String>) -> Self {
        self.meta.json_rpc_method = Some(method.into());
        self
    }

    pub fn grpc(mut self, service: impl Into<String>, method: impl Into<String>) -> Self {
        self.meta.grpc = Some(GrpcHint {
            service: service.into(),
            method: method.into(),
        });
        self
    }

    pub fn intercept(mut self, interceptor: impl EnvelopeInterceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }
}

/// Options for [`Registry::register_stream`].
#[derive(Clone, Default)]
pub struct StreamOptions {
    pub meta: HandlerMeta,
    pub interceptors: Vec<Arc<dyn EnvelopeInterceptor>>,
}

impl StreamOptions {
    pub fn direction(mut self, direction: StreamDirection) -> Self {
        self.meta.stream_direction = Some(direction);
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.meta.summary = Some(summary.into());
        self
    }

    pub fn intercept(mut self, interceptor: impl EnvelopeInterceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }
}

/// Options for [`Registry::register_event`].
#[derive(Clone, Default)]
pub struct EventOptions {
    pub meta: HandlerMeta,
    pub interceptors: Vec<Arc<dyn EnvelopeInterceptor>>,
}

impl EventOptions {
    pub fn delivery(mut self, guarantee: DeliveryGuarantee) -> Self {
        self.meta.delivery = Some(guarantee);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.meta.retry = Some(policy);
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.meta.summary = Some(summary.into());
        self
    }
}

/// A registered unary handler.
pub struct ProcedureEntry {
    pub name: String,
    pub handler: ProcedureFn,
    pub meta: HandlerMeta,
    pub interceptors: Vec<Arc<dyn EnvelopeInterceptor>>,
}

/// A registered stream handler.
pub struct StreamEntry {
    pub name: String,
    pub handler: StreamFn,
    pub meta: HandlerMeta,
    pub interceptors: Vec<Arc<dyn EnvelopeInterceptor>>,
}

impl StreamEntry {
    pub fn direction(&self) -> StreamDirection {
        self.meta.stream_direction.unwrap_or_default()
    }
}

/// A registered event handler.
pub struct EventEntry {
    pub name: String,
    pub handler: EventFn,
    pub meta: HandlerMeta,
    pub interceptors: Vec<Arc<dyn EnvelopeInterceptor>>,
}

impl EventEntry {
    pub fn delivery(&self) -> DeliveryGuarantee {
        self.meta.delivery.unwrap_or_default()
    }

    pub fn retry(&self) -> RetryPolicy {
        self.meta.retry.unwrap_or_default()
    }
}

/// Any registered handler, for kind-agnostic resolution.
#[derive(Clone)]
pub enum AnyHandler {
    Procedure(Arc<ProcedureEntry>),
    Stream(Arc<StreamEntry>),
    Event(Arc<EventEntry>),
}

impl AnyHandler {
    pub fn kind(&self) -> HandlerKind {
        match self {
            AnyHandler::Procedure(_) => HandlerKind::Procedure,
            AnyHandler::Stream(_) => HandlerKind::Stream,
            AnyHandler::Event(_) => HandlerKind::Event,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AnyHandler::Procedure(e) => &e.name,
            AnyHandler::Stream(e) => &e.name,
            AnyHandler::Event(e) => &e.name,
        }
    }

    pub fn interceptors(&self) -> &[Arc<dyn EnvelopeInterceptor>] {
        match self {
            AnyHandler::Procedure(e) => &e.interceptors,
            AnyHandler::Stream(e) => &e.interceptors,
            AnyHandler::Event(e) => &e.interceptors,
        }
    }
}

/// The handler registry: procedure, stream, and event declarations keyed by
/// dotted name.
///
/// Registrations happen at startup, before the registry is frozen behind an
/// `Arc` and handed to the router; lookups afterwards are lock-free reads.
/// Listing order is stable insertion order.
#[derive(Default)]
pub struct Registry {
    procedures: HashMap<String, Arc<ProcedureEntry>>,
    streams: HashMap<String, Arc<StreamEntry>>,
    events: HashMap<String, Arc<EventEntry>>,
    order: Vec<(HandlerKind, String)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_free(&self, name: &str) -> Result<(), RpcError> {
        if self.contains(name) {
            return Err(RpcError::new(
                ErrorCode::AlreadyExists,
                format!("handler '{name}' is already registered"),
            ));
        }
        Ok(())
    }

    /// Register a unary handler. Fails with `ALREADY_EXISTS` if any kind of
    /// handler already holds the name.
    pub fn register_procedure<F, Fut>(
        &mut self,
        name: impl Into<String>,
        handler: F,
        options: ProcedureOptions,
    ) -> Result<(), RpcError>
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let name = name.into();
        self.ensure_free(&name)?;
        let handler: ProcedureFn = Arc::new(move |payload, ctx| Box::pin(handler(payload, ctx)));
        self.procedures.insert(
            name.clone(),
            Arc::new(ProcedureEntry {
                name: name.clone(),
                handler,
                meta: options.meta,
                interceptors: options.interceptors,
            }),
        );
        self.order.push((HandlerKind::Procedure, name));
        Ok(())
    }

    /// Register a stream handler. Direction defaults to server-side.
    pub fn register_stream<F, Fut>(
        &mut self,
        name: impl Into<String>,
        handler: F,
        mut options: StreamOptions,
    ) -> Result<(), RpcError>
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PayloadStream, RpcError>> + Send + 'static,
    {
        let name = name.into();
        self.ensure_free(&name)?;
        options.meta.stream_direction.get_or_insert(StreamDirection::Server);
        let handler: StreamFn = Arc::new(move |payload, ctx| Box::pin(handler(payload, ctx)));
        self.streams.insert(
            name.clone(),
            Arc::new(StreamEntry {
                name: name.clone(),
                handler,
                meta: options.meta,
                interceptors: options.interceptors,
            }),
        );
        self.order.push((HandlerKind::Stream, name));
        Ok(())
    }

    /// Register an event handler. Delivery defaults to best-effort.
    pub fn register_event<F, Fut>(
        &mut self,
        name: impl Into<String>,
        handler: F,
        mut options: EventOptions,
    ) -> Result<(), RpcError>
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        let name = name.into();
        self.ensure_free(&name)?;
        options.meta.delivery.get_or_insert(DeliveryGuarantee::BestEffort);
        let handler: EventFn = Arc::new(move |payload, ctx| Box::pin(handler(payload, ctx)));
        self.events.insert(
            name.clone(),
            Arc::new(EventEntry {
                name: name.clone(),
                handler,
                meta: options.meta,
                interceptors: options.interceptors,
            }),
        );
        self.order.push((HandlerKind::Event, name));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.procedures.contains_key(name)
            || self.streams.contains_key(name)
            || self.events.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<AnyHandler> {
        if let Some(entry) = self.procedures.get(name) {
            return Some(AnyHandler::Procedure(entry.clone()));
        }
        if let Some(entry) = self.streams.get(name) {
            return Some(AnyHandler::Stream(entry.clone()));
        }
        self.events.get(name).map(|e| AnyHandler::Event(e.clone()))
    }

    pub fn get_procedure(&self, name: &str) -> Option<Arc<ProcedureEntry>> {
        self.procedures.get(name).cloned()
    }

    pub fn get_stream(&self, name: &str) -> Option<Arc<StreamEntry>> {
        self.streams.get(name).cloned()
    }

    pub fn get_event(&self, name: &str) -> Option<Arc<EventEntry>> {
        self.events.get(name).cloned()
    }

    pub fn list_procedures(&self) -> Vec<Arc<ProcedureEntry>> {
        self.in_order(HandlerKind::Procedure, |name| self.procedures.get(name).cloned())
    }

    pub fn list_streams(&self) -> Vec<Arc<StreamEntry>> {
        self.in_order(HandlerKind::Stream, |name| self.streams.get(name).cloned())
    }

    pub fn list_events(&self) -> Vec<Arc<EventEntry>> {
        self.in_order(HandlerKind::Event, |name| self.events.get(name).cloned())
    }

    /// All registered names in insertion order, with their kinds.
    pub fn list_names(&self) -> Vec<(HandlerKind, String)> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn in_order<T>(&self, kind: HandlerKind, get: impl Fn(&str) -> Option<T>) -> Vec<T> {
        self.order
            .iter()
            .filter(|(k, _)| *k == kind)
            .filter_map(|(_, name)| get(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn echo_options() -> ProcedureOptions {
        ProcedureOptions::default().summary("echo")
    }

    #[test]
    fn duplicate_names_fail_across_kinds() {
        let mut registry = Registry::new();
        registry
            .register_procedure("users.get", |p, _| async move { Ok(p) }, echo_options())
            .unwrap();

        let err = registry
            .register_stream(
                "users.get",
                |_, _| async move {
                    Ok(Box::pin(stream::empty()) as PayloadStream)
                },
                StreamOptions::default(),
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);

        let err = registry
            .register_event("users.get", |_, _| async move { Ok(()) }, EventOptions::default())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);
    }

    #[test]
    fn listing_preserves_insertion_order() {
        let mut registry = Registry::new();
        for name in ["c.third", "a.first", "b.second"] {
            registry
                .register_procedure(name, |p, _| async move { Ok(p) }, ProcedureOptions::default())
                .unwrap();
        }
        let names: Vec<_> = registry.list_procedures().iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, ["c.third", "a.first", "b.second"]);
    }

    #[test]
    fn defaults_applied_on_registration() {
        let mut registry = Registry::new();
        registry
            .register_stream(
                "logs.tail",
                |_, _| async move {
                    Ok(Box::pin(stream::empty()) as PayloadStream)
                },
                StreamOptions::default(),
            )
            .unwrap();
        registry
            .register_event("audit.record", |_, _| async move { Ok(()) }, EventOptions::default())
            .unwrap();

        let stream_entry = registry.get_stream("logs.tail").unwrap();
        assert_eq!(stream_entry.direction(), StreamDirection::Server);

        let event_entry = registry.get_event("audit.record").unwrap();
        assert_eq!(event_entry.delivery(), DeliveryGuarantee::BestEffort);
    }

    #[test]
    fn kind_agnostic_lookup() {
        let mut registry = Registry::new();
        registry
            .register_event("audit.record", |_, _| async move { Ok(()) }, EventOptions::default())
            .unwrap();
        let handler = registry.get("audit.record").unwrap();
        assert_eq!(handler.kind(), HandlerKind::Event);
        assert_eq!(handler.name(), "audit.record");
        assert!(registry.get("missing").is_none());
    }
}
