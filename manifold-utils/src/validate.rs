use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use serde_json::Value;

use manifold_core::{
    Context, Envelope, EnvelopeInterceptor, EnvelopeKind, HandlerOutput, Next, RpcError,
};

/// Adapter seam for schema validation libraries.
///
/// Implementations check a payload against one schema and report failures
/// as a `VALIDATION_ERROR` (use [`RpcError::new`] with
/// [`ErrorCode::ValidationError`](manifold_core::ErrorCode::ValidationError)
/// and put field-level details into `details`).
pub trait SchemaAdapter: Send + Sync + 'static {
    fn validate(&self, payload: &Value) -> Result<(), RpcError>;
}

impl<F> SchemaAdapter for F
where
    F: Fn(&Value) -> Result<(), RpcError> + Send + Sync + 'static,
{
    fn validate(&self, payload: &Value) -> Result<(), RpcError> {
        self(payload)
    }
}

/// Compiled validators keyed by procedure name.
///
/// Entries are long-lived; `reset` prunes them all (e.g. after schemas are
/// reloaded). Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: Arc<RwLock<HashMap<String, Arc<dyn SchemaAdapter>>>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, procedure: impl Into<String>, adapter: impl SchemaAdapter) {
        self.validators
            .write()
            .expect("validator lock poisoned")
            .insert(procedure.into(), Arc::new(adapter));
    }

    pub fn get(&self, procedure: &str) -> Option<Arc<dyn SchemaAdapter>> {
        self.validators
            .read()
            .expect("validator lock poisoned")
            .get(procedure)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.validators.read().expect("validator lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every compiled validator.
    pub fn reset(&self) {
        self.validators.write().expect("validator lock poisoned").clear();
    }
}

/// Runs the registered validator (if any) for the target procedure before
/// the handler. Procedures without a validator pass through untouched.
pub struct Validation {
    registry: ValidatorRegistry,
}

impl Validation {
    pub fn new(registry: ValidatorRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ValidatorRegistry {
        &self.registry
    }
}

impl EnvelopeInterceptor for Validation {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn around(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> BoxFuture<'static, Result<HandlerOutput, RpcError>> {
        if matches!(envelope.kind, EnvelopeKind::Request | EnvelopeKind::Event) {
            if let Some(adapter) = self.registry.get(&envelope.procedure) {
                if let Err(err) = adapter.validate(&envelope.payload) {
                    tracing::debug!(procedure = %envelope.procedure, "payload failed validation");
                    return Box::pin(async move { Err(err) });
                }
            }
        }
        next.run(envelope, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_core::{ErrorCode, Terminal};

    fn require_id(payload: &Value) -> Result<(), RpcError> {
        if payload.get("id").and_then(Value::as_str).is_some() {
            Ok(())
        } else {
            Err(RpcError::new(ErrorCode::ValidationError, "payload requires a string 'id'")
                .with_details(serde_json::json!({ "field": "id" })))
        }
    }

    fn ok_terminal() -> Terminal {
        Arc::new(|_e, _c| Box::pin(async { Ok(HandlerOutput::Single(Value::Null)) }))
    }

    #[tokio::test]
    async fn invalid_payloads_fail_with_validation_error() {
        let registry = ValidatorRegistry::new();
        registry.register("users.get", require_id);
        let validation = Validation::new(registry);

        let env = Envelope::request("1", "users.get", serde_json::json!({}));
        let err = validation
            .around(env, Context::new("1"), Next::terminal_only(ok_terminal()))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert_eq!(err.status(), 400);
        assert_eq!(err.details.unwrap()["field"], "id");
    }

    #[tokio::test]
    async fn valid_payloads_pass() {
        let registry = ValidatorRegistry::new();
        registry.register("users.get", require_id);
        let validation = Validation::new(registry);

        let env = Envelope::request("1", "users.get", serde_json::json!({ "id": "u-1" }));
        validation
            .around(env, Context::new("1"), Next::terminal_only(ok_terminal()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unvalidated_procedures_pass_through() {
        let validation = Validation::new(ValidatorRegistry::new());
        let env = Envelope::request("1", "anything.goes", serde_json::json!(42));
        validation
            .around(env, Context::new("1"), Next::terminal_only(ok_terminal()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reset_prunes_compiled_validators() {
        let registry = ValidatorRegistry::new();
        registry.register("users.get", require_id);
        assert_eq!(registry.len(), 1);

        registry.reset();
        assert!(registry.is_empty());

        let validation = Validation::new(registry);
        let env = Envelope::request("1", "users.get", serde_json::json!({}));
        validation
            .around(env, Context::new("1"), Next::terminal_only(ok_terminal()))
            .await
            .unwrap();
    }
}
