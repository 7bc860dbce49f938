use std::sync::Arc;

use futures_util::future::BoxFuture;

use manifold_core::{
    AuthInfo, Context, Envelope, EnvelopeInterceptor, ErrorCode, HandlerOutput, Next, RpcError,
};

/// An access requirement evaluated against the request's [`AuthInfo`].
#[derive(Clone)]
pub enum Guard {
    /// `true` requires an authenticated caller; `false` allows anyone.
    Authenticated(bool),
    /// Requires one specific scope.
    Scope(String),
    /// Requires at least one of the listed scopes.
    AnyScope(Vec<String>),
    /// Requires a role.
    Role(String),
    /// Arbitrary predicate over the auth info.
    Check(Arc<dyn Fn(&AuthInfo) -> bool + Send + Sync>),
    /// Role plus scopes plus an optional predicate, all of which must hold.
    All {
        role: Option<String>,
        scopes: Vec<String>,
        check: Option<Arc<dyn Fn(&AuthInfo) -> bool + Send + Sync>>,
    },
}

impl Guard {
    pub fn scope(scope: impl Into<String>) -> Self {
        Guard::Scope(scope.into())
    }

    pub fn any_scope(scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Guard::AnyScope(scopes.into_iter().map(Into::into).collect())
    }

    pub fn role(role: impl Into<String>) -> Self {
        Guard::Role(role.into())
    }

    pub fn check(f: impl Fn(&AuthInfo) -> bool + Send + Sync + 'static) -> Self {
        Guard::Check(Arc::new(f))
    }

    /// Evaluate against auth info. `Ok(())` means pass.
    fn evaluate(&self, auth: &AuthInfo) -> Result<(), RpcError> {
        let authenticated = || -> Result<(), RpcError> {
            if auth.authenticated {
                Ok(())
            } else {
                Err(RpcError::new(ErrorCode::Unauthenticated, "authentication required"))
            }
        };
        match self {
            Guard::Authenticated(false) => Ok(()),
            Guard::Authenticated(true) => authenticated(),
            Guard::Scope(scope) => {
                authenticated()?;
                if auth.has_scope(scope) {
                    Ok(())
                } else {
                    Err(RpcError::permission_denied(format!("missing scope '{scope}'")))
                }
            }
            Guard::AnyScope(scopes) => {
                authenticated()?;
                if scopes.iter().any(|s| auth.has_scope(s)) {
                    Ok(())
                } else {
                    Err(RpcError::permission_denied("none of the required scopes present"))
                }
            }
            Guard::Role(role) => {
                authenticated()?;
                if auth.has_role(role) {
                    Ok(())
                } else {
                    Err(RpcError::permission_denied(format!("missing role '{role}'")))
                }
            }
            Guard::Check(f) => {
                authenticated()?;
                if f(auth) {
                    Ok(())
                } else {
                    Err(RpcError::permission_denied("access check failed"))
                }
            }
            Guard::All { role, scopes, check } => {
                authenticated()?;
                if let Some(role) = role {
                    if !auth.has_role(role) {
                        return Err(RpcError::permission_denied(format!("missing role '{role}'")));
                    }
                }
                for scope in scopes {
                    if !auth.has_scope(scope) {
                        return Err(RpcError::permission_denied(format!("missing scope '{scope}'")));
                    }
                }
                if let Some(check) = check {
                    if !check(auth) {
                        return Err(RpcError::permission_denied("access check failed"));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Enforces a [`Guard`] before the handler runs.
///
/// Unauthenticated callers fail with `UNAUTHENTICATED` (401); authenticated
/// callers missing a requirement fail with `PERMISSION_DENIED` (403).
pub struct Authorize {
    guard: Guard,
}

impl Authorize {
    pub fn new(guard: Guard) -> Self {
        Self { guard }
    }

    /// Requires any authenticated caller.
    pub fn authenticated() -> Self {
        Self::new(Guard::Authenticated(true))
    }

    pub fn scope(scope: impl Into<String>) -> Self {
        Self::new(Guard::scope(scope))
    }

    pub fn role(role: impl Into<String>) -> Self {
        Self::new(Guard::role(role))
    }
}

impl EnvelopeInterceptor for Authorize {
    fn name(&self) -> &'static str {
        "authorize"
    }

    fn around(
        &self,
        envelope: Envelope,
        ctx: Context,
        next: Next,
    ) -> BoxFuture<'static, Result<HandlerOutput, RpcError>> {
        if let Err(err) = self.guard.evaluate(ctx.auth()) {
            tracing::debug!(procedure = %envelope.procedure, code = err.code.as_str(), "guard rejected request");
            return Box::pin(async move { Err(err) });
        }
        next.run(envelope, ctx)
    }
}
