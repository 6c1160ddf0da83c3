use std::collections::HashMap;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};

use crate::{config::ApiToken, errors::AppError, logging::token_hint, AppState};

pub const SCOPE_EXCHANGE_READ: &str = "exchange:read";
/// Granted to unauthenticated callers: handshake, liveness and listings only.
pub const SCOPE_DISCOVERY: &str = "discovery";

/// Methods that reach backend content and need `exchange:read`.
const CALL_METHODS: &[&str] = &["tools/call", "resources/read", "prompts/get"];

/// Who is calling and what they may do. Inserted into request extensions by
/// [`resolve_bearer_token`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub principal: Option<String>,
    pub scopes: Vec<String>,
}

impl AuthContext {
    pub fn discovery() -> Self {
        Self {
            principal: None,
            scopes: vec![SCOPE_DISCOVERY.to_string()],
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|granted| granted == scope)
    }

    /// `None` when the method is allowed, otherwise the scope it needs.
    /// Methods the dispatcher does not know are left to it to reject.
    pub fn missing_scope_for(&self, method: &str) -> Option<&'static str> {
        if CALL_METHODS.contains(&method) && !self.has_scope(SCOPE_EXCHANGE_READ) {
            Some(SCOPE_EXCHANGE_READ)
        } else {
            None
        }
    }
}

/// Maps a presented bearer token to its grants. The authorization flow that
/// issues tokens lives outside this server.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Option<AuthContext>;
}

#[derive(Debug, Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, Vec<String>>,
}

impl StaticTokenValidator {
    pub fn new(tokens: &[ApiToken]) -> Self {
        Self {
            tokens: tokens
                .iter()
                .map(|entry| (entry.token.clone(), entry.scopes.clone()))
                .collect(),
        }
    }
}

impl TokenValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> Option<AuthContext> {
        self.tokens.get(token).map(|scopes| AuthContext {
            principal: Some(token_hint(token)),
            scopes: scopes.clone(),
        })
    }
}

pub async fn resolve_bearer_token(
    State(state): State<AppState>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let context = match auth_header {
        None => AuthContext::discovery(),
        Some(TypedHeader(auth)) => state.tokens.validate(auth.token()).ok_or_else(|| {
            AppError::unauthorized("invalid_token", "invalid bearer token")
        })?,
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
