// ============================
// crates/backend-lib/src/middleware/auth.rs
// ============================
//! Bearer credential and admin checks.
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use serde_json::Value;

use crate::auth::{user_path, TokenKind};
use crate::error::AppError;
use crate::validation::validate_credential;
use crate::AppState;

/// Subject of a verified access credential, placed in the request
/// extensions by [`require_auth`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSubject(pub String);

impl<S> FromRequestParts<S> for AuthenticatedSubject
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedSubject>()
            .cloned()
            .ok_or(AppError::MissingCredential)
    }
}

fn bearer_token(request: &Request) -> Result<&str, AppError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(AppError::MissingCredential)?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or(AppError::MissingCredential)?;

    validate_credential(token).map_err(|_| AppError::InvalidCredential)
}

/// Verify the access credential and record its subject
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(&request)?;
    let claims = state.authority.verify_kind(token, TokenKind::Access)?;

    request
        .extensions_mut()
        .insert(AuthenticatedSubject(claims.sub));

    Ok(next.run(request).await)
}

/// Require `isAdmin == true` on the subject's user record.
///
/// Must run after [`require_auth`].
pub async fn require_admin(
    State(state): State<AppState>,
    subject: AuthenticatedSubject,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user = tokio::time::timeout(
        state.settings.auth.upstream_timeout(),
        state.store.get(&user_path(&subject.0)),
    )
    .await
    .map_err(|_| AppError::UpstreamTimeout("document store"))??;

    let is_admin = user
        .as_ref()
        .and_then(|doc| doc.get("isAdmin"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if !is_admin {
        tracing::warn!(subject = %subject.0, "admin access denied");
        return Err(AppError::Forbidden);
    }

    Ok(next.run(request).await)
}
