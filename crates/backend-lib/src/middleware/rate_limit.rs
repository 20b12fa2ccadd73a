// ============================
// crates/backend-lib/src/middleware/rate_limit.rs
// ============================
//! Per-subject rate limiting for authenticated API routes.
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::auth::RateLimitKey;
use crate::error::AppError;
use crate::middleware::{AuthenticatedSubject, ClientAddr};
use crate::AppState;

/// Rate limiter middleware.
///
/// Keyed by the authenticated subject when [`require_auth`] ran first,
/// otherwise by client address.
///
/// [`require_auth`]: crate::middleware::require_auth
pub async fn api_rate_limit(
    State(state): State<AppState>,
    ClientAddr(addr): ClientAddr,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let subject = request.extensions().get::<AuthenticatedSubject>();
    let key = RateLimitKey::resolve(subject.map(|s| s.0.as_str()), addr);

    if !state.api_limiter.allow(&key) {
        return Err(AppError::RateLimited);
    }

    // Continue to next middleware/handler
    Ok(next.run(request).await)
}
