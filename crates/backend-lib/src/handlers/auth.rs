// ============================
// crates/backend-lib/src/handlers/auth.rs
// ============================
//! Login and refresh endpoints.
use axum::extract::State;
use neurodyx_common::{AuthRequest, AuthResponse, RefreshRequest};

use crate::error::AppError;
use crate::extract::Json;
use crate::middleware::ClientAddr;
use crate::AppState;

/// `POST /api/auth`
pub async fn authenticate(
    State(state): State<AppState>,
    ClientAddr(addr): ClientAddr,
    Json(request): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    let response = state.pipeline.authenticate(&request, addr).await?;
    Ok(Json(response))
}

/// `POST /api/refresh`
pub async fn refresh(
    State(state): State<AppState>,
    ClientAddr(addr): ClientAddr,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    let response = state.pipeline.refresh(&request.refresh_token, addr).await?;
    Ok(Json(response))
}
