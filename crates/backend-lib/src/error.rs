// crates/backend-lib/src/error.rs

//! Central error type + Axum integration.
use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use neurodyx_common::ErrorResponse;
use thiserror::Error;

use crate::auth::{IdentityError, TokenError};
use crate::storage::StoreError;
use crate::validation::ValidationError;

/// Application error types with error codes and context.
///
/// This is the only type that crosses the HTTP boundary. Lower layers keep
/// their own error enums; the conversions below decide how much of them the
/// caller gets to see.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Invalid credential")]
    InvalidCredential,

    #[error("Missing or malformed Authorization header")]
    MissingCredential,

    #[error("Admin access required")]
    Forbidden,

    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(&'static str),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Identity provider unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::InvalidCredential | AppError::MissingCredential => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::IdentityUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::PersistenceFailure(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::RateLimited => "RATE_001",
            AppError::InvalidCredential => "AUTH_001",
            AppError::MissingCredential => "AUTH_002",
            AppError::Forbidden => "AUTH_003",
            AppError::UpstreamTimeout(_) => "UPSTREAM_001",
            AppError::IdentityUnavailable(_) => "UPSTREAM_002",
            AppError::PersistenceFailure(_) => "STORE_001",
            AppError::NotFound(_) => "NF_001",
            AppError::InvalidInput(_) => "VAL_001",
            AppError::Internal(_) => "INT_001",
        }
    }

    /// Get a sanitized message suitable for the client.
    ///
    /// Credential failures share one message regardless of the reason.
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::RateLimited => "Rate limit exceeded".to_string(),
            AppError::InvalidCredential => "Invalid credential".to_string(),
            AppError::MissingCredential => "Missing or malformed Authorization header".to_string(),
            AppError::Forbidden => "Admin access required".to_string(),
            AppError::UpstreamTimeout(_) => "Upstream service timed out, please retry".to_string(),
            AppError::IdentityUnavailable(_) => "Authentication service unavailable".to_string(),
            AppError::PersistenceFailure(_) => "Failed to save user data".to_string(),
            AppError::NotFound(_) => "Resource not found".to_string(),
            AppError::InvalidInput(detail) => format!("Invalid input: {detail}"),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.error_code(), error = %self, "request failed");
        } else {
            tracing::debug!(code = self.error_code(), error = %self, "request rejected");
        }

        let body = ErrorResponse {
            error: self.sanitized_message(),
            code: Some(self.error_code().to_string()),
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        // The reason stays in the logs; the caller only learns "invalid".
        tracing::debug!(reason = %err, "credential rejected");
        match err {
            TokenError::Signing(msg) => AppError::Internal(msg),
            _ => AppError::InvalidCredential,
        }
    }
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Rejected(reason) => {
                tracing::debug!(%reason, "external credential rejected");
                AppError::InvalidCredential
            },
            IdentityError::Unavailable(msg) => AppError::IdentityUnavailable(msg),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(path) => AppError::NotFound(path),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::InvalidInput(err.to_string())
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::InvalidInput(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::InvalidInput(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::InvalidInput(rejection.body_text())
    }
}
