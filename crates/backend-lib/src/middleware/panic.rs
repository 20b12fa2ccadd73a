// ============================
// crates/backend-lib/src/middleware/panic.rs
// ============================
//! Last-resort conversion of handler panics into a 500 response.
use std::any::Any;

use axum::response::{IntoResponse, Response};
use metrics::counter;

use crate::error::AppError;
use crate::metrics::PANIC_CAUGHT;

/// Response for `tower_http::catch_panic::CatchPanicLayer::custom`
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic payload".to_string()
    };

    counter!(PANIC_CAUGHT).increment(1);
    tracing::error!(%detail, "recovered from panic in request handler");

    AppError::Internal(detail).into_response()
}
