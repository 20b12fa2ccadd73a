// crates/backend-lib/src/middleware/mod.rs

//! Middleware and request extractors for the Neurodyx REST API.

pub mod auth;
pub mod client_addr;
pub mod panic;
pub mod rate_limit;

pub use auth::{require_admin, require_auth, AuthenticatedSubject};
pub use client_addr::ClientAddr;
pub use panic::handle_panic;
pub use rate_limit::api_rate_limit;

#[cfg(test)]
mod middleware_tests;
