// crates/backend-lib/src/handlers/health.rs

/// Liveness probe
pub async fn health() -> &'static str {
    "Neurodyx Backend is running"
}
