// ============================
// crates/backend-lib/src/lib.rs
// ============================
//! Core backend-lib functionality for the Neurodyx REST backend.
//!
//! The request-gating core lives in [`auth`] (credentials, rate limiting,
//! login and refresh flows) and [`cache`]; [`storage`] and
//! [`auth::identity`] are the seams to the document store and the external
//! identity provider.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod router;
pub mod screening;
pub mod storage;
pub mod sweeper;
pub mod validation;

use std::sync::Arc;

use crate::auth::{AuthPipeline, IdentityVerifier, KeyedRateLimiter, TokenAuthority};
use crate::cache::TtlCache;
use crate::config::{ConfigError, Settings};
use crate::screening::ScreeningService;
use crate::storage::DocumentStore;
use crate::sweeper::PeriodicSweep;

pub use router::create_router;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Signs and verifies internal credentials
    pub authority: Arc<TokenAuthority>,
    /// Login and refresh flows
    pub pipeline: Arc<AuthPipeline>,
    /// Rate limiter for authenticated API routes
    pub api_limiter: KeyedRateLimiter,
    /// Screening question bank
    pub screening: Arc<ScreeningService>,
    /// Document store
    pub store: Arc<dyn DocumentStore>,
    /// Settings
    pub settings: Arc<Settings>,
}

impl AppState {
    /// Create a new application state.
    ///
    /// # Errors
    /// Any [`ConfigError`] from [`Settings::validate`]; the process must not
    /// start with them.
    pub fn new(
        settings: Settings,
        store: Arc<dyn DocumentStore>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;

        let authority = Arc::new(TokenAuthority::new(settings.auth.jwt_secret.as_bytes())?);
        let pipeline = Arc::new(AuthPipeline::new(
            authority.clone(),
            verifier,
            store.clone(),
            &settings,
        ));
        let api_limiter = KeyedRateLimiter::new("api", settings.rate_limit.api.into());
        let question_cache = TtlCache::new(
            "questions",
            std::time::Duration::from_secs(settings.cache.ttl_secs),
        );
        let screening = Arc::new(ScreeningService::new(
            store.clone(),
            question_cache,
            settings.auth.upstream_timeout(),
        ));

        Ok(Self {
            authority,
            pipeline,
            api_limiter,
            screening,
            store,
            settings: Arc::new(settings),
        })
    }

    /// Start the periodic sweeps of every limiter and cache.
    ///
    /// Must be called from within a tokio runtime. Dropping the handles stops
    /// the sweeps; [`shutdown_sweepers`] stops them and waits.
    pub fn spawn_sweepers(&self) -> Vec<PeriodicSweep> {
        let limiter_interval = std::time::Duration::from_secs(self.settings.rate_limit.sweep_interval_secs);
        let cache_interval = std::time::Duration::from_secs(self.settings.cache.sweep_interval_secs);

        vec![
            self.pipeline.auth_limiter().spawn_sweeper(limiter_interval),
            self.pipeline.refresh_limiter().spawn_sweeper(limiter_interval),
            self.api_limiter.spawn_sweeper(limiter_interval),
            self.screening.cache().spawn_sweeper(cache_interval),
            self.pipeline
                .identity_cache()
                .spawn_sweeper(self.settings.auth.identity_cache_ttl()),
        ]
    }
}

/// Stop every sweep and wait for them to finish
pub async fn shutdown_sweepers(sweepers: Vec<PeriodicSweep>) {
    for sweeper in sweepers {
        sweeper.shutdown().await;
    }
}
