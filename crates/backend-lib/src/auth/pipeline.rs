// ============================
// crates/backend-lib/src/auth/pipeline.rs
// ============================
//! Login and refresh-rotation flows.
//!
//! A login moves through
//! `received -> rate-checked -> identity-verified -> credentials-issued ->
//! refresh-state-persisted -> responded`; any failure ends the request in an
//! [`AppError`] and no credential leaves the pipeline unless its refresh
//! state was stored.
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use neurodyx_common::{AuthRequest, AuthResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::auth::identity::{IdentityProvider, IdentityVerifier, VerifiedIdentity};
use crate::auth::rate_limit::{KeyedRateLimiter, RateLimitKey};
use crate::auth::token::{IssuedToken, TokenAuthority, TokenKind};
use crate::cache::TtlCache;
use crate::config::Settings;
use crate::error::AppError;
use crate::metrics::{
    AUTH_FAILURE, AUTH_SUCCESS, IDENTITY_CACHE_HIT, REFRESH_REJECTED, REFRESH_ROTATED,
    UPSTREAM_TIMEOUT,
};
use crate::storage::{Document, DocumentStore, TxDecision, TxFn};
use crate::validation::{validate_credential, ValidationError};

/// Collection holding one document per subject
pub const USERS_COLLECTION: &str = "users";

/// Path of a subject's user record
pub fn user_path(subject: &str) -> String {
    format!("{USERS_COLLECTION}/{subject}")
}

/// Refresh state stored on the user record.
///
/// One per subject; every login or rotation replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRecord {
    #[serde(rename = "refreshToken")]
    pub token: String,
    #[serde(rename = "refreshTokenCreatedAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "refreshTokenExpiresAt")]
    pub expires_at: DateTime<Utc>,
}

impl RefreshRecord {
    /// Extract the record from a user document; `None` if absent or unreadable
    pub fn from_document(doc: &Document) -> Option<Self> {
        serde_json::from_value(Value::Object(doc.clone())).ok()
    }

    /// The record as fields to merge into the user document
    pub fn to_fields(&self) -> Document {
        match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => fields,
            _ => Document::new(),
        }
    }

    /// Whether `presented` is the stored token and the record is still valid
    pub fn accepts(&self, presented: &str, now: DateTime<Utc>) -> bool {
        self.token == presented && now < self.expires_at
    }
}

/// Lifetimes and deadlines used by the pipeline
#[derive(Debug, Clone, Copy)]
pub struct PipelinePolicy {
    pub access_ttl: chrono::Duration,
    pub refresh_ttl: chrono::Duration,
    pub identity_cache_ttl: Duration,
    pub upstream_timeout: Duration,
}

impl From<&Settings> for PipelinePolicy {
    fn from(settings: &Settings) -> Self {
        Self {
            access_ttl: settings.auth.access_ttl(),
            refresh_ttl: settings.auth.refresh_ttl(),
            identity_cache_ttl: settings.auth.identity_cache_ttl(),
            upstream_timeout: settings.auth.upstream_timeout(),
        }
    }
}

/// Identity cache key: provider plus raw external credential
pub type IdentityCacheKey = (IdentityProvider, String);

/// Orchestrates identity verification, credential issuance and refresh state.
pub struct AuthPipeline {
    authority: Arc<TokenAuthority>,
    verifier: Arc<dyn IdentityVerifier>,
    store: Arc<dyn DocumentStore>,
    identity_cache: TtlCache<IdentityCacheKey, VerifiedIdentity>,
    auth_limiter: KeyedRateLimiter,
    refresh_limiter: KeyedRateLimiter,
    policy: PipelinePolicy,
}

impl AuthPipeline {
    pub fn new(
        authority: Arc<TokenAuthority>,
        verifier: Arc<dyn IdentityVerifier>,
        store: Arc<dyn DocumentStore>,
        settings: &Settings,
    ) -> Self {
        let policy = PipelinePolicy::from(settings);
        Self {
            authority,
            verifier,
            store,
            identity_cache: TtlCache::new("identity", policy.identity_cache_ttl),
            auth_limiter: KeyedRateLimiter::new("auth", settings.rate_limit.auth.into()),
            refresh_limiter: KeyedRateLimiter::new("refresh", settings.rate_limit.refresh.into()),
            policy,
        }
    }

    pub fn identity_cache(&self) -> &TtlCache<IdentityCacheKey, VerifiedIdentity> {
        &self.identity_cache
    }

    pub fn auth_limiter(&self) -> &KeyedRateLimiter {
        &self.auth_limiter
    }

    pub fn refresh_limiter(&self) -> &KeyedRateLimiter {
        &self.refresh_limiter
    }

    /// Exchange an external credential for an access/refresh pair.
    #[instrument(skip(self, request), fields(auth_type = %request.auth_type))]
    pub async fn authenticate(
        &self,
        request: &AuthRequest,
        client: Option<IpAddr>,
    ) -> Result<AuthResponse, AppError> {
        let result = self.authenticate_inner(request, client).await;
        match &result {
            Ok(_) => counter!(AUTH_SUCCESS, "flow" => "login").increment(1),
            Err(e) => counter!(AUTH_FAILURE, "flow" => "login", "code" => e.error_code()).increment(1),
        }
        result
    }

    async fn authenticate_inner(
        &self,
        request: &AuthRequest,
        client: Option<IpAddr>,
    ) -> Result<AuthResponse, AppError> {
        // Rate check, keyed by address: nothing is verified yet
        let key = RateLimitKey::resolve(None, client);
        if !self.auth_limiter.allow(&key) {
            return Err(AppError::RateLimited);
        }

        validate_credential(&request.token)?;
        let provider: IdentityProvider = request
            .auth_type
            .parse()
            .map_err(|_| ValidationError::InvalidAuthType(request.auth_type.clone()))?;

        let identity = self.verify_identity(&request.token, provider).await?;
        let (access, refresh) = self.issue_pair(&identity.subject)?;
        self.persist_login(&identity, &refresh).await?;

        tracing::info!(subject = %identity.subject, %provider, "user authenticated");
        Ok(AuthResponse {
            token: access.token,
            refresh_token: refresh.token,
        })
    }

    /// Rotate a refresh credential into a new access/refresh pair.
    ///
    /// Every rejection reason (forged, expired, superseded) surfaces as the
    /// same `InvalidCredential`.
    #[instrument(skip_all)]
    pub async fn refresh(
        &self,
        refresh_token: &str,
        client: Option<IpAddr>,
    ) -> Result<AuthResponse, AppError> {
        let result = self.refresh_inner(refresh_token, client).await;
        match &result {
            Ok(_) => counter!(AUTH_SUCCESS, "flow" => "refresh").increment(1),
            Err(e) => counter!(AUTH_FAILURE, "flow" => "refresh", "code" => e.error_code()).increment(1),
        }
        result
    }

    async fn refresh_inner(
        &self,
        refresh_token: &str,
        client: Option<IpAddr>,
    ) -> Result<AuthResponse, AppError> {
        // The subject is unknown until the token is verified
        let key = RateLimitKey::resolve(None, client);
        if !self.refresh_limiter.allow(&key) {
            return Err(AppError::RateLimited);
        }

        validate_credential(refresh_token).map_err(|_| AppError::InvalidCredential)?;
        let claims = self.authority.verify_kind(refresh_token, TokenKind::Refresh)?;
        let (access, refresh) = self.issue_pair(&claims.sub)?;

        // Compare-and-swap on the stored record
        let now = self.store.server_time();
        let presented = refresh_token.to_string();
        let fields = RefreshRecord {
            token: refresh.token.clone(),
            created_at: now,
            expires_at: refresh.expires_at,
        }
        .to_fields();

        let body: TxFn = Box::new(move |current| {
            match current.and_then(RefreshRecord::from_document) {
                Some(stored) if stored.accepts(&presented, now) => TxDecision::Commit(fields),
                _ => TxDecision::Abort,
            }
        });

        if !self.persist(user_path(&claims.sub), body).await? {
            counter!(REFRESH_REJECTED).increment(1);
            tracing::debug!(subject = %claims.sub, "refresh token does not match stored record");
            return Err(AppError::InvalidCredential);
        }

        counter!(REFRESH_ROTATED).increment(1);
        tracing::info!(subject = %claims.sub, "refresh token rotated");
        Ok(AuthResponse {
            token: access.token,
            refresh_token: refresh.token,
        })
    }

    /// Cached-or-fresh verification of an external credential
    async fn verify_identity(
        &self,
        raw: &str,
        provider: IdentityProvider,
    ) -> Result<VerifiedIdentity, AppError> {
        let cache_key = (provider, raw.to_string());
        if let Some(identity) = self.identity_cache.get(&cache_key) {
            counter!(IDENTITY_CACHE_HIT).increment(1);
            return Ok(identity);
        }

        let identity = self
            .with_deadline("identity verifier", self.verifier.verify(raw, provider))
            .await??;

        // Never outlive the external credential itself
        let ttl = match identity.claims.expires_at {
            Some(expires_at) => (expires_at - Utc::now()).to_std().ok(),
            None => Some(self.policy.identity_cache_ttl),
        };
        if let Some(ttl) = ttl.filter(|ttl| !ttl.is_zero()) {
            self.identity_cache.insert_with_ttl(cache_key, identity.clone(), ttl);
        }

        Ok(identity)
    }

    fn issue_pair(&self, subject: &str) -> Result<(IssuedToken, IssuedToken), AppError> {
        let access = self.authority.issue(subject, TokenKind::Access, self.policy.access_ttl)?;
        let refresh = self.authority.issue(subject, TokenKind::Refresh, self.policy.refresh_ttl)?;
        Ok((access, refresh))
    }

    /// Merge the new refresh record and profile fields into the user record
    async fn persist_login(
        &self,
        identity: &VerifiedIdentity,
        refresh: &IssuedToken,
    ) -> Result<(), AppError> {
        let now = self.store.server_time();
        let mut fields = RefreshRecord {
            token: refresh.token.clone(),
            created_at: now,
            expires_at: refresh.expires_at,
        }
        .to_fields();

        if let Some(email) = &identity.claims.email {
            fields.insert("email".into(), Value::String(email.clone()));
        }
        if let Some(name) = &identity.claims.name {
            fields.insert("username".into(), Value::String(name.clone()));
        }

        let body: TxFn = Box::new(move |current| {
            if current.is_none() {
                fields.insert("createdAt".into(), Value::String(now.to_rfc3339()));
            }
            TxDecision::Commit(fields)
        });

        self.persist(user_path(&identity.subject), body).await?;
        Ok(())
    }

    /// Run a store transaction on its own task.
    ///
    /// The write is not tied to the request future: if the client goes away
    /// or the deadline passes, the write still runs to completion.
    async fn persist(&self, path: String, body: TxFn) -> Result<bool, AppError> {
        let store = Arc::clone(&self.store);
        let write = tokio::spawn(async move { store.transaction(&path, body).await });

        match self.with_deadline("document store", write).await? {
            Ok(Ok(committed)) => Ok(committed),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "failed to persist refresh state");
                Err(AppError::PersistenceFailure(e.to_string()))
            },
            Err(join) => Err(AppError::Internal(format!("persistence task failed: {join}"))),
        }
    }

    async fn with_deadline<T>(
        &self,
        upstream: &'static str,
        fut: impl Future<Output = T>,
    ) -> Result<T, AppError> {
        tokio::time::timeout(self.policy.upstream_timeout, fut)
            .await
            .map_err(|_| {
                counter!(UPSTREAM_TIMEOUT, "upstream" => upstream).increment(1);
                tracing::warn!(upstream, "upstream call timed out");
                AppError::UpstreamTimeout(upstream)
            })
    }
}
