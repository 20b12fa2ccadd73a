// ============================
// crates/backend-lib/src/auth/identity.rs
// ============================
//! External identity verification.
//!
//! The pipeline only sees the [`IdentityVerifier`] trait. Production uses
//! [`JwksIdentityVerifier`], which checks provider-issued RS256 ID tokens
//! against the provider's published key set. [`StaticIdentityVerifier`]
//! serves tests and local development.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::{
    decode, decode_header,
    jwk::{Jwk, JwkSet},
    Algorithm, DecodingKey, Validation,
};
use metrics::counter;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::metrics::JWKS_FETCHED;

/// Key set published for Firebase ID tokens
pub const FIREBASE_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";

/// Key set published for Google ID tokens
pub const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";

/// How long a fetched key set is trusted before it is fetched again
const KEY_SET_TTL: Duration = Duration::from_secs(60 * 60);

/// Minimum gap between two fetches triggered by an unknown key id
const REFETCH_COOLDOWN: Duration = Duration::from_secs(60);

/// Verification failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The credential is not acceptable (bad signature, issuer, audience, expiry, ...)
    #[error("external credential rejected: {0}")]
    Rejected(String),

    /// The provider could not be consulted
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Which identity provider issued the external credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityProvider {
    Firebase,
    Google,
}

impl FromStr for IdentityProvider {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firebase" => Ok(IdentityProvider::Firebase),
            "google" => Ok(IdentityProvider::Google),
            other => Err(IdentityError::Rejected(format!("unknown auth type '{other}'"))),
        }
    }
}

impl fmt::Display for IdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityProvider::Firebase => f.write_str("firebase"),
            IdentityProvider::Google => f.write_str("google"),
        }
    }
}

/// Typed view of the claims the backend uses
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityClaims {
    pub email: Option<String>,
    pub name: Option<String>,
    /// Expiry of the external credential itself
    pub expires_at: Option<DateTime<Utc>>,
    /// Every other scalar claim, untouched
    pub extra: BTreeMap<String, Value>,
}

/// Result of a successful verification
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedIdentity {
    /// Stable subject identifier
    pub subject: String,
    pub claims: IdentityClaims,
}

/// Raw ID token payload; decoded in a single fallible step
#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl TryFrom<IdTokenClaims> for VerifiedIdentity {
    type Error = IdentityError;

    fn try_from(raw: IdTokenClaims) -> Result<Self, Self::Error> {
        if raw.sub.trim().is_empty() {
            return Err(IdentityError::Rejected("empty subject".into()));
        }

        let extra = raw
            .extra
            .into_iter()
            .filter(|(_, v)| !v.is_object() && !v.is_array())
            .collect();

        Ok(VerifiedIdentity {
            subject: raw.sub,
            claims: IdentityClaims {
                email: raw.email,
                name: raw.name,
                expires_at: raw.exp.and_then(|exp| DateTime::from_timestamp(exp, 0)),
                extra,
            },
        })
    }
}

/// Validates an external bearer credential
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, raw: &str, provider: IdentityProvider) -> Result<VerifiedIdentity, IdentityError>;
}

/// Issuer, audience and key set location of one provider
#[derive(Debug, Clone)]
struct ProviderConfig {
    issuers: Vec<String>,
    audience: String,
    jwks_url: String,
}

/// Cached key set with its fetch time
struct CachedKeys {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Verifies RS256 ID tokens against the issuing provider's JWKS.
pub struct JwksIdentityVerifier {
    http: reqwest::Client,
    providers: HashMap<IdentityProvider, ProviderConfig>,
    key_sets: RwLock<HashMap<IdentityProvider, CachedKeys>>,
    key_set_ttl: Duration,
}

impl JwksIdentityVerifier {
    /// Create a verifier for the given Firebase project and Google client id
    pub fn new(
        firebase_project_id: &str,
        google_client_id: &str,
        http_timeout: Duration,
    ) -> Result<Self, IdentityError> {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;

        let mut providers = HashMap::new();
        providers.insert(
            IdentityProvider::Firebase,
            ProviderConfig {
                issuers: vec![format!("https://securetoken.google.com/{firebase_project_id}")],
                audience: firebase_project_id.to_string(),
                jwks_url: FIREBASE_JWKS_URL.to_string(),
            },
        );
        providers.insert(
            IdentityProvider::Google,
            ProviderConfig {
                issuers: vec![
                    "accounts.google.com".to_string(),
                    "https://accounts.google.com".to_string(),
                ],
                audience: google_client_id.to_string(),
                jwks_url: GOOGLE_JWKS_URL.to_string(),
            },
        );

        Ok(Self {
            http,
            providers,
            key_sets: RwLock::new(HashMap::new()),
            key_set_ttl: KEY_SET_TTL,
        })
    }

    /// Fetch keys for `provider` from `url` instead of the published location
    pub fn with_jwks_url(mut self, provider: IdentityProvider, url: impl Into<String>) -> Self {
        if let Some(config) = self.providers.get_mut(&provider) {
            config.jwks_url = url.into();
        }
        self
    }

    fn config(&self, provider: IdentityProvider) -> Result<&ProviderConfig, IdentityError> {
        self.providers
            .get(&provider)
            .ok_or_else(|| IdentityError::Unavailable(format!("{provider} is not configured")))
    }

    fn validation(config: &ProviderConfig) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&config.issuers);
        validation.set_audience(&[config.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation
    }

    /// Look up `kid` in the cached key set, refetching when the set is stale
    /// or does not know the key (providers rotate keys). Unknown keys trigger
    /// at most one fetch per provider every [`REFETCH_COOLDOWN`].
    async fn key_for(&self, provider: IdentityProvider, kid: &str) -> Result<Jwk, IdentityError> {
        // Try the cache first
        {
            let key_sets = self.key_sets.read().await;
            if let Some(cached) = key_sets.get(&provider) {
                let age = cached.fetched_at.elapsed();
                if age < self.key_set_ttl {
                    if let Some(jwk) = cached.keys.find(kid) {
                        return Ok(jwk.clone());
                    }
                    if age < REFETCH_COOLDOWN {
                        return Err(IdentityError::Rejected(format!("unknown signing key '{kid}'")));
                    }
                }
            }
        }

        let keys = self.fetch_keys(provider).await?;
        let jwk = keys.find(kid).cloned();

        self.key_sets.write().await.insert(
            provider,
            CachedKeys {
                keys,
                fetched_at: Instant::now(),
            },
        );

        jwk.ok_or_else(|| IdentityError::Rejected(format!("unknown signing key '{kid}'")))
    }

    async fn fetch_keys(&self, provider: IdentityProvider) -> Result<JwkSet, IdentityError> {
        let url = &self.config(provider)?.jwks_url;
        tracing::debug!(%provider, %url, "fetching provider key set");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| IdentityError::Unavailable(format!("failed to fetch key set: {e}")))?;

        let keys = response
            .json::<JwkSet>()
            .await
            .map_err(|e| IdentityError::Unavailable(format!("failed to parse key set: {e}")))?;

        counter!(JWKS_FETCHED, "provider" => provider.to_string()).increment(1);
        Ok(keys)
    }
}

#[async_trait]
impl IdentityVerifier for JwksIdentityVerifier {
    async fn verify(&self, raw: &str, provider: IdentityProvider) -> Result<VerifiedIdentity, IdentityError> {
        let header = decode_header(raw).map_err(|e| IdentityError::Rejected(e.to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(IdentityError::Rejected(format!("unexpected algorithm {:?}", header.alg)));
        }
        let kid = header
            .kid
            .ok_or_else(|| IdentityError::Rejected("missing key id".into()))?;

        let jwk = self.key_for(provider, &kid).await?;
        let key = DecodingKey::from_jwk(&jwk).map_err(|e| IdentityError::Rejected(e.to_string()))?;
        let validation = Self::validation(self.config(provider)?);

        let data = decode::<IdTokenClaims>(raw, &key, &validation)
            .map_err(|e| IdentityError::Rejected(e.to_string()))?;

        data.claims.try_into()
    }
}

/// Verifier backed by a fixed table of credentials.
///
/// Counts calls so tests can observe identity cache hits.
#[derive(Debug, Default)]
pub struct StaticIdentityVerifier {
    known: DashMap<String, (IdentityProvider, VerifiedIdentity)>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    unavailable: bool,
}

impl StaticIdentityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `raw` from `provider` as `identity`
    pub fn with_identity(self, raw: &str, provider: IdentityProvider, identity: VerifiedIdentity) -> Self {
        self.known.insert(raw.to_string(), (provider, identity));
        self
    }

    /// Accept `raw` from `provider` as a bare subject
    pub fn with_subject(self, raw: &str, provider: IdentityProvider, subject: &str) -> Self {
        let identity = VerifiedIdentity {
            subject: subject.to_string(),
            claims: IdentityClaims::default(),
        };
        self.with_identity(raw, provider, identity)
    }

    /// Sleep before answering every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answer every call with `IdentityError::Unavailable`
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Number of `verify` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityVerifier for StaticIdentityVerifier {
    async fn verify(&self, raw: &str, provider: IdentityProvider) -> Result<VerifiedIdentity, IdentityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable {
            return Err(IdentityError::Unavailable("static verifier offline".into()));
        }

        match self.known.get(raw) {
            Some(entry) if entry.0 == provider => Ok(entry.1.clone()),
            Some(_) => Err(IdentityError::Rejected("credential issued by another provider".into())),
            None => Err(IdentityError::Rejected("unknown credential".into())),
        }
    }
}
