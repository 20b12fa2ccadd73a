// ============================
// crates/backend-lib/src/config.rs
// ============================
//! Configuration management.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::token::MIN_SECRET_LEN;
use crate::auth::BucketPolicy;

/// Prefix of the nested environment variables (`NEURODYX_AUTH__JWT_SECRET`)
const ENV_PREFIX: &str = "NEURODYX_";

/// Auth fields that are always strings; also read from the flat legacy
/// variables (`JWT_SECRET`, `GOOGLE_CLIENT_ID`, `FIREBASE_PROJECT_ID`)
const AUTH_STRING_FIELDS: [&str; 3] = ["jwt_secret", "google_client_id", "firebase_project_id"];

/// Upper bound for the upstream timeout
const MAX_UPSTREAM_TIMEOUT_SECS: u64 = 30;

/// Startup-fatal configuration problems
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("JWT secret is not set")]
    MissingSecret,

    #[error("JWT secret is too short: {len} bytes, minimum {MIN_SECRET_LEN} required")]
    SecretTooShort { len: usize },

    #[error("Google client id is not set")]
    MissingClientId,

    #[error("Firebase project id is not set")]
    MissingProjectId,

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] figment::Error),
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Directory of the flat-file document store
    pub data_dir: PathBuf,
    /// Log level, or a full `EnvFilter` directive
    pub log_level: String,
    /// Emit logs as JSON lines
    pub log_json: bool,
    /// Credential settings
    pub auth: AuthSettings,
    /// Rate limiter settings
    pub rate_limit: RateLimitSettings,
    /// Question cache settings
    pub cache: CacheSettings,
}

/// Credential lifetimes, secrets and provider identifiers
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// HS256 signing secret, at least 32 bytes
    pub jwt_secret: String,
    /// OAuth client id Google ID tokens must be issued for
    pub google_client_id: String,
    /// Firebase project Firebase ID tokens must be issued for
    pub firebase_project_id: String,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    /// Upper bound on how long a verified external credential is reused
    pub identity_cache_ttl_secs: u64,
    /// Deadline for every identity-provider and store call
    pub upstream_timeout_secs: u64,
}

// Keeps the secret out of debug logs
impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("jwt_secret", &"<redacted>")
            .field("google_client_id", &self.google_client_id)
            .field("firebase_project_id", &self.firebase_project_id)
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .field("identity_cache_ttl_secs", &self.identity_cache_ttl_secs)
            .field("upstream_timeout_secs", &self.upstream_timeout_secs)
            .finish()
    }
}

/// One token bucket configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketSettings {
    pub capacity: u32,
    /// Milliseconds needed to regain one permit
    pub refill_every_ms: u64,
}

impl From<BucketSettings> for BucketPolicy {
    fn from(s: BucketSettings) -> Self {
        BucketPolicy {
            capacity: s.capacity,
            refill_every: Duration::from_millis(s.refill_every_ms),
        }
    }
}

/// Rate limiting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// `/auth`, keyed by client address
    pub auth: BucketSettings,
    /// `/refresh`, keyed by client address
    pub refresh: BucketSettings,
    /// Authenticated API routes, keyed by subject
    pub api: BucketSettings,
    /// How often idle buckets are dropped
    pub sweep_interval_secs: u64,
}

/// Response cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            data_dir: PathBuf::from("data"),
            log_level: "info".to_string(),
            log_json: false,
            auth: AuthSettings::default(),
            rate_limit: RateLimitSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            google_client_id: String::new(),
            firebase_project_id: String::new(),
            access_ttl_secs: 60 * 60 * 24,           // 24 hours
            refresh_ttl_secs: 60 * 60 * 24 * 30,     // 30 days
            identity_cache_ttl_secs: 5 * 60,
            upstream_timeout_secs: 10,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            auth: BucketSettings { capacity: 10, refill_every_ms: 60_000 },
            refresh: BucketSettings { capacity: 10, refill_every_ms: 60_000 },
            // 25 requests per minute, burst of 25
            api: BucketSettings { capacity: 25, refill_every_ms: 2_400 },
            sweep_interval_secs: 10 * 60,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 20 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

impl AuthSettings {
    pub fn access_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.access_ttl_secs as i64)
    }

    pub fn refresh_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_ttl_secs as i64)
    }

    pub fn identity_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_cache_ttl_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

impl Settings {
    /// Load from `config.toml` in the working directory plus the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config.toml")
    }

    /// Load from the given TOML file (optional) plus the environment.
    ///
    /// Environment variables take precedence over the file. The string-valued
    /// auth fields bypass `Env` value parsing so an all-digit secret stays a
    /// string.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .filter(|key| !is_auth_string_key(key.as_str()))
                    .split("__"),
            );

        for field in AUTH_STRING_FIELDS {
            let legacy = field.to_ascii_uppercase();
            let nested = format!("{ENV_PREFIX}AUTH__{legacy}");
            // Later merges win, so the prefixed form beats the legacy one
            for var in [legacy, nested] {
                if let Ok(value) = std::env::var(&var) {
                    figment = figment.merge(Serialized::default(&format!("auth.{field}"), value));
                }
            }
        }

        Ok(figment.extract()?)
    }

    /// Check every invariant the process relies on. Any failure is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let secret_len = self.auth.jwt_secret.len();
        if secret_len == 0 {
            return Err(ConfigError::MissingSecret);
        }
        if secret_len < MIN_SECRET_LEN {
            return Err(ConfigError::SecretTooShort { len: secret_len });
        }
        if self.auth.google_client_id.trim().is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        if self.auth.firebase_project_id.trim().is_empty() {
            return Err(ConfigError::MissingProjectId);
        }

        if self.auth.access_ttl_secs == 0 || self.auth.refresh_ttl_secs == 0 {
            return Err(ConfigError::Invalid("credential lifetimes must be non-zero".into()));
        }
        if self.auth.access_ttl_secs >= self.auth.refresh_ttl_secs {
            return Err(ConfigError::Invalid(
                "access_ttl_secs must be shorter than refresh_ttl_secs".into(),
            ));
        }
        if self.auth.identity_cache_ttl_secs == 0 {
            return Err(ConfigError::Invalid("identity_cache_ttl_secs must be non-zero".into()));
        }
        if !(1..=MAX_UPSTREAM_TIMEOUT_SECS).contains(&self.auth.upstream_timeout_secs) {
            return Err(ConfigError::Invalid(format!(
                "upstream_timeout_secs must be between 1 and {MAX_UPSTREAM_TIMEOUT_SECS}"
            )));
        }

        for (name, bucket) in [
            ("auth", self.rate_limit.auth),
            ("refresh", self.rate_limit.refresh),
            ("api", self.rate_limit.api),
        ] {
            if bucket.capacity == 0 || bucket.refill_every_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate_limit.{name} capacity and refill_every_ms must be non-zero"
                )));
            }
        }
        if self.rate_limit.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("rate_limit.sweep_interval_secs must be non-zero".into()));
        }

        if self.cache.ttl_secs == 0 || self.cache.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("cache ttl and sweep interval must be non-zero".into()));
        }
        if self.cache.sweep_interval_secs > self.cache.ttl_secs {
            return Err(ConfigError::Invalid(
                "cache.sweep_interval_secs must not exceed cache.ttl_secs".into(),
            ));
        }

        Ok(())
    }
}

fn is_auth_string_key(key: &str) -> bool {
    AUTH_STRING_FIELDS
        .iter()
        .any(|field| key.eq_ignore_ascii_case(&format!("auth__{field}")))
}
