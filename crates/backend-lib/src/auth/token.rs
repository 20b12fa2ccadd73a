// ============================
// crates/backend-lib/src/auth/token.rs
// ============================
//! Issuance and verification of internally signed credentials.
//!
//! Credentials are HS256 JWTs carrying the subject, the expiry, the kind of
//! credential and a unique id. The signing secret never leaves this module.
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;

/// Minimum length of the signing secret in bytes
pub const MIN_SECRET_LEN: usize = 32;

/// Errors produced while issuing or verifying a credential
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("signature or signing method mismatch")]
    InvalidSignature,

    #[error("credential expired")]
    Expired,

    #[error("malformed credential: {0}")]
    Malformed(String),

    #[error("failed to sign credential: {0}")]
    Signing(String),
}

/// Which of the two credential kinds a token is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claims carried by every credential.
///
/// Decoded in one step; anything that does not fit this shape is `Malformed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Stable subject identifier from the identity provider
    pub sub: String,
    /// Expiry, seconds since the Unix epoch
    pub exp: i64,
    /// Issue time, seconds since the Unix epoch
    pub iat: i64,
    /// Unique id, so two credentials minted in the same second still differ
    pub jti: String,
    /// Access or refresh
    pub kind: TokenKind,
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// A freshly minted credential together with its expiry
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Mints and verifies credentials. Pure, no I/O.
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority").finish_non_exhaustive()
    }
}

impl TokenAuthority {
    /** Create an authority from the shared signing secret.
    # Errors
    `ConfigError::MissingSecret` if the secret is empty,
    `ConfigError::SecretTooShort` if it is shorter than [`MIN_SECRET_LEN`] bytes. */
    pub fn new(secret: &[u8]) -> Result<Self, ConfigError> {
        if secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::SecretTooShort { len: secret.len() });
        }

        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the caller's clock in `verify_at`.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.required_spec_claims = ["exp", "sub"].iter().map(|c| c.to_string()).collect();

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        })
    }

    /// Issue a credential for `subject` valid for `ttl` from now
    pub fn issue(&self, subject: &str, kind: TokenKind, ttl: Duration) -> Result<IssuedToken, TokenError> {
        self.issue_at(subject, kind, ttl, Utc::now())
    }

    /// Issue a credential as if the current time were `now`
    pub fn issue_at(
        &self,
        subject: &str,
        kind: TokenKind,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        let expires_at = now + ttl;
        let claims = Claims {
            sub: subject.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
            kind,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))?;

        Ok(IssuedToken { token, expires_at })
    }

    /// Verify a credential against the current time
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify_at(token, Utc::now())
    }

    /// Verify a credential as if the current time were `now`
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    TokenError::InvalidSignature
                },
                other => TokenError::Malformed(format!("{other:?}")),
            }
        })?;

        if now.timestamp() > data.claims.exp {
            return Err(TokenError::Expired);
        }

        Ok(data.claims)
    }

    /// Verify a credential and require it to be of `kind`
    pub fn verify_kind(&self, token: &str, kind: TokenKind) -> Result<Claims, TokenError> {
        let claims = self.verify(token)?;
        if claims.kind != kind {
            return Err(TokenError::Malformed(format!("expected {kind:?} credential")));
        }
        Ok(claims)
    }
}
