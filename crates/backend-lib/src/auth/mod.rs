// ============================
// crates/backend-lib/src/auth/mod.rs
// ============================
//! Authentication module.

pub mod identity;
pub mod pipeline;
pub mod rate_limit;
pub mod token;

pub use identity::{
    IdentityClaims, IdentityError, IdentityProvider, IdentityVerifier, JwksIdentityVerifier,
    StaticIdentityVerifier, VerifiedIdentity,
};
pub use pipeline::{user_path, AuthPipeline, PipelinePolicy, RefreshRecord};
pub use rate_limit::{BucketPolicy, KeyedRateLimiter, RateLimitKey};
pub use token::{Claims, IssuedToken, TokenAuthority, TokenError, TokenKind, MIN_SECRET_LEN};
