// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for Prometheus metric keys
pub const AUTH_SUCCESS: &str = "auth.success";
pub const AUTH_FAILURE: &str = "auth.failure";
pub const REFRESH_ROTATED: &str = "auth.refresh.rotated";
pub const REFRESH_REJECTED: &str = "auth.refresh.rejected";
pub const IDENTITY_CACHE_HIT: &str = "auth.identity_cache.hit";
pub const UPSTREAM_TIMEOUT: &str = "upstream.timeout";
pub const JWKS_FETCHED: &str = "identity.jwks.fetched";
pub const LIMITER_REFUSED: &str = "rate_limit.refused";
pub const LIMITER_SWEPT: &str = "rate_limit.swept";
pub const LIMITER_BUCKETS: &str = "rate_limit.buckets";
pub const CACHE_HIT: &str = "cache.hit";
pub const CACHE_MISS: &str = "cache.miss";
pub const CACHE_SWEPT: &str = "cache.swept";
pub const CACHE_INVALIDATED: &str = "cache.invalidated";
pub const PANIC_CAUGHT: &str = "http.panic";
