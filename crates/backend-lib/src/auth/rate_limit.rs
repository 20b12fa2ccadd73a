// ============================
// crates/backend-lib/src/auth/rate_limit.rs
// ============================
//! Per-identity token-bucket rate limiting for authentication traffic.

use dashmap::DashMap;
use metrics::{counter, gauge};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

use crate::metrics::{LIMITER_BUCKETS, LIMITER_REFUSED, LIMITER_SWEPT};
use crate::sweeper::PeriodicSweep;

/// Default bucket capacity
const DEFAULT_CAPACITY: u32 = 10;

/// Default time to regain one permit (1 minute)
const DEFAULT_REFILL_EVERY: Duration = Duration::from_secs(60);

/// Identity a bucket is keyed by.
///
/// The subject wins whenever it is known; the network address is the
/// fallback. Address keys are spoofable behind proxies, subject keys need a
/// verified credential first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    Subject(String),
    Address(IpAddr),
    Unknown,
}

impl RateLimitKey {
    /// Pick the key for a request: subject, then address, then a shared
    /// bucket for requests whose origin cannot be determined.
    pub fn resolve(subject: Option<&str>, addr: Option<IpAddr>) -> Self {
        match (subject, addr) {
            (Some(subject), _) if !subject.is_empty() => RateLimitKey::Subject(subject.to_string()),
            (_, Some(addr)) => RateLimitKey::Address(addr),
            _ => RateLimitKey::Unknown,
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitKey::Subject(s) => write!(f, "subject:{s}"),
            RateLimitKey::Address(a) => write!(f, "addr:{a}"),
            RateLimitKey::Unknown => f.write_str("unknown"),
        }
    }
}

/// Bucket parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketPolicy {
    /// Maximum number of permits a bucket holds
    pub capacity: u32,
    /// Time needed to regain a single permit
    pub refill_every: Duration,
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_every: DEFAULT_REFILL_EVERY,
        }
    }
}

type BucketMap = DashMap<RateLimitKey, Bucket>;

/// Entry in the limiter map
#[derive(Debug, Clone)]
struct Bucket {
    /// Permits currently available, fractional between refills
    tokens: f64,
    /// Last time `tokens` was brought up to date
    last_refill: Instant,
}

impl Bucket {
    fn full(policy: &BucketPolicy, now: Instant) -> Self {
        Self {
            tokens: f64::from(policy.capacity),
            last_refill: now,
        }
    }

    fn refill(&mut self, policy: &BucketPolicy, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let gained = elapsed.as_secs_f64() / policy.refill_every.as_secs_f64();
        self.tokens = (self.tokens + gained).min(f64::from(policy.capacity));
        self.last_refill = now;
    }
}

/// Token-bucket limiter keyed by [`RateLimitKey`].
///
/// Buckets are created lazily. The map is sharded, so contention is per key;
/// inserting an unseen key takes the shard's write lock, which makes creation
/// first-writer-wins.
#[derive(Debug, Clone)]
pub struct KeyedRateLimiter {
    name: &'static str,
    buckets: Arc<BucketMap>,
    policy: BucketPolicy,
}

impl Default for KeyedRateLimiter {
    fn default() -> Self {
        Self::new("default", BucketPolicy::default())
    }
}

impl KeyedRateLimiter {
    /// Create a new limiter; `name` labels its log lines and metrics
    pub fn new(name: &'static str, policy: BucketPolicy) -> Self {
        Self {
            name,
            buckets: Arc::new(DashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> BucketPolicy {
        self.policy
    }

    /// Consume one permit for `key`. Never errors, only accepts or refuses.
    pub fn allow(&self, key: &RateLimitKey) -> bool {
        let now = Instant::now();
        let policy = &self.policy;

        // Get or create the bucket; the entry guard holds the shard lock
        let mut bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::full(policy, now));

        bucket.refill(policy, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            drop(bucket);
            counter!(LIMITER_REFUSED, "limiter" => self.name).increment(1);
            tracing::debug!(limiter = self.name, %key, "rate limit exceeded");
            false
        }
    }

    /// Number of buckets currently tracked
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop buckets that have refilled to capacity.
    ///
    /// A full bucket behaves exactly like one that was never created, so
    /// removing it changes no future decision. Returns the number removed.
    pub fn sweep(&self) -> usize {
        sweep_buckets(self.name, &self.policy, &self.buckets)
    }

    /// Run [`KeyedRateLimiter::sweep`] every `interval` until the returned
    /// handle is shut down or every clone of this limiter is dropped
    pub fn spawn_sweeper(&self, interval: Duration) -> PeriodicSweep {
        let name = self.name;
        let policy = self.policy;
        let weak: Weak<BucketMap> = Arc::downgrade(&self.buckets);

        PeriodicSweep::spawn(name, interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(buckets) => {
                        sweep_buckets(name, &policy, &buckets);
                        true
                    },
                    None => false,
                }
            }
        })
    }
}

fn sweep_buckets(name: &'static str, policy: &BucketPolicy, buckets: &BucketMap) -> usize {
    let now = Instant::now();
    let before = buckets.len();

    buckets.retain(|_, bucket| {
        bucket.refill(policy, now);
        bucket.tokens < f64::from(policy.capacity)
    });

    let removed = before.saturating_sub(buckets.len());
    if removed > 0 {
        counter!(LIMITER_SWEPT, "limiter" => name).increment(removed as u64);
        tracing::debug!(limiter = name, removed, "swept idle rate limit buckets");
    }
    gauge!(LIMITER_BUCKETS, "limiter" => name).set(buckets.len() as f64);
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn policy(capacity: u32, refill_secs: u64) -> BucketPolicy {
        BucketPolicy {
            capacity,
            refill_every: Duration::from_secs(refill_secs),
        }
    }

    fn ip(last: u8) -> RateLimitKey {
        RateLimitKey::Address(IpAddr::V4(Ipv4Addr::new(127, 0, 0, last)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_then_refill() {
        let limiter = KeyedRateLimiter::new("test", policy(10, 6));
        let key = RateLimitKey::Subject("ip-1".into());

        for _ in 0..10 {
            assert!(limiter.allow(&key));
        }
        assert!(!limiter.allow(&key));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.allow(&key));
        assert!(!limiter.allow(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let limiter = KeyedRateLimiter::new("test", policy(3, 1));
        let key = ip(1);

        assert!(limiter.allow(&key));
        tokio::time::advance(Duration::from_secs(3600)).await;

        for _ in 0..3 {
            assert!(limiter.allow(&key));
        }
        assert!(!limiter.allow(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_tracked_separately() {
        let limiter = KeyedRateLimiter::new("test", policy(1, 60));

        assert!(limiter.allow(&ip(1)));
        assert!(!limiter.allow(&ip(1)));
        assert!(limiter.allow(&ip(2)));
        assert_eq!(limiter.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_creates_one_bucket() {
        let limiter = KeyedRateLimiter::new("test", policy(10, 3600));
        let key = RateLimitKey::Subject("shared".into());

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = limiter.clone();
                let key = key.clone();
                tokio::spawn(async move { limiter.allow(&key) })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }

        assert_eq!(limiter.len(), 1);
        assert_eq!(accepted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_only_full_buckets() {
        let limiter = KeyedRateLimiter::new("test", policy(2, 10));

        assert!(limiter.allow(&ip(1)));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.allow(&ip(2)));

        // ip(1) has refilled, ip(2) is still one permit short
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.len(), 1);

        // ip(2) still remembers its spent permit
        assert!(limiter.allow(&ip(2)));
        assert!(!limiter.allow(&ip(2)));
    }

    #[test]
    fn test_key_resolution_prefers_subject() {
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        assert_eq!(
            RateLimitKey::resolve(Some("u-1"), Some(addr)),
            RateLimitKey::Subject("u-1".into())
        );
        assert_eq!(RateLimitKey::resolve(None, Some(addr)), RateLimitKey::Address(addr));
        assert_eq!(RateLimitKey::resolve(Some(""), Some(addr)), RateLimitKey::Address(addr));
        assert_eq!(RateLimitKey::resolve(None, None), RateLimitKey::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let limiter = KeyedRateLimiter::new("test", policy(1, 10));
        let sweeper = limiter.spawn_sweeper(Duration::from_secs(60));

        assert!(limiter.allow(&ip(1)));
        assert_eq!(limiter.len(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(limiter.is_empty());

        sweeper.shutdown().await;
    }
}
