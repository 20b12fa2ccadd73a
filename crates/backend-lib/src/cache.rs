// ============================
// crates/backend-lib/src/cache.rs
// ============================
//! Time-bounded response cache.
//!
//! Cache-aside: readers populate on miss, writers evict the affected key
//! before reporting success. Nothing here is a source of truth; clearing the
//! whole cache only costs latency.
//!
//! A miss hands out a [`FillTicket`]. A fill is only stored if no
//! invalidation happened since its ticket was issued, so a reader that
//! loaded data before a write cannot put the old data back afterwards.
use dashmap::DashMap;
use metrics::counter;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

use crate::metrics::{CACHE_HIT, CACHE_MISS, CACHE_SWEPT};
use crate::sweeper::PeriodicSweep;

/// Cached value with its insertion time
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

type EntryMap<K, V> = DashMap<K, CacheEntry<V>>;

/// Permission to store the result of a load that started on a miss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct FillTicket(u64);

/// Result of [`TtlCache::lookup`]
#[derive(Debug)]
pub enum Lookup<V> {
    Hit(V),
    Miss(FillTicket),
}

/// Expiring key/value store with explicit invalidation.
pub struct TtlCache<K, V> {
    name: &'static str,
    entries: Arc<EntryMap<K, V>>,
    // Bumped by every invalidation
    generation: AtomicU64,
    ttl: Duration,
    sweeper: Option<PeriodicSweep>,
}

impl<K: Eq + Hash, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache without a background sweep; stale entries are only
    /// dropped when read.
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            entries: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            ttl,
            sweeper: None,
        }
    }

    /// Create a cache whose stale entries are removed every `sweep_interval`.
    ///
    /// Must be called from within a tokio runtime. The sweep stops when the
    /// cache is dropped or [`TtlCache::shutdown`] is called.
    pub fn with_sweeper(name: &'static str, ttl: Duration, sweep_interval: Duration) -> Self {
        let mut cache = Self::new(name, ttl);
        cache.sweeper = Some(cache.spawn_sweeper(sweep_interval));
        cache
    }

    /// Remove stale entries every `interval` through a handle owned by the
    /// caller. The task ends on its own once the cache is dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> PeriodicSweep {
        let name = self.name;
        let weak: Weak<EntryMap<K, V>> = Arc::downgrade(&self.entries);

        PeriodicSweep::spawn(name, interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(entries) => {
                        Self::remove_stale(name, &entries);
                        true
                    },
                    None => false,
                }
            }
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a fresh value
    pub fn get(&self, key: &K) -> Option<V> {
        match self.lookup(key) {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss(_) => None,
        }
    }

    /// Look up a fresh value; a miss carries the ticket for refilling `key`
    /// through [`TtlCache::put_if_current`]
    pub fn lookup(&self, key: &K) -> Lookup<V> {
        // Taken before the read, so an invalidation racing with the miss
        // voids the ticket
        let ticket = FillTicket(self.generation.load(Ordering::SeqCst));
        let now = Instant::now();

        if let Some(entry) = self.entries.get(key) {
            if entry.is_fresh(now) {
                counter!(CACHE_HIT, "cache" => self.name).increment(1);
                return Lookup::Hit(entry.value.clone());
            }
        }

        // Expired entries are dropped on read, unless a writer replaced
        // the entry in between
        self.entries.remove_if(key, |_, entry| !entry.is_fresh(now));
        counter!(CACHE_MISS, "cache" => self.name).increment(1);
        Lookup::Miss(ticket)
    }

    /// Store a value with the cache's TTL
    pub fn put(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.ttl);
    }

    /// Store a value loaded after a miss, unless an invalidation happened
    /// since `ticket` was issued. Returns whether the value was stored.
    pub fn put_if_current(&self, key: K, ticket: FillTicket, value: V) -> bool {
        // The check runs under the key's shard lock; `invalidate` bumps the
        // generation before taking that lock, so either the check sees the
        // bump or the invalidation removes this entry
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if self.generation.load(Ordering::SeqCst) != ticket.0 {
                    return false;
                }
                occupied.insert(self.entry(value, self.ttl));
            },
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                if self.generation.load(Ordering::SeqCst) != ticket.0 {
                    return false;
                }
                vacant.insert(self.entry(value, self.ttl));
            },
        }
        true
    }

    /// Store a value that expires after `ttl` (capped at the cache's TTL)
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(key, self.entry(value, ttl));
    }

    /// Remove a key; returns whether something was cached. Fills that
    /// started before this call are discarded.
    pub fn invalidate(&self, key: &K) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.remove(key).is_some()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
    }

    /// Number of entries, fresh or not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every stale entry now
    pub fn sweep(&self) -> usize {
        Self::remove_stale(self.name, &self.entries)
    }

    /// Stop the background sweep, if any
    pub async fn shutdown(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.shutdown().await;
        }
    }

    fn entry(&self, value: V, ttl: Duration) -> CacheEntry<V> {
        CacheEntry {
            value,
            stored_at: Instant::now(),
            ttl: ttl.min(self.ttl),
        }
    }

    fn remove_stale(name: &'static str, entries: &EntryMap<K, V>) -> usize {
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now));

        let removed = before.saturating_sub(entries.len());
        if removed > 0 {
            counter!(CACHE_SWEPT, "cache" => name).increment(removed as u64);
            tracing::debug!(cache = name, removed, "swept stale cache entries");
        }
        removed
    }
}
