//! Metadata caches.
//!
//! [`HeaderCache`] memoizes declared byte placements per article with a
//! sliding TTL: every hit pushes the expiry out, so hot entries stay as
//! long as they are used and cold ones age out. Capacity is bounded with
//! LRU eviction. Absence is never cached here; a not-found answer today
//! says nothing about tomorrow's retention on another server.
//!
//! [`MissingCache`] is the one deliberate exception, for the integrity
//! checker: a known-missing verdict is remembered for a short fixed window
//! (no sliding) so repeated scans do not hammer servers about articles that
//! just failed. The window is short because absence can heal when a server
//! comes back.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use newsreel_core::{DeclaredRange, SegmentId};

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub capacity: usize,
    /// Sliding window; refreshed on every hit.
    pub ttl: Duration,
    pub missing_capacity: usize,
    /// Fixed window; never refreshed.
    pub missing_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: 4096,
            ttl: Duration::from_secs(3 * 60 * 60),
            missing_capacity: 1024,
            missing_ttl: Duration::from_secs(300),
        }
    }
}

/// Hit/miss counters, cheap enough to keep always-on.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

pub struct HeaderCache {
    entries: Mutex<LruCache<SegmentId, Entry<DeclaredRange>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HeaderCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        HeaderCache {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, id: &SegmentId) -> Option<DeclaredRange> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if let Some(entry) = entries.get_mut(id) {
            if entry.expires_at > now {
                entry.expires_at = now + self.ttl;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value);
            }
            entries.pop(id);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn insert(&self, id: SegmentId, range: DeclaredRange) {
        let entry = Entry {
            value: range,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.lock().await.put(id, entry);
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.lock().await.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

pub struct MissingCache {
    entries: Mutex<LruCache<SegmentId, Instant>>,
    ttl: Duration,
}

impl MissingCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        MissingCache {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub async fn note(&self, id: &SegmentId) {
        let expires_at = Instant::now() + self.ttl;
        self.entries.lock().await.put(id.clone(), expires_at);
    }

    pub async fn is_known_missing(&self, id: &SegmentId) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(id) {
            Some(expires_at) if *expires_at > Instant::now() => true,
            Some(_) => {
                entries.pop(id);
                false
            }
            None => false,
        }
    }
}
