//! Usage-tracking, time-expiring cache for shared client handles.
//!
//! Every entry is either *active* (checked out at least once, usage ≥ 1) or
//! *idle* (usage 0, waiting out its idle duration). An entry is torn down
//! only from the idle index, only once its idle duration has fully elapsed,
//! and the teardown handler runs exactly once per entry.
//!
//! The cache is not synchronized. Callers wrap the whole
//! checkout/store/release protocol in one mutex, see
//! [`crate::connection::ClientPool`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Protocol violations. Both indicate a locking bug in the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// `store` was called while an entry for the key already exists.
    #[error("entry already cached for key {key}")]
    AlreadyCached { key: String },

    /// `release` was called without an outstanding checkout.
    #[error("release without checkout for key {key}")]
    NotCheckedOut { key: String },
}

/// Cache statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
}

struct ActiveEntry<V> {
    value: V,
    usage: u32,
}

struct IdleEntry<V> {
    value: V,
    idle_since: Instant,
}

type ExpiryHandler<K, V> = Box<dyn FnMut(&K, V) + Send>;

/// Usage-tracking cache.
pub struct ConnectionCache<K, V> {
    idle_duration: Duration,
    active: HashMap<K, ActiveEntry<V>>,
    idle: HashMap<K, IdleEntry<V>>,
    on_expire: ExpiryHandler<K, V>,
    stats: CacheStats,
}

impl<K, V> ConnectionCache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    /// Create a cache whose idle entries expire after `idle_duration`.
    ///
    /// `on_expire` receives ownership of each expired value.
    pub fn new(idle_duration: Duration, on_expire: impl FnMut(&K, V) + Send + 'static) -> Self {
        Self {
            idle_duration,
            active: HashMap::new(),
            idle: HashMap::new(),
            on_expire: Box::new(on_expire),
            stats: CacheStats::default(),
        }
    }

    /// Check out the value for `key`, bumping its usage.
    ///
    /// An idle entry is promoted back to active with usage 1.
    pub fn checkout(&mut self, key: &K) -> Option<V> {
        self.purge_expired();

        if let Some(entry) = self.active.get_mut(key) {
            entry.usage += 1;
            self.stats.hits += 1;
            return Some(entry.value.clone());
        }

        if let Some(idle) = self.idle.remove(key) {
            let value = idle.value.clone();
            self.active.insert(
                key.clone(),
                ActiveEntry {
                    value: idle.value,
                    usage: 1,
                },
            );
            self.stats.hits += 1;
            debug!(key = ?key, "Promoted idle cache entry");
            return Some(value);
        }

        self.stats.misses += 1;
        None
    }

    /// Store a freshly created value as active with usage 1.
    pub fn store(&mut self, key: K, value: V) -> Result<(), CacheError> {
        self.purge_expired();

        if self.active.contains_key(&key) || self.idle.contains_key(&key) {
            return Err(CacheError::AlreadyCached {
                key: format!("{key:?}"),
            });
        }
        self.active.insert(key, ActiveEntry { value, usage: 1 });
        Ok(())
    }

    /// Release one checkout of `key`.
    ///
    /// When usage reaches zero the entry moves to the idle index and its idle
    /// timer starts.
    pub fn release(&mut self, key: &K) -> Result<(), CacheError> {
        let Some(entry) = self.active.get_mut(key) else {
            return Err(CacheError::NotCheckedOut {
                key: format!("{key:?}"),
            });
        };

        entry.usage -= 1;
        if entry.usage == 0 {
            if let Some(entry) = self.active.remove(key) {
                self.idle.insert(
                    key.clone(),
                    IdleEntry {
                        value: entry.value,
                        idle_since: Instant::now(),
                    },
                );
                debug!(key = ?key, "Cache entry is now idle");
            }
        }

        self.purge_expired();
        Ok(())
    }

    /// Tear down every idle entry whose idle duration has elapsed.
    ///
    /// Returns the number of entries torn down.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<K> = self
            .idle
            .iter()
            .filter(|(_, e)| now.duration_since(e.idle_since) >= self.idle_duration)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = self.idle.remove(key) {
                debug!(key = ?key, "Tearing down expired cache entry");
                (self.on_expire)(key, entry.value);
                self.stats.expirations += 1;
            }
        }
        expired.len()
    }

    /// Current usage of `key`: `Some(0)` if idle, `None` if absent.
    pub fn usage(&self, key: &K) -> Option<u32> {
        if let Some(entry) = self.active.get(key) {
            Some(entry.usage)
        } else if self.idle.contains_key(key) {
            Some(0)
        } else {
            None
        }
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn idle_duration(&self) -> Duration {
        self.idle_duration
    }
}
