//! High-Performance In-Memory Cache Module
//!
//! Thread-safe TTL cache shared by every worker, with single-flight
//! request coalescing: concurrent `get_or_fetch` calls for the same key
//! run exactly one upstream fetch and all receive its outcome.
//!
//! Values are stored as JSON text. `U256` amounts serialize as hex
//! strings, so raw balances above 2^53 survive the round trip intact.
//!
//! Features:
//! - Per-entry TTL
//! - Key normalization (lowercase)
//! - HIT/MISS/coalesced counters
//! - Failed fetches are never cached; every waiter gets the error

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

use crate::models::errors::{AppError, AppResult, ErrorCode};

/// Outcome broadcast by the leader of an in-flight fetch
type SharedOutcome = Option<Result<String, (ErrorCode, String)>>;

/// Cache entry with timestamp for TTL validation
#[derive(Clone, Debug)]
struct CacheEntry {
    /// Encoded value
    payload: String,
    /// Creation time
    created_at: Instant,
    /// Time to live
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }

    fn remaining_ttl(&self) -> Duration {
        self.ttl.saturating_sub(self.created_at.elapsed())
    }
}

/// Shared TTL cache with single-flight fetches
#[derive(Clone, Default)]
pub struct SweepCache {
    inner: Arc<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    store: DashMap<String, CacheEntry>,
    in_flight: DashMap<String, watch::Sender<SharedOutcome>>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    fetches: AtomicU64,
}

/// Removes the in-flight marker if the leader is dropped mid-fetch, which
/// wakes waiters with an error instead of leaving them parked forever.
struct InFlightGuard<'a> {
    cache: &'a CacheInner,
    key: &'a str,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.in_flight.remove(self.key);
        }
    }
}

impl SweepCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn normalize_key(key: &str) -> String {
        key.to_lowercase()
    }

    /// Encode a value for storage
    pub fn encode<T: Serialize>(value: &T) -> AppResult<String> {
        Ok(serde_json::to_string(value)?)
    }

    /// Decode a stored value
    pub fn decode<T: DeserializeOwned>(payload: &str) -> AppResult<T> {
        Ok(serde_json::from_str(payload)?)
    }

    fn lookup(&self, key: &str) -> Option<String> {
        let entry = self.inner.store.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.inner.store.remove(key);
            debug!("📭 CACHE MISS (expired): {}", key);
            return None;
        }
        debug!("✅ CACHE HIT: {} (TTL: {}ms remaining)", key, entry.remaining_ttl().as_millis());
        Some(entry.payload.clone())
    }

    /// Get a value; `None` on miss, expiry or a value of another shape
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let key = Self::normalize_key(key);
        match self.lookup(&key).and_then(|p| Self::decode(&p).ok()) {
            Some(value) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value with the given TTL
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> AppResult<()> {
        let payload = Self::encode(value)?;
        self.insert_encoded(Self::normalize_key(key), payload, ttl);
        Ok(())
    }

    fn insert_encoded(&self, key: String, payload: String, ttl: Duration) {
        debug!("💾 CACHE SET: {} (TTL: {}ms)", key, ttl.as_millis());
        self.inner.store.insert(
            key,
            CacheEntry {
                payload,
                created_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Return the cached value or run `fetcher` exactly once across all
    /// concurrent callers of the same key.
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, ttl: Duration, fetcher: F) -> AppResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let key = Self::normalize_key(key);

        if let Some(value) = self.lookup(&key).and_then(|p| Self::decode::<T>(&p).ok()) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        let waiter = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(occupied) => Some(occupied.get().subscribe()),
            Entry::Vacant(vacant) => {
                let (tx, _rx) = watch::channel(None);
                vacant.insert(tx);
                None
            }
        };

        if let Some(mut rx) = waiter {
            self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!("⏳ CACHE COALESCE: {}", key);
            let outcome = rx
                .wait_for(|outcome| outcome.is_some())
                .await
                .map_err(|_| AppError::internal(format!("in-flight fetch for {} was abandoned", key)))?
                .clone();
            return match outcome {
                Some(Ok(payload)) => Self::decode(&payload),
                Some(Err((code, message))) => Err(AppError::new(code, message)),
                None => Err(AppError::internal("in-flight fetch finished without outcome")),
            };
        }

        let mut guard = InFlightGuard {
            cache: &self.inner,
            key: &key,
            armed: true,
        };
        self.inner.misses.fetch_add(1, Ordering::Relaxed);

        // A previous leader may have stored the value between our lookup
        // and taking the in-flight slot.
        let result = match self.lookup(&key).and_then(|p| Self::decode::<T>(&p).ok()) {
            Some(value) => Ok(value),
            None => {
                self.inner.fetches.fetch_add(1, Ordering::Relaxed);
                fetcher().await
            }
        };

        let shared = match &result {
            Ok(value) => match Self::encode(value) {
                Ok(payload) => {
                    self.insert_encoded(key.clone(), payload.clone(), ttl);
                    Ok(payload)
                }
                Err(e) => Err((e.code, e.message)),
            },
            Err(e) => {
                debug!("❌ CACHE FETCH FAILED: {} ({})", key, e);
                Err((e.code, e.message.clone()))
            }
        };

        guard.armed = false;
        if let Some((_, tx)) = self.inner.in_flight.remove(&key) {
            tx.send_replace(Some(shared));
        }

        result
    }

    /// Remove an entry
    pub fn invalidate(&self, key: &str) {
        let key = Self::normalize_key(key);
        self.inner.store.remove(&key);
        debug!("🗑️ CACHE INVALIDATE: {}", key);
    }

    /// Remove every entry whose key starts with `prefix`
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let prefix = Self::normalize_key(prefix);
        let before = self.inner.store.len();
        self.inner.store.retain(|k, _| !k.starts_with(&prefix));
        before - self.inner.store.len()
    }

    /// Drop all expired entries
    pub fn cleanup_expired(&self) -> usize {
        let before = self.inner.store.len();
        self.inner.store.retain(|_, entry| !entry.is_expired());
        let removed = before - self.inner.store.len();
        if removed > 0 {
            debug!("🧹 CACHE CLEANUP: {} expired entries removed", removed);
        }
        removed
    }

    /// Cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: self.inner.store.len(),
            hits,
            misses,
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            upstream_fetches: self.inner.fetches.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub upstream_fetches: u64,
    pub hit_rate: f64,
}
