// Read-through cache shared by the catalog service facades

//! # Read-Through Cache
//!
//! One generic helper instead of one wrapper per service: the request is
//! serialized into the key (`<prefix>:<json>`), a hit is deserialized into
//! the response type, and a miss (or an entry that no longer deserializes)
//! calls upstream and writes the JSON response back.
//!
//! Entries expire after the configured TTL. Concurrent misses on the same key
//! both go upstream; last writer wins.
//!
//! The map holds at most `max_entries`. Expired entries are swept every
//! `SWEEP_EVERY` writes and whenever the map is full; a write into a full map
//! that holds no expired entry evicts the entry closest to expiry.
//!
//! ## Rust Learning Notes:
//!
//! ### Closures returning futures
//! `get_or_fetch` takes `F: FnOnce() -> Fut` so callers pass
//! `|| self.inner.get_user(login, ctx)` without boxing. The upstream future
//! is only created on a miss.

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::Result;

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;
const SWEEP_EVERY: usize = 64;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// Process-wide key-value cache with a fixed TTL and a capacity bound
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone)]
pub struct ReadThroughCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    writes: Arc<AtomicUsize>,
    ttl: Duration,
    max_entries: usize,
}

impl ReadThroughCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            writes: Arc::new(AtomicUsize::new(0)),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Cache key for a request; serialization is deterministic for our request types
    pub fn key<R: Serialize>(prefix: &str, request: &R) -> Result<String> {
        Ok(format!("{}:{}", prefix, serde_json::to_string(request)?))
    }

    /// Return the cached response for `request` or fetch and store it
    pub async fn get_or_fetch<R, T, F, Fut>(&self, prefix: &str, request: &R, fetch: F) -> Result<T>
    where
        R: Serialize,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = Self::key(prefix, request)?;

        if let Some(hit) = self.lookup::<T>(&key) {
            debug!(key = %key, "cache hit");
            return Ok(hit);
        }

        let value = fetch().await?;

        match serde_json::to_string(&value) {
            Ok(encoded) => self.store(key, encoded),
            Err(e) => warn!(key = %key, error = %e, "can't store value in cache"),
        }

        Ok(value)
    }

    fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.entries.get(key)?.clone();

        if entry.expires_at <= Instant::now() {
            self.entries.remove(key);
            return None;
        }

        match serde_json::from_str(&entry.value) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "dropping undecodable cache entry");
                self.entries.remove(key);
                None
            }
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Store a raw JSON document under a key (warm-up and tests)
    pub fn put_raw(&self, key: impl Into<String>, value: impl Into<String>) {
        self.store(key.into(), value.into());
    }

    fn store(&self, key: String, value: String) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        let full = self.entries.len() >= self.max_entries && !self.entries.contains_key(&key);
        if full || writes % SWEEP_EVERY == 0 {
            self.sweep_expired();
        }
        if full && self.entries.len() >= self.max_entries {
            self.evict_soonest();
        }

        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let swept = before.saturating_sub(self.entries.len());
        if swept > 0 {
            debug!(swept, "expired cache entries dropped");
        }
    }

    /// Drop the entry closest to expiry; with one TTL that is the oldest write
    fn evict_soonest(&self) {
        let soonest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = soonest {
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
