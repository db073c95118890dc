//! In-process query result cache.
//!
//! Values are stored as JSON so any `Serialize` type can be cached and read
//! back as any compatible `Deserialize` type. The entry map sits behind a
//! `tokio::sync::RwLock`; hits only take the read lock and bump per-entry
//! atomics. Expiration, capacity and memory limits remove entries and
//! publish a [`CacheEvent`] on a broadcast channel.
//!
//! # Module Structure
//! - `models`: options, results, statistics, and eviction events
//! - `key`: cache key derivation

mod key;
mod models;

pub use key::CacheKeyGenerator;
pub use models::{
    CacheConfig, CacheEntryOptions, CacheEvent, CachePriority, CacheResult, CacheStatistics,
    EvictionReason,
};

use crate::Result;
use crate::error::SqlAnalyzerError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
enum Expiration {
    Never,
    Absolute(Instant),
    Sliding(Duration),
}

#[derive(Debug)]
struct CacheEntry {
    json: String,
    cached_at: DateTime<Utc>,
    expiration: Expiration,
    priority: CachePriority,
    tags: Vec<String>,
    size: u64,
    hit_count: AtomicU64,
    /// Milliseconds since the cache epoch
    last_accessed: AtomicU64,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: u64, now: Instant) -> bool {
        match self.expiration {
            Expiration::Never => false,
            Expiration::Absolute(deadline) => now >= deadline,
            Expiration::Sliding(window) => {
                let idle = now_ms.saturating_sub(self.last_accessed.load(Ordering::Relaxed));
                u128::from(idle) >= window.as_millis()
            }
        }
    }

    fn expires_at(&self, now: Instant) -> Option<DateTime<Utc>> {
        let remaining = match self.expiration {
            Expiration::Never => return None,
            Expiration::Absolute(deadline) => deadline.saturating_duration_since(now),
            Expiration::Sliding(window) => window,
        };
        chrono::Duration::from_std(remaining)
            .ok()
            .map(|remaining| Utc::now() + remaining)
    }
}

/// Entry map plus a running total of accounted entry sizes.
///
/// The total is kept in `u128` so summing `u64` sizes cannot overflow.
#[derive(Default)]
struct EntryStore {
    map: HashMap<String, Arc<CacheEntry>>,
    memory: u128,
}

impl EntryStore {
    fn get(&self, key: &str) -> Option<&Arc<CacheEntry>> {
        self.map.get(key)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn insert(&mut self, key: String, entry: Arc<CacheEntry>) -> Option<Arc<CacheEntry>> {
        self.memory = self.memory.saturating_add(u128::from(entry.size));
        let replaced = self.map.insert(key, entry);
        if let Some(old) = &replaced {
            self.memory = self.memory.saturating_sub(u128::from(old.size));
        }
        replaced
    }

    fn remove(&mut self, key: &str) -> Option<Arc<CacheEntry>> {
        let removed = self.map.remove(key);
        if let Some(entry) = &removed {
            self.memory = self.memory.saturating_sub(u128::from(entry.size));
        }
        removed
    }

    fn clear(&mut self) {
        self.map.clear();
        self.memory = 0;
    }

    fn memory_bytes(&self) -> u64 {
        u64::try_from(self.memory).unwrap_or(u64::MAX)
    }
}

struct CacheInner {
    config: CacheConfig,
    entries: RwLock<EntryStore>,
    key_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    epoch: Instant,
    created_at: DateTime<Utc>,
    last_cleared_at: StdMutex<Option<DateTime<Utc>>>,
    events: broadcast::Sender<CacheEvent>,
    shutdown: CancellationToken,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl CacheInner {
    fn now_ms(&self, now: Instant) -> u64 {
        u64::try_from(now.duration_since(self.epoch).as_millis()).unwrap_or(u64::MAX)
    }

    fn publish(&self, key: String, entry: &CacheEntry, reason: EvictionReason) {
        if matches!(
            reason,
            EvictionReason::Expired | EvictionReason::Capacity | EvictionReason::MemoryPressure
        ) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        debug!(key = %key, reason = ?reason, "Cache entry removed");
        // No subscribers is fine
        let _ = self.events.send(CacheEvent {
            key,
            reason,
            tags: entry.tags.clone(),
        });
    }

    /// Evicts entries until the limits hold or nothing evictable is left.
    /// `keep`, the entry just written, is never evicted.
    fn enforce_limits(
        &self,
        entries: &mut EntryStore,
        keep: &str,
    ) -> Vec<(String, Arc<CacheEntry>, EvictionReason)> {
        let mut evicted = Vec::new();

        if let Some(max_entries) = self.config.max_entries {
            while entries.len() > max_entries {
                match eviction_candidate(entries, keep) {
                    Some(key) => {
                        if let Some(entry) = entries.remove(&key) {
                            evicted.push((key, entry, EvictionReason::Capacity));
                        }
                    }
                    None => break,
                }
            }
        }

        if let Some(max_memory) = self.config.max_memory_bytes {
            while entries.memory > u128::from(max_memory) {
                match eviction_candidate(entries, keep) {
                    Some(key) => {
                        if let Some(entry) = entries.remove(&key) {
                            evicted.push((key, entry, EvictionReason::MemoryPressure));
                        }
                    }
                    None => break,
                }
            }
        }

        evicted
    }

    async fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let now_ms = self.now_ms(now);
        let expired: Vec<(String, Arc<CacheEntry>)> = {
            let mut entries = self.entries.write().await;
            let keys: Vec<String> = entries
                .map
                .iter()
                .filter(|(_, entry)| entry.is_expired(now_ms, now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key, entry)))
                .collect()
        };

        let count = expired.len();
        for (key, entry) in expired {
            self.publish(key, &entry, EvictionReason::Expired);
        }
        if count > 0 {
            debug!(count = count, "Swept expired cache entries");
        }
        count
    }
}

/// Lowest priority first, then least recently accessed.
fn eviction_candidate(entries: &EntryStore, keep: &str) -> Option<String> {
    entries
        .map
        .iter()
        .filter(|(key, entry)| key.as_str() != keep && entry.priority != CachePriority::NeverRemove)
        .min_by_key(|(_, entry)| (entry.priority, entry.last_accessed.load(Ordering::Relaxed)))
        .map(|(key, _)| key.clone())
}

fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(SqlAnalyzerError::invalid_input(
            "Cache key cannot be null or empty",
        ));
    }
    Ok(())
}

/// Shared handle to an in-memory cache; clones see the same entries.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.inner.config)
            .field("hits", &self.inner.hits.load(Ordering::Relaxed))
            .field("misses", &self.inner.misses.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::build(CacheConfig::default())
    }
}

impl QueryCache {
    /// Creates an empty cache. Call [`start_sweeper`](Self::start_sweeper)
    /// to remove expired entries in the background.
    ///
    /// # Errors
    /// Returns `Configuration` when `config` is invalid.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: CacheConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(CacheInner {
                config,
                entries: RwLock::new(EntryStore::default()),
                key_locks: StdMutex::new(HashMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                epoch: Instant::now(),
                created_at: Utc::now(),
                last_cleared_at: StdMutex::new(None),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Limits in effect.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Looks up `key`, counting a hit or a miss.
    ///
    /// A hit renews sliding expiration. An expired entry is removed with
    /// [`EvictionReason::Expired`] and reported as a miss.
    ///
    /// # Errors
    /// Returns `InvalidInput` for an empty key and `Serialization` when the
    /// stored value does not deserialize as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<CacheResult<T>> {
        validate_key(key)?;
        let result = self.lookup(key).await?;
        let counter = if result.hit {
            &self.inner.hits
        } else {
            &self.inner.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    /// Stores `value` under `key`, replacing any previous entry.
    ///
    /// # Errors
    /// Returns `InvalidInput` for an empty key or conflicting expirations and
    /// `Serialization` when `value` does not serialize.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: CacheEntryOptions,
    ) -> Result<()> {
        validate_key(key)?;
        options.validate()?;
        let json = serde_json::to_string(value)
            .map_err(|e| SqlAnalyzerError::serialization(format!("cache value for '{}'", key), e))?;

        let now = Instant::now();
        let expiration = match (options.absolute_expiration, options.sliding_expiration) {
            (Some(ttl), _) => Expiration::Absolute(now + ttl),
            (None, Some(window)) => Expiration::Sliding(window),
            (None, None) => Expiration::Never,
        };
        let size = options.size.unwrap_or(json.len() as u64);
        let entry = Arc::new(CacheEntry {
            json,
            cached_at: Utc::now(),
            expiration,
            priority: options.priority,
            tags: options.tags,
            size,
            hit_count: AtomicU64::new(0),
            last_accessed: AtomicU64::new(self.inner.now_ms(now)),
        });

        let (replaced, evicted) = {
            let mut entries = self.inner.entries.write().await;
            let replaced = entries.insert(key.to_string(), entry);
            let evicted = self.inner.enforce_limits(&mut entries, key);
            (replaced, evicted)
        };

        if let Some(old) = replaced {
            self.inner.publish(key.to_string(), &old, EvictionReason::Replaced);
        }
        for (evicted_key, entry, reason) in evicted {
            self.inner.publish(evicted_key, &entry, reason);
        }
        debug!(key = key, size = size, "Cached entry");
        Ok(())
    }

    /// Removes `key`; returns whether it was present.
    pub async fn remove(&self, key: &str) -> bool {
        let removed = self.inner.entries.write().await.remove(key);
        match removed {
            Some(entry) => {
                self.inner.publish(key.to_string(), &entry, EvictionReason::Removed);
                true
            }
            None => false,
        }
    }

    /// Drops every entry without publishing events.
    pub async fn clear(&self) {
        let count = {
            let mut entries = self.inner.entries.write().await;
            let count = entries.len();
            entries.clear();
            count
        };
        *self
            .inner
            .last_cleared_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        info!(count = count, "Cache cleared");
    }

    /// True when `key` holds an unexpired entry. Does not count as a read.
    pub async fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        let now_ms = self.inner.now_ms(now);
        self.inner
            .entries
            .read()
            .await
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now_ms, now))
    }

    /// Returns the cached value or computes, stores, and returns it.
    ///
    /// Concurrent callers for the same key are serialized, so `factory` runs
    /// at most once per miss. Each call counts exactly one hit or miss.
    ///
    /// # Errors
    /// Propagates `factory` errors, in which case nothing is cached, and the
    /// errors of [`get`](Self::get) and [`set`](Self::set).
    pub async fn get_or_add<T, F, Fut>(
        &self,
        key: &str,
        factory: F,
        options: CacheEntryOptions,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        validate_key(key)?;
        options.validate()?;

        let fast = self.lookup::<T>(key).await?;
        if let Some(value) = fast.value {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        let lock = self.key_lock(key);
        let outcome = {
            let _guard = lock.lock().await;
            self.fill(key, factory, options).await
        };
        self.release_key_lock(key, &lock);
        outcome
    }

    async fn fill<T, F, Fut>(&self, key: &str, factory: F, options: CacheEntryOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // Another caller may have filled the entry while we waited
        if let Some(value) = self.get::<T>(key).await?.value {
            return Ok(value);
        }
        let value = factory().await?;
        self.set(key, &value, options).await?;
        Ok(value)
    }

    /// Snapshot of the counters.
    pub async fn statistics(&self) -> CacheStatistics {
        let (count, memory) = {
            let entries = self.inner.entries.read().await;
            (entries.len(), entries.memory_bytes())
        };
        CacheStatistics {
            total_hits: self.inner.hits.load(Ordering::Relaxed),
            total_misses: self.inner.misses.load(Ordering::Relaxed),
            total_evictions: self.inner.evictions.load(Ordering::Relaxed),
            current_entry_count: count,
            current_memory_usage: memory,
            created_at: self.inner.created_at,
            last_cleared_at: *self
                .inner
                .last_cleared_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Subscribes to eviction events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Removes expired entries now; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        self.inner.remove_expired().await
    }

    /// Spawns the periodic expiration sweep.
    ///
    /// The task holds only a weak reference and exits once every handle to
    /// the cache is dropped or [`shutdown`](Self::shutdown) is called.
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        inner.remove_expired().await;
                    }
                }
            }
            debug!("Cache sweeper stopped");
        })
    }

    /// Stops the background sweeper.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<CacheResult<T>> {
        let now = Instant::now();
        let now_ms = self.inner.now_ms(now);

        let expired = {
            let entries = self.inner.entries.read().await;
            match entries.get(key) {
                None => return Ok(CacheResult::miss()),
                Some(entry) if entry.is_expired(now_ms, now) => Arc::clone(entry),
                Some(entry) => {
                    let value = serde_json::from_str(&entry.json).map_err(|e| {
                        SqlAnalyzerError::serialization(format!("cache value for '{}'", key), e)
                    })?;
                    let hit_count = entry.hit_count.fetch_add(1, Ordering::Relaxed) + 1;
                    entry.last_accessed.store(now_ms, Ordering::Relaxed);
                    return Ok(CacheResult {
                        hit: true,
                        value: Some(value),
                        cached_at: Some(entry.cached_at),
                        expires_at: entry.expires_at(now),
                        hit_count,
                    });
                }
            }
        };

        let removed = {
            let mut entries = self.inner.entries.write().await;
            // Only remove the entry we saw; it may have been replaced since
            match entries.get(key) {
                Some(current) if Arc::ptr_eq(current, &expired) => entries.remove(key),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            self.inner.publish(key.to_string(), &entry, EvictionReason::Expired);
        }
        Ok(CacheResult::miss())
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .inner
            .key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    fn release_key_lock(&self, key: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self
            .inner
            .key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // The map and this caller are the only holders: nobody is waiting
        if Arc::strong_count(lock) == 2 {
            locks.remove(key);
        }
    }
}
