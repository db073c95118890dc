//! Cache options, lookup results, statistics, and eviction events.

use crate::Result;
use crate::error::SqlAnalyzerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Eviction order: lower priorities go first, `NeverRemove` never does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePriority {
    Low,
    #[default]
    Normal,
    High,
    /// Exempt from capacity and memory-pressure eviction; still expires
    NeverRemove,
}

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Absolute or sliding expiration elapsed
    Expired,
    /// `max_memory_bytes` exceeded
    MemoryPressure,
    /// `max_entries` exceeded
    Capacity,
    /// Overwritten by a later `set`
    Replaced,
    /// Removed by the caller
    Removed,
}

/// Published on the cache's broadcast channel whenever an entry leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub key: String,
    pub reason: EvictionReason,
    pub tags: Vec<String>,
}

/// Per-entry options for [`QueryCache::set`](super::QueryCache::set).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheEntryOptions {
    /// Entry expires this long after it is stored
    #[serde(
        rename = "absolute_expiration_secs",
        with = "crate::config::option_duration_secs"
    )]
    pub absolute_expiration: Option<Duration>,
    /// Entry expires after going unread this long
    #[serde(
        rename = "sliding_expiration_secs",
        with = "crate::config::option_duration_secs"
    )]
    pub sliding_expiration: Option<Duration>,
    pub priority: CachePriority,
    /// Accounted size in bytes; defaults to the serialized length
    pub size: Option<u64>,
    pub tags: Vec<String>,
}

impl CacheEntryOptions {
    /// Expires the entry `ttl` after it is stored.
    pub fn with_absolute_expiration(mut self, ttl: Duration) -> Self {
        self.absolute_expiration = Some(ttl);
        self
    }

    /// Expires the entry after `window` without reads.
    pub fn with_sliding_expiration(mut self, window: Duration) -> Self {
        self.sliding_expiration = Some(window);
        self
    }

    /// Sets the eviction priority.
    pub fn with_priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Overrides the accounted size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Attaches tags reported in eviction events.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Validates the options.
    ///
    /// # Errors
    /// Returns `InvalidInput` when both expirations are set.
    pub fn validate(&self) -> Result<()> {
        if self.absolute_expiration.is_some() && self.sliding_expiration.is_some() {
            return Err(SqlAnalyzerError::invalid_input(
                "absolute and sliding expiration are mutually exclusive",
            ));
        }
        Ok(())
    }
}

/// Cache-wide limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry count limit; least recently used entries are evicted past it
    pub max_entries: Option<usize>,
    /// Limit on the summed entry sizes
    pub max_memory_bytes: Option<u64>,
    /// Period of the background expiration sweep
    #[serde(rename = "sweep_interval_secs", with = "crate::config::duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: None,
            max_memory_bytes: None,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    /// Sets the entry limit.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    /// Sets the memory limit.
    pub fn with_max_memory_bytes(mut self, max_memory_bytes: u64) -> Self {
        self.max_memory_bytes = Some(max_memory_bytes);
        self
    }

    /// Sets the sweep period.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Validates the limits.
    ///
    /// # Errors
    /// Returns `Configuration` for a zero limit or sweep interval.
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == Some(0) {
            return Err(SqlAnalyzerError::configuration(
                "max_entries must be greater than 0",
            ));
        }
        if self.max_memory_bytes == Some(0) {
            return Err(SqlAnalyzerError::configuration(
                "max_memory_bytes must be greater than 0",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(SqlAnalyzerError::configuration(
                "sweep_interval must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Outcome of [`QueryCache::get`](super::QueryCache::get).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheResult<T> {
    pub hit: bool,
    pub value: Option<T>,
    pub cached_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Reads of the entry including this one
    pub hit_count: u64,
}

impl<T> CacheResult<T> {
    pub(crate) fn miss() -> Self {
        Self {
            hit: false,
            value: None,
            cached_at: None,
            expires_at: None,
            hit_count: 0,
        }
    }

    /// Consumes the result, returning the value on a hit.
    pub fn into_value(self) -> Option<T> {
        self.value
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub total_hits: u64,
    pub total_misses: u64,
    /// Entries removed by expiration, capacity, or memory pressure
    pub total_evictions: u64,
    pub current_entry_count: usize,
    /// Sum of accounted entry sizes in bytes
    pub current_memory_usage: u64,
    pub created_at: DateTime<Utc>,
    pub last_cleared_at: Option<DateTime<Utc>>,
}

impl CacheStatistics {
    /// Hits as a percentage of lookups; `0` before the first lookup.
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.total_hits + self.total_misses;
        if lookups == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.total_hits as f64 / lookups as f64 * 100.0;
        ratio
    }

    /// Mean accounted entry size, `None` when empty.
    pub fn average_entry_size(&self) -> Option<u64> {
        (self.current_entry_count > 0)
            .then(|| self.current_memory_usage / self.current_entry_count as u64)
    }
}
