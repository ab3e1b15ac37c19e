//! Versioned in-memory key-value cache.
//!
//! A `CachingStrategy<T>` is one named region holding values of a single
//! type. Components compose several regions when they cache different kinds
//! of values, and invalidate each region on its own.
//!
//! Two independent counters exist: every entry counts its own `hits`, and the
//! region counts global `hits`/`misses`. Neither is derived from the other.

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_CACHE_VERSION: &str = "1";

pub(crate) fn now_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub version: String,
    /// Entries older than this are treated as misses by `get`.
    pub ttl: Option<Duration>,
    /// `set` prunes least-recently-used entries down to this size.
    pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_CACHE_VERSION.to_string(),
            ttl: None,
            max_entries: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub timestamp: u64,
    pub version: String,
    pub hits: u64,
    pub last_accessed: u64,
    recency: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub region: String,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub oldest_entry: Option<u64>,
    pub newest_entry: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessedKey {
    pub key: String,
    pub hits: u64,
}

#[derive(Debug)]
pub struct CachingStrategy<T> {
    name: String,
    config: CacheConfig,
    entries: HashMap<String, CacheEntry<T>>,
    hits: u64,
    misses: u64,
    tick: u64,
}

impl<T: Clone> CachingStrategy<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CacheConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            name: name.into(),
            config,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
            tick: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    /// Stamps future entries with `version`. Existing entries stay; call
    /// `invalidate_all` to drop them.
    pub fn set_version(&mut self, version: impl Into<String>) {
        self.config.version = version.into();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, entry: &CacheEntry<T>, now: u64) -> bool {
        self.config
            .ttl
            .is_some_and(|ttl| now.saturating_sub(entry.timestamp) > duration_millis(ttl))
    }

    pub fn get(&mut self, key: &str) -> Option<T> {
        let now = now_millis();
        let expired = self.entries.get(key).is_some_and(|entry| self.is_expired(entry, now));
        if expired {
            self.entries.remove(key);
        }

        self.tick += 1;
        let tick = self.tick;
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.hits += 1;
                entry.last_accessed = now;
                entry.recency = tick;
                self.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn peek(&self, key: &str) -> Option<&CacheEntry<T>> {
        self.entries.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: T) {
        let now = now_millis();
        self.tick += 1;
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                timestamp: now,
                version: self.config.version.clone(),
                hits: 0,
                last_accessed: now,
                recency: self.tick,
            },
        );

        if let Some(max) = self.config.max_entries {
            self.prune_lru(max);
        }
    }

    /// Same expiry rule as `get`, without touching counters or removing.
    pub fn has(&self, key: &str) -> bool {
        let now = now_millis();
        self.entries.get(key).is_some_and(|entry| !self.is_expired(entry, now))
    }

    pub fn invalidate(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    pub fn invalidate_by_pattern(&mut self, pattern: &Regex) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !pattern.is_match(key));
        before - self.entries.len()
    }

    pub fn prune_old_entries(&mut self, max_age: Duration) -> usize {
        let now = now_millis();
        let max_age = duration_millis(max_age);
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.timestamp) <= max_age);
        before - self.entries.len()
    }

    /// Evicts least-recently-used entries until at most `max_size` remain.
    pub fn prune_lru(&mut self, max_size: usize) -> usize {
        if self.entries.len() <= max_size {
            return 0;
        }

        let mut by_recency: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|(k, e)| (e.recency, k.clone()))
            .collect();
        by_recency.sort_unstable();

        let excess = self.entries.len() - max_size;
        for (_, key) in by_recency.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        excess
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.hits + self.misses;
        let hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
        CacheStats {
            region: self.name.clone(),
            hits: self.hits,
            misses: self.misses,
            hit_rate,
            size: self.entries.len(),
            oldest_entry: self.entries.values().map(|e| e.timestamp).min(),
            newest_entry: self.entries.values().map(|e| e.timestamp).max(),
        }
    }

    pub fn most_accessed(&self, limit: usize) -> Vec<AccessedKey> {
        let mut keys: Vec<AccessedKey> = self
            .entries
            .iter()
            .map(|(k, e)| AccessedKey {
                key: k.clone(),
                hits: e.hits,
            })
            .collect();
        keys.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.key.cmp(&b.key)));
        keys.truncate(limit);
        keys
    }
}
