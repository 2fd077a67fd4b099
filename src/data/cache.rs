//! In-memory TTL cache for provider responses.
//!
//! Keys are the request path plus every query parameter (credentials
//! excluded), so distinct date ranges or filters never collide. Values are
//! the raw JSON payloads; callers re-parse on hit, which keeps the cache
//! uniform across endpoint types.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
}

struct CacheEntry {
    value: Value,
    stored_at: Instant,
    ttl: Duration,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Build a cache key from a path and its query parameters.
    pub fn key(path: &str, params: &[(String, String)]) -> String {
        let mut sorted: Vec<&(String, String)> = params.iter().collect();
        sorted.sort();
        let mut key = String::from(path);
        for (k, v) in sorted {
            key.push('&');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let entry = self.entries.get(key)?;
        if entry.stored_at.elapsed() <= entry.ttl {
            Some(entry.value.clone())
        } else {
            drop(entry);
            self.entries.remove(key);
            None
        }
    }

    pub fn put(&self, key: String, value: Value, ttl: Duration) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Drop every expired entry. Workers call this opportunistically.
    pub fn purge_expired(&self) {
        self.entries.retain(|_, e| e.stored_at.elapsed() <= e.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
