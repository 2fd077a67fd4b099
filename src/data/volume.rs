//! Cross-scan volume-delta cache.
//!
//! Holds the last-seen per-contract day volumes for each underlying so the
//! flow detector can reconstruct trade flow between two chain snapshots.
//! Individual observations go stale after two minutes; a whole underlying
//! is evicted after five minutes without a write. The flow detector's
//! per-underlying scan lock guarantees a single writer per entry.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rustc_hash::FxHashMap;

const CONTRACT_TTL: Duration = Duration::from_secs(120);
const ENTRY_TTL: Duration = Duration::from_secs(300);

struct Observation {
    day_volume: u64,
    observed_at: Instant,
}

struct UnderlyingVolumes {
    volumes: FxHashMap<String, Observation>,
    last_update: Instant,
}

pub struct VolumeDeltaCache {
    entries: DashMap<String, UnderlyingVolumes>,
    contract_ttl: Duration,
    entry_ttl: Duration,
}

impl Default for VolumeDeltaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeDeltaCache {
    pub fn new() -> Self {
        Self::with_ttls(CONTRACT_TTL, ENTRY_TTL)
    }

    pub fn with_ttls(contract_ttl: Duration, entry_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            contract_ttl,
            entry_ttl,
        }
    }

    /// Previous snapshot's volumes for an underlying, with stale
    /// observations filtered out. `None` when nothing usable remains.
    pub fn get(&self, underlying: &str) -> Option<FxHashMap<String, u64>> {
        let entry = self.entries.get(underlying)?;
        let fresh: FxHashMap<String, u64> = entry
            .volumes
            .iter()
            .filter(|(_, obs)| obs.observed_at.elapsed() <= self.contract_ttl)
            .map(|(ticker, obs)| (ticker.clone(), obs.day_volume))
            .collect();
        if fresh.is_empty() {
            None
        } else {
            Some(fresh)
        }
    }

    /// Replace the underlying's volumes with the current snapshot's.
    pub fn set(&self, underlying: &str, volumes: FxHashMap<String, u64>) {
        let now = Instant::now();
        let observations = volumes
            .into_iter()
            .map(|(ticker, day_volume)| {
                (
                    ticker,
                    Observation {
                        day_volume,
                        observed_at: now,
                    },
                )
            })
            .collect();
        self.entries.insert(
            underlying.to_string(),
            UnderlyingVolumes {
                volumes: observations,
                last_update: now,
            },
        );
    }

    /// Evict underlyings that have not been written within the entry TTL.
    pub fn evict_idle(&self) {
        self.entries
            .retain(|_, e| e.last_update.elapsed() <= self.entry_ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volumes(pairs: &[(&str, u64)]) -> FxHashMap<String, u64> {
        pairs
            .iter()
            .map(|(t, v)| ((*t).to_string(), *v))
            .collect()
    }

    #[test]
    fn get_returns_what_was_set() {
        let cache = VolumeDeltaCache::new();
        cache.set("AAPL", volumes(&[("O:AAPL1", 100), ("O:AAPL2", 250)]));
        let got = cache.get("AAPL").unwrap();
        assert_eq!(got.get("O:AAPL1"), Some(&100));
        assert_eq!(got.get("O:AAPL2"), Some(&250));
        assert!(cache.get("MSFT").is_none());
    }

    #[test]
    fn set_replaces_previous_snapshot() {
        let cache = VolumeDeltaCache::new();
        cache.set("AAPL", volumes(&[("O:AAPL1", 100)]));
        cache.set("AAPL", volumes(&[("O:AAPL2", 300)]));
        let got = cache.get("AAPL").unwrap();
        assert!(!got.contains_key("O:AAPL1"));
        assert_eq!(got.get("O:AAPL2"), Some(&300));
    }

    #[test]
    fn stale_observations_are_filtered_on_read() {
        let cache =
            VolumeDeltaCache::with_ttls(Duration::from_millis(10), Duration::from_secs(300));
        cache.set("AAPL", volumes(&[("O:AAPL1", 100)]));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("AAPL").is_none());
    }

    #[test]
    fn idle_entries_are_evicted() {
        let cache =
            VolumeDeltaCache::with_ttls(Duration::from_secs(120), Duration::from_millis(10));
        cache.set("AAPL", volumes(&[("O:AAPL1", 100)]));
        cache.set("MSFT", volumes(&[("O:MSFT1", 50)]));
        std::thread::sleep(Duration::from_millis(20));
        cache.set("MSFT", volumes(&[("O:MSFT1", 75)]));
        cache.evict_idle();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("MSFT").is_some());
    }
}
