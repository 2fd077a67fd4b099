//! Alert suppression: per-contract cooldowns for flow, per-day keys for
//! patterns.
//!
//! Flow cooldowns are in-memory with a per-strategy TTL. Pattern keys are
//! day-scoped (ET) and consult the SQLite store when one is configured, so
//! a restart cannot re-emit the same pattern on the same trading date. The
//! day map clears whenever the observed ET date changes; nothing depends on
//! being awake at midnight exactly.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use dashmap::DashMap;
use ordered_float::OrderedFloat;

use crate::data::store::SignalStore;
use crate::engine::types::{FlowEvent, OptionKind};

pub const DEFAULT_FLOW_COOLDOWN: Duration = Duration::from_secs(4 * 3600);

/// One contract per strategy per cooldown window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CooldownKey {
    pub underlying: String,
    pub kind: OptionKind,
    pub strike: OrderedFloat<f64>,
    pub expiration: NaiveDate,
}

impl CooldownKey {
    pub fn from_event(e: &FlowEvent) -> Self {
        Self {
            underlying: e.underlying.clone(),
            kind: e.kind,
            strike: OrderedFloat(e.strike),
            expiration: e.expiration,
        }
    }
}

pub struct DedupStore {
    cooldown_ttl: Duration,
    cooldowns: DashMap<CooldownKey, Instant>,
    day_keys: Mutex<HashSet<String>>,
    last_reset: Mutex<NaiveDate>,
    persist: Option<Arc<SignalStore>>,
}

impl DedupStore {
    pub fn new(
        cooldown_ttl: Duration,
        persist: Option<Arc<SignalStore>>,
        today_et: NaiveDate,
    ) -> Self {
        Self {
            cooldown_ttl,
            cooldowns: DashMap::new(),
            day_keys: Mutex::new(HashSet::new()),
            last_reset: Mutex::new(today_et),
            persist,
        }
    }

    /// Claim a flow alert slot. `true` means the caller should emit.
    pub fn try_claim_flow(&self, key: CooldownKey) -> bool {
        let now = Instant::now();
        match self.cooldowns.get(&key) {
            Some(posted) if now.duration_since(*posted.value()) < self.cooldown_ttl => false,
            _ => {
                self.cooldowns.insert(key, now);
                true
            }
        }
    }

    /// Live cooldown entries for an underlying, excluding the contract
    /// being scored. Feeds the repeat-activity score component.
    pub fn recent_flow_hits(&self, underlying: &str, except: &CooldownKey) -> u32 {
        let now = Instant::now();
        self.cooldowns
            .iter()
            .filter(|entry| {
                entry.key().underlying == underlying
                    && entry.key() != except
                    && now.duration_since(*entry.value()) < self.cooldown_ttl
            })
            .count() as u32
    }

    /// Claim a pattern alert for its ET trading date. Consults the
    /// persistent store first so restarts stay suppressed.
    pub fn try_claim_pattern(&self, dedup_key: &str, today_et: NaiveDate) -> bool {
        self.maybe_daily_reset(today_et);

        let mut day_keys = self.day_keys.lock().expect("dedup lock poisoned");
        if day_keys.contains(dedup_key) {
            return false;
        }
        if let Some(store) = &self.persist {
            match store.has_alert(dedup_key) {
                Ok(true) => {
                    day_keys.insert(dedup_key.to_string());
                    return false;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "dedup store read failed, using memory only");
                }
            }
        }
        day_keys.insert(dedup_key.to_string());
        true
    }

    /// Clear day-scoped state when the ET calendar date moves on.
    pub fn maybe_daily_reset(&self, today_et: NaiveDate) {
        let mut last = self.last_reset.lock().expect("dedup lock poisoned");
        if *last != today_et {
            tracing::info!(from = %*last, to = %today_et, "dedup daily reset");
            *last = today_et;
            self.day_keys
                .lock()
                .expect("dedup lock poisoned")
                .clear();
        }
    }

    /// Drop expired cooldown entries; called opportunistically by workers.
    pub fn purge_cooldowns(&self) {
        let now = Instant::now();
        self.cooldowns
            .retain(|_, posted| now.duration_since(*posted) < self.cooldown_ttl);
    }
}
