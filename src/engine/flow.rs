//! Unusual-flow detection from consecutive option-chain snapshots.
//!
//! Each scan diffs the current chain against the volume-delta cache to
//! reconstruct per-contract trade flow, then filters by size and premium
//! and classifies aggressiveness. A per-underlying mutex serializes scans
//! so the cache entry for an underlying has exactly one writer.

use std::sync::Arc;

use dashmap::DashMap;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;

use crate::data::polygon::PolygonClient;
use crate::data::volume::VolumeDeltaCache;
use crate::engine::types::{ContractSnapshot, ExecutionSide, FlowEvent, FlowIntensity};
use crate::error::FetchError;

/// First-sighting (or day-rollover) deltas are capped so a symbol that was
/// never scanned before does not report its whole day volume as one sweep.
pub const BOOTSTRAP_VOLUME_CAP: u64 = 5000;

#[derive(Debug, Clone)]
pub struct FlowThresholds {
    pub min_premium: f64,
    pub min_volume_delta: u64,
    pub min_vol_oi_ratio: Option<f64>,
}

pub struct FlowDetector {
    client: Arc<PolygonClient>,
    volumes: Arc<VolumeDeltaCache>,
    scan_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FlowDetector {
    pub fn new(client: Arc<PolygonClient>, volumes: Arc<VolumeDeltaCache>) -> Self {
        Self {
            client,
            volumes,
            scan_locks: DashMap::new(),
        }
    }

    /// One flow scan for an underlying. Empty snapshots return an empty
    /// list without touching the cache, so a transient provider hiccup
    /// cannot wipe the baseline.
    pub async fn scan(
        &self,
        underlying: &str,
        thresholds: &FlowThresholds,
    ) -> Result<Vec<FlowEvent>, FetchError> {
        let underlying = underlying.to_uppercase();
        let lock = self
            .scan_locks
            .entry(underlying.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let snapshot = self.client.get_option_chain_snapshot(&underlying).await?;
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }

        let previous = self.volumes.get(&underlying);
        let mut events: Vec<FlowEvent> = snapshot
            .iter()
            .filter_map(|c| build_event(c, previous.as_ref(), thresholds))
            .collect();

        let current: FxHashMap<String, u64> = snapshot
            .iter()
            .map(|c| (c.ticker.clone(), c.day_volume))
            .collect();
        self.volumes.set(&underlying, current);

        events.sort_by(|a, b| b.premium_usd.total_cmp(&a.premium_usd));
        Ok(events)
    }
}

/// Classify which side of the market the flow hit, with small tolerances
/// for stale quotes: at/through the ask (99.5%), at/through the bid
/// (100.5%), within 2% of the midpoint, else the nearest side.
pub fn execution_side(last: f64, bid: Option<f64>, ask: Option<f64>) -> ExecutionSide {
    let bid = bid.filter(|b| b.is_finite() && *b > 0.0);
    let ask = ask.filter(|a| a.is_finite() && *a > 0.0);
    match (bid, ask) {
        (None, None) => ExecutionSide::Unknown,
        (Some(b), None) => {
            if last <= b * 1.005 {
                ExecutionSide::Bid
            } else {
                ExecutionSide::Unknown
            }
        }
        (None, Some(a)) => {
            if last >= a * 0.995 {
                ExecutionSide::Ask
            } else {
                ExecutionSide::Unknown
            }
        }
        (Some(b), Some(a)) => {
            if last >= a * 0.995 {
                ExecutionSide::Ask
            } else if last <= b * 1.005 {
                ExecutionSide::Bid
            } else {
                let mid = f64::midpoint(b, a);
                if mid > 0.0 && (last - mid).abs() <= 0.02 * mid {
                    ExecutionSide::Mid
                } else if (a - last) < (last - b) {
                    ExecutionSide::Ask
                } else {
                    ExecutionSide::Bid
                }
            }
        }
    }
}

/// Volume-delta to open-interest ratio bands.
pub fn intensity(vol_oi_ratio: Option<f64>) -> FlowIntensity {
    match vol_oi_ratio {
        Some(r) if r >= 0.50 => FlowIntensity::Aggressive,
        Some(r) if r >= 0.20 => FlowIntensity::Strong,
        Some(r) if r >= 0.10 => FlowIntensity::Moderate,
        _ => FlowIntensity::Normal,
    }
}

/// Turn one contract into a flow event, or skip it.
///
/// A missing baseline or a day-volume counter that moved backwards (day
/// rollover) bootstraps with `min(current, 5000)`; an unchanged counter is
/// genuinely zero flow and is always skipped.
pub(crate) fn build_event(
    contract: &ContractSnapshot,
    previous: Option<&FxHashMap<String, u64>>,
    thresholds: &FlowThresholds,
) -> Option<FlowEvent> {
    let last_price = contract.reference_price()?;
    let current_volume = contract.day_volume;

    let previous_volume = previous.and_then(|m| m.get(&contract.ticker).copied());
    let volume_delta = match previous_volume {
        None => current_volume.min(BOOTSTRAP_VOLUME_CAP),
        Some(prev) if current_volume < prev => current_volume.min(BOOTSTRAP_VOLUME_CAP),
        Some(prev) => current_volume - prev,
    };
    if volume_delta < thresholds.min_volume_delta.max(1) {
        return None;
    }

    let vol_oi_ratio = (contract.open_interest > 0)
        .then(|| volume_delta as f64 / contract.open_interest as f64);
    let intensity = intensity(vol_oi_ratio);

    let premium_usd = volume_delta as f64 * last_price * 100.0;
    if premium_usd < thresholds.min_premium {
        return None;
    }
    if let Some(min_ratio) = thresholds.min_vol_oi_ratio {
        match vol_oi_ratio {
            Some(r) if r >= min_ratio => {}
            _ => return None,
        }
    }

    let execution_side = execution_side(last_price, contract.bid, contract.ask);

    Some(FlowEvent {
        contract_ticker: contract.ticker.clone(),
        underlying: contract.underlying.clone(),
        kind: contract.resolve_kind(),
        strike: contract.strike,
        expiration: contract.expiration,
        volume_delta,
        total_volume: current_volume,
        open_interest: contract.open_interest,
        vol_oi_ratio,
        last_price,
        bid: contract.bid,
        ask: contract.ask,
        bid_size: contract.bid_size,
        ask_size: contract.ask_size,
        premium_usd,
        iv: contract.iv,
        delta: contract.delta,
        gamma: contract.gamma,
        theta: contract.theta,
        vega: contract.vega,
        underlying_price: contract.underlying_price,
        execution_side,
        intensity,
        observed_at: contract.as_of,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::limiter::{CircuitBreaker, TokenBucket};
    use crate::data::polygon::ClientOptions;
    use crate::data::transport::ScriptedTransport;
    use crate::engine::types::OptionKind;
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn contract(day_volume: u64) -> ContractSnapshot {
        ContractSnapshot {
            ticker: "O:AAPL261219C00200000".into(),
            underlying: "AAPL".into(),
            kind: Some(OptionKind::Call),
            strike: 200.0,
            expiration: NaiveDate::from_ymd_opt(2026, 12, 19).unwrap(),
            day_volume,
            open_interest: 3000,
            day_close: Some(7.0),
            day_open: Some(6.5),
            day_high: Some(7.2),
            day_low: Some(6.4),
            last_trade_price: Some(7.0),
            bid: Some(6.95),
            ask: Some(7.01),
            bid_size: Some(25),
            ask_size: Some(40),
            iv: Some(0.30),
            delta: Some(0.55),
            gamma: Some(0.01),
            theta: Some(-0.05),
            vega: Some(0.12),
            underlying_price: Some(198.50),
            as_of: Utc.with_ymd_and_hms(2025, 10, 22, 14, 0, 0).unwrap(),
        }
    }

    fn thresholds(min_premium: f64, min_volume_delta: u64) -> FlowThresholds {
        FlowThresholds {
            min_premium,
            min_volume_delta,
            min_vol_oi_ratio: None,
        }
    }

    // --- build_event ---

    #[test]
    fn golden_sweep_bootstrap_event() {
        // No previous snapshot: delta bootstraps to min(1500, 5000) = 1500.
        let e = build_event(&contract(1500), None, &thresholds(1_000_000.0, 500)).unwrap();
        assert_eq!(e.volume_delta, 1500);
        assert!((e.premium_usd - 1_050_000.0).abs() < 1e-6);
        assert_eq!(e.intensity, FlowIntensity::Aggressive, "1500/3000 = 0.5");
        assert_eq!(e.execution_side, ExecutionSide::Ask, "7.00 >= 7.01·0.995");
        assert_eq!(e.kind, OptionKind::Call);
        assert_eq!(e.total_volume, 1500);
    }

    #[test]
    fn premium_identity_holds() {
        let e = build_event(&contract(1500), None, &thresholds(0.0, 1)).unwrap();
        assert!((e.premium_usd - e.volume_delta as f64 * e.last_price * 100.0).abs() < 1e-9);
    }

    #[test]
    fn unchanged_volume_is_zero_flow() {
        let mut prev = FxHashMap::default();
        prev.insert("O:AAPL261219C00200000".to_string(), 1500u64);
        assert!(build_event(&contract(1500), Some(&prev), &thresholds(0.0, 1)).is_none());
    }

    #[test]
    fn delta_is_difference_of_volumes() {
        let mut prev = FxHashMap::default();
        prev.insert("O:AAPL261219C00200000".to_string(), 1000u64);
        let e = build_event(&contract(1500), Some(&prev), &thresholds(0.0, 1)).unwrap();
        assert_eq!(e.volume_delta, 500);
        assert!((e.premium_usd - 500.0 * 7.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn day_rollover_bootstraps_with_cap() {
        // Counter moved backwards: new trading day. Cap engages at 5000.
        let mut prev = FxHashMap::default();
        prev.insert("O:AAPL261219C00200000".to_string(), 50_000u64);
        let e = build_event(&contract(20_000), Some(&prev), &thresholds(0.0, 1)).unwrap();
        assert_eq!(e.volume_delta, 5000);
    }

    #[test]
    fn below_min_volume_delta_is_skipped() {
        let mut prev = FxHashMap::default();
        prev.insert("O:AAPL261219C00200000".to_string(), 1000u64);
        assert!(build_event(&contract(1400), Some(&prev), &thresholds(0.0, 500)).is_none());
    }

    #[test]
    fn below_min_premium_is_skipped() {
        let e = build_event(&contract(1500), None, &thresholds(2_000_000.0, 1));
        assert!(e.is_none());
    }

    #[test]
    fn min_vol_oi_ratio_filters_when_set() {
        let t = FlowThresholds {
            min_premium: 0.0,
            min_volume_delta: 1,
            min_vol_oi_ratio: Some(0.8),
        };
        // 1500/3000 = 0.5 < 0.8
        assert!(build_event(&contract(1500), None, &t).is_none());

        let mut no_oi = contract(1500);
        no_oi.open_interest = 0;
        assert!(
            build_event(&no_oi, None, &t).is_none(),
            "missing OI fails a ratio requirement closed"
        );
    }

    #[test]
    fn contract_without_usable_price_is_skipped() {
        let mut c = contract(1500);
        c.day_close = None;
        c.day_open = None;
        c.day_high = None;
        c.day_low = None;
        c.last_trade_price = None;
        c.bid = None;
        c.ask = None;
        assert!(build_event(&c, None, &thresholds(0.0, 1)).is_none());
    }

    #[test]
    fn zero_open_interest_means_no_ratio_and_normal_intensity() {
        let mut c = contract(1500);
        c.open_interest = 0;
        let e = build_event(&c, None, &thresholds(0.0, 1)).unwrap();
        assert_eq!(e.vol_oi_ratio, None);
        assert_eq!(e.intensity, FlowIntensity::Normal);
    }

    // --- execution side ---

    #[test]
    fn side_at_or_through_ask() {
        assert_eq!(
            execution_side(7.00, Some(6.95), Some(7.01)),
            ExecutionSide::Ask
        );
        assert_eq!(
            execution_side(7.05, Some(6.95), Some(7.01)),
            ExecutionSide::Ask
        );
    }

    #[test]
    fn side_at_or_through_bid() {
        assert_eq!(
            execution_side(6.95, Some(6.95), Some(7.50)),
            ExecutionSide::Bid
        );
        assert_eq!(
            execution_side(6.90, Some(6.95), Some(7.50)),
            ExecutionSide::Bid
        );
    }

    #[test]
    fn side_near_midpoint() {
        assert_eq!(
            execution_side(7.25, Some(7.00), Some(7.50)),
            ExecutionSide::Mid
        );
    }

    #[test]
    fn side_nearest_when_between() {
        // mid = 5.00, 2% band = ±0.10; 5.60 is outside and nearer the ask.
        assert_eq!(
            execution_side(5.60, Some(4.00), Some(6.00)),
            ExecutionSide::Ask
        );
        assert_eq!(
            execution_side(4.40, Some(4.00), Some(6.00)),
            ExecutionSide::Bid
        );
    }

    #[test]
    fn side_unknown_without_quotes() {
        assert_eq!(execution_side(7.00, None, None), ExecutionSide::Unknown);
    }

    // --- intensity bands ---

    #[test]
    fn intensity_bands() {
        assert_eq!(intensity(Some(0.50)), FlowIntensity::Aggressive);
        assert_eq!(intensity(Some(0.49)), FlowIntensity::Strong);
        assert_eq!(intensity(Some(0.20)), FlowIntensity::Strong);
        assert_eq!(intensity(Some(0.19)), FlowIntensity::Moderate);
        assert_eq!(intensity(Some(0.10)), FlowIntensity::Moderate);
        assert_eq!(intensity(Some(0.09)), FlowIntensity::Normal);
        assert_eq!(intensity(None), FlowIntensity::Normal);
    }

    // --- full scans against a scripted provider ---

    fn chain_body(contracts: &[Value]) -> Value {
        json!({"results": contracts, "status": "OK"})
    }

    fn contract_json(volume: f64) -> Value {
        json!({
            "details": {
                "ticker": "O:AAPL261219C00200000",
                "strike_price": 200.0,
                "expiration_date": "2026-12-19",
                "contract_type": "call"
            },
            "day": {"close": 7.0, "open": 6.5, "high": 7.2, "low": 6.4, "volume": volume},
            "last_quote": {"bid": 6.95, "ask": 7.01},
            "last_trade": {"price": 7.0},
            "greeks": {"delta": 0.55},
            "implied_volatility": 0.30,
            "open_interest": 3000.0,
            "underlying_asset": {"price": 198.5}
        })
    }

    fn detector(responses: Vec<Value>) -> (FlowDetector, Arc<VolumeDeltaCache>) {
        let transport = ScriptedTransport::new(responses);
        let client = Arc::new(PolygonClient::new(
            transport,
            Arc::new(TokenBucket::new(1000.0)),
            Arc::new(CircuitBreaker::with_defaults()),
            ClientOptions {
                base_url: "https://api.test".into(),
                api_key: "k".into(),
                retry_attempts: 0,
                retry_delay: Duration::from_millis(1),
            },
        ));
        let volumes = Arc::new(VolumeDeltaCache::new());
        (FlowDetector::new(client, volumes.clone()), volumes)
    }

    #[tokio::test]
    async fn first_scan_emits_golden_sweep() {
        let (det, _) = detector(vec![chain_body(&[contract_json(1500.0)])]);
        let t = thresholds(1_000_000.0, 500);
        let events = det.scan("AAPL", &t).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].volume_delta, 1500);
        assert!((events[0].premium_usd - 1_050_000.0).abs() < 1e-6);
        assert_eq!(events[0].execution_side, ExecutionSide::Ask);
        assert_eq!(events[0].intensity, FlowIntensity::Aggressive);
    }

    #[tokio::test]
    async fn second_scan_of_unchanged_chain_is_empty() {
        // Snapshot TTL serves the identical chain from cache; volumes now
        // match, so no contract shows flow.
        let (det, _) = detector(vec![chain_body(&[contract_json(1500.0)])]);
        let t = thresholds(0.0, 1);
        let first = det.scan("AAPL", &t).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = det.scan("AAPL", &t).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn empty_snapshot_returns_empty_and_keeps_cache() {
        let (det, volumes) = detector(vec![chain_body(&[contract_json(1500.0)])]);
        let t = thresholds(0.0, 1);
        det.scan("AAPL", &t).await.unwrap();
        assert!(volumes.get("AAPL").is_some());

        // Fresh client (separate response cache) serving an empty chain,
        // sharing the same volume cache.
        let transport = ScriptedTransport::new(vec![chain_body(&[])]);
        let client = Arc::new(PolygonClient::new(
            transport,
            Arc::new(TokenBucket::new(1000.0)),
            Arc::new(CircuitBreaker::with_defaults()),
            ClientOptions {
                base_url: "https://api.test".into(),
                api_key: "k".into(),
                retry_attempts: 0,
                retry_delay: Duration::from_millis(1),
            },
        ));
        let det2 = FlowDetector::new(client, volumes.clone());
        let events = det2.scan("AAPL", &t).await.unwrap();
        assert!(events.is_empty());
        assert!(
            volumes.get("AAPL").is_some(),
            "empty snapshot must not erase the baseline"
        );
    }

    #[tokio::test]
    async fn events_sorted_by_premium_descending() {
        let mut small = contract_json(800.0);
        small["details"]["ticker"] = json!("O:AAPL261219P00190000");
        small["details"]["contract_type"] = json!("put");
        small["day"]["close"] = json!(2.0);
        let body = chain_body(&[small, contract_json(1500.0)]);
        let (det, _) = detector(vec![body]);
        let events = det.scan("AAPL", &thresholds(0.0, 1)).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].premium_usd >= events[1].premium_usd);
        assert_eq!(events[0].kind, OptionKind::Call);
    }
}
