//! Scanner workers: one long-lived loop per strategy.
//!
//! A worker fans its watchlist out under a concurrency cap, isolates
//! per-symbol failures, posts surviving signals to its webhook, and records
//! metrics. It backs off exponentially on cycle failures (capped at five
//! minutes), marks itself degraded after too many consecutive failures, and
//! never exits on its own — only cancellation stops it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::strategy::{active_window, current_interval, StrategyKind};
use crate::alerts::dedup::{CooldownKey, DedupStore};
use crate::alerts::embed::{flow_payload, pattern_payload, WebhookPayload};
use crate::alerts::webhook::AlertSink;
use crate::data::polygon::PolygonClient;
use crate::data::store::SignalStore;
use crate::engine::bars::{retain_aligned, to_eastern, trading_date_et};
use crate::engine::confidence::confidence;
use crate::engine::filters::{FilterCascade, FilterOutcome, SkipReason};
use crate::engine::flow::{FlowDetector, FlowThresholds};
use crate::engine::scoring::institutional_score;
use crate::engine::strat::{
    classify, detect_miyagi, detect_three_two_two, detect_two_two, in_alert_window, Detection,
};
use crate::engine::types::{Bar, PatternKind, PatternSignal, Timeframe};
use crate::error::FetchError;

const DURATION_RING: usize = 100;
const SKIP_RING: usize = 200;
const UNHEALTHY_THRESHOLD: u32 = 25;
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const IDLE_NAP_CAP: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Starting,
    Healthy,
    Degraded,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkipRecord {
    pub symbol: String,
    pub filter: String,
    pub detail: String,
}

/// Counters plus bounded rings of recent scan durations and skip reasons.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub scans: u64,
    pub signals: u64,
    pub errors: u64,
    pub webhook_ok: u64,
    pub webhook_failed: u64,
    pub consecutive_failures: u32,
    durations: VecDeque<Duration>,
    skips: VecDeque<SkipRecord>,
}

impl WorkerMetrics {
    fn record_duration(&mut self, d: Duration) {
        if self.durations.len() == DURATION_RING {
            self.durations.pop_front();
        }
        self.durations.push_back(d);
    }

    fn record_skip(&mut self, symbol: &str, reason: &SkipReason) {
        if self.skips.len() == SKIP_RING {
            self.skips.pop_front();
        }
        self.skips.push_back(SkipRecord {
            symbol: symbol.to_string(),
            filter: reason.filter.to_string(),
            detail: reason.detail.clone(),
        });
    }

    pub fn avg_scan_ms(&self) -> Option<u64> {
        if self.durations.is_empty() {
            return None;
        }
        let total: Duration = self.durations.iter().sum();
        Some((total / self.durations.len() as u32).as_millis() as u64)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            scans: self.scans,
            signals: self.signals,
            errors: self.errors,
            webhook_ok: self.webhook_ok,
            webhook_failed: self.webhook_failed,
            consecutive_failures: self.consecutive_failures,
            avg_scan_ms: self.avg_scan_ms(),
            recent_skips: self.skips.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub scans: u64,
    pub signals: u64,
    pub errors: u64,
    pub webhook_ok: u64,
    pub webhook_failed: u64,
    pub consecutive_failures: u32,
    pub avg_scan_ms: Option<u64>,
    pub recent_skips: usize,
}

// ---------------------------------------------------------------------------
// Scanners
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    pub symbols_scanned: u64,
    pub signals: u64,
    pub alerts_sent: u64,
    pub errors: u64,
}

pub struct SymbolOutcome {
    pub payloads: Vec<WebhookPayload>,
    pub skips: Vec<SkipReason>,
}

/// A strategy's per-symbol scan. `now` is injected so window gating and
/// trading-date math are testable.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn begin_cycle(&self) -> Option<String> {
        None
    }

    async fn scan_symbol(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<SymbolOutcome, FetchError>;

    async fn end_cycle(&self, _job_id: Option<String>, _stats: CycleStats) {}
}

/// Flow strategies: detector → cascade → cooldown dedup → score → embed.
pub struct FlowScanner {
    kind: StrategyKind,
    detector: Arc<FlowDetector>,
    cascade: FilterCascade,
    thresholds: FlowThresholds,
    dedup: Arc<DedupStore>,
}

impl FlowScanner {
    pub fn new(
        kind: StrategyKind,
        detector: Arc<FlowDetector>,
        cascade: FilterCascade,
        thresholds: FlowThresholds,
        dedup: Arc<DedupStore>,
    ) -> Self {
        Self {
            kind,
            detector,
            cascade,
            thresholds,
            dedup,
        }
    }
}

#[async_trait]
impl Scanner for FlowScanner {
    async fn scan_symbol(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<SymbolOutcome, FetchError> {
        let events = self.detector.scan(symbol, &self.thresholds).await?;
        let today = trading_date_et(now);
        let mut payloads = Vec::new();
        let mut skips = Vec::new();
        for e in events {
            match self.cascade.evaluate(&e, today) {
                FilterOutcome::Skip(reason) => skips.push(reason),
                FilterOutcome::Keep => {
                    let key = CooldownKey::from_event(&e);
                    if !self.dedup.try_claim_flow(key.clone()) {
                        continue;
                    }
                    let repeat = self.dedup.recent_flow_hits(&e.underlying, &key);
                    let score = institutional_score(&e, today, repeat);
                    payloads.push(flow_payload(self.kind.bot_name(), &e, &score, today));
                }
            }
        }
        Ok(SymbolOutcome { payloads, skips })
    }
}

/// STRAT strategy: fetch aligned bars per timeframe (only when a pattern's
/// alert window is live), persist, detect, score, dedup, embed.
pub struct StratScanner {
    client: Arc<PolygonClient>,
    dedup: Arc<DedupStore>,
    store: Option<Arc<SignalStore>>,
}

impl StratScanner {
    pub fn new(
        client: Arc<PolygonClient>,
        dedup: Arc<DedupStore>,
        store: Option<Arc<SignalStore>>,
    ) -> Self {
        Self {
            client,
            dedup,
            store,
        }
    }

    async fn series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> Result<Vec<Bar>, FetchError> {
        let today = trading_date_et(now);
        let lookback_days = match timeframe {
            Timeframe::H1 => 4,
            Timeframe::H4 => 7,
            Timeframe::H12 => 12,
            Timeframe::D1 => 40,
        };
        let from = today - chrono::Duration::days(lookback_days);
        let bars = self.client.get_aggregates(symbol, timeframe, from, today).await?;
        Ok(retain_aligned(bars, timeframe, symbol))
    }

    /// Best-effort persistence of the series and its classifications;
    /// storage trouble never blocks detection.
    fn persist_series(&self, symbol: &str, timeframe: Timeframe, bars: &[Bar]) {
        let Some(store) = &self.store else { return };
        let mut prev: Option<(i64, &Bar)> = None;
        for bar in bars {
            match store.upsert_bar(symbol, timeframe, bar) {
                Ok(id) => {
                    if let Some((prev_id, prev_bar)) = prev {
                        let bar_type = classify(bar, prev_bar);
                        if let Err(e) = store.record_classification(id, bar_type, Some(prev_id)) {
                            tracing::warn!(symbol, error = %e, "classification persist failed");
                        }
                    }
                    prev = Some((id, bar));
                }
                Err(e) => {
                    tracing::warn!(symbol, error = %e, "bar persist failed");
                    prev = None;
                }
            }
        }
    }

    fn emit(
        &self,
        symbol: &str,
        det: Detection,
        bars: &[Bar],
        now: DateTime<Utc>,
        payloads: &mut Vec<WebhookPayload>,
    ) -> bool {
        let timeframe = det.pattern.timeframe();
        let ref_count = match det.pattern {
            PatternKind::ThreeTwoTwo => 3,
            PatternKind::TwoTwo => 2,
            PatternKind::Miyagi => 4,
        };
        let take = ref_count.min(bars.len());
        let reference: Vec<&Bar> = bars[bars.len() - take..].iter().collect();
        let conf = confidence(bars, det.direction, &reference);

        let signal = PatternSignal {
            symbol: symbol.to_string(),
            pattern: det.pattern,
            timeframe,
            completion_bar_start: det.completion_bar_start,
            direction: det.direction,
            entry: det.entry,
            stop: det.stop,
            target: det.target,
            confidence: conf,
            meta: det.meta,
        };

        let date_et = trading_date_et(now);
        let key = signal.dedup_key(date_et);
        if !self.dedup.try_claim_pattern(&key, date_et) {
            return false;
        }

        let payload = pattern_payload(StrategyKind::Strat.bot_name(), &signal);
        if let Some(store) = &self.store {
            let payload_json = serde_json::to_string(&payload).unwrap_or_default();
            match store.insert_pattern(&signal) {
                Ok(pattern_id) => {
                    if let Err(e) =
                        store.insert_alert(Some(pattern_id), &signal, &key, &payload_json, now)
                    {
                        tracing::warn!(symbol, error = %e, "alert persist failed");
                    }
                }
                Err(e) => tracing::warn!(symbol, error = %e, "pattern persist failed"),
            }
        }
        payloads.push(payload);
        true
    }
}

#[async_trait]
impl Scanner for StratScanner {
    async fn begin_cycle(&self) -> Option<String> {
        let store = self.store.as_ref()?;
        match store.start_job_run("strat_scan") {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "job run start failed");
                None
            }
        }
    }

    async fn scan_symbol(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<SymbolOutcome, FetchError> {
        let now_et = to_eastern(now);
        let date = now_et.date_naive();
        let mut payloads = Vec::new();

        if in_alert_window(PatternKind::ThreeTwoTwo, now_et) {
            let bars = self.series(symbol, Timeframe::H1, now).await?;
            self.persist_series(symbol, Timeframe::H1, &bars);
            if let Some(det) = detect_three_two_two(&bars, date) {
                self.emit(symbol, det, &bars, now, &mut payloads);
            }
        }
        if in_alert_window(PatternKind::TwoTwo, now_et) {
            let bars = self.series(symbol, Timeframe::H4, now).await?;
            self.persist_series(symbol, Timeframe::H4, &bars);
            if let Some(det) = detect_two_two(&bars, date) {
                self.emit(symbol, det, &bars, now, &mut payloads);
            }
        }
        if in_alert_window(PatternKind::Miyagi, now_et) {
            let bars = self.series(symbol, Timeframe::H12, now).await?;
            self.persist_series(symbol, Timeframe::H12, &bars);
            if let Some(det) = detect_miyagi(&bars) {
                self.emit(symbol, det, &bars, now, &mut payloads);
            }
        }

        Ok(SymbolOutcome {
            payloads,
            skips: Vec::new(),
        })
    }

    async fn end_cycle(&self, job_id: Option<String>, stats: CycleStats) {
        let (Some(store), Some(id)) = (self.store.as_ref(), job_id) else {
            return;
        };
        let status = if stats.errors == 0 {
            "completed"
        } else {
            "completed_with_errors"
        };
        let errors_json = (stats.errors > 0)
            .then(|| serde_json::json!({"symbol_errors": stats.errors}).to_string());
        if let Err(e) = store.finish_job_run(
            &id,
            stats.symbols_scanned,
            stats.signals,
            stats.alerts_sent,
            errors_json.as_deref(),
            status,
        ) {
            tracing::warn!(error = %e, "job run finish failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

pub struct Worker {
    name: String,
    kind: StrategyKind,
    watchlist: Vec<String>,
    base_interval: Duration,
    concurrency: usize,
    scanner: Arc<dyn Scanner>,
    sink: Arc<dyn AlertSink>,
    metrics: Arc<Mutex<WorkerMetrics>>,
    health: Arc<Mutex<HealthState>>,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        kind: StrategyKind,
        watchlist: Vec<String>,
        base_interval: Duration,
        concurrency: usize,
        scanner: Arc<dyn Scanner>,
        sink: Arc<dyn AlertSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: kind.bot_name().to_lowercase(),
            kind,
            watchlist,
            base_interval,
            concurrency: concurrency.max(1),
            scanner,
            sink,
            metrics: Arc::new(Mutex::new(WorkerMetrics::default())),
            health: Arc::new(Mutex::new(HealthState::Starting)),
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics_handle(&self) -> Arc<Mutex<WorkerMetrics>> {
        self.metrics.clone()
    }

    pub fn health_handle(&self) -> Arc<Mutex<HealthState>> {
        self.health.clone()
    }

    fn set_health(&self, state: HealthState) {
        *self.health.lock().expect("health lock poisoned") = state;
    }

    /// Cancellable sleep; `false` means the worker should stop.
    async fn idle(&self, d: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(d) => true,
        }
    }

    pub async fn run(self) {
        self.set_health(HealthState::Starting);
        tracing::info!(
            worker = %self.name,
            symbols = self.watchlist.len(),
            interval_secs = self.base_interval.as_secs(),
            "worker started"
        );
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let now_et = to_eastern(Utc::now());
            if !active_window(self.kind).contains(now_et) {
                if !self.idle(self.base_interval.min(IDLE_NAP_CAP)).await {
                    break;
                }
                continue;
            }

            let started = Instant::now();
            let result = self.run_cycle().await;
            let elapsed = started.elapsed();

            let consecutive = {
                let mut m = self.metrics.lock().expect("metrics lock poisoned");
                m.scans += 1;
                m.record_duration(elapsed);
                match &result {
                    Ok(_) => m.consecutive_failures = 0,
                    Err(_) => {
                        m.errors += 1;
                        m.consecutive_failures += 1;
                    }
                }
                m.consecutive_failures
            };

            match result {
                Ok(stats) => {
                    self.set_health(HealthState::Healthy);
                    tracing::debug!(
                        worker = %self.name,
                        scanned = stats.symbols_scanned,
                        signals = stats.signals,
                        alerts = stats.alerts_sent,
                        ms = elapsed.as_millis() as u64,
                        "scan cycle complete"
                    );
                }
                Err(e) => {
                    if consecutive >= UNHEALTHY_THRESHOLD {
                        self.set_health(HealthState::Degraded);
                    }
                    tracing::warn!(
                        worker = %self.name,
                        error = %e,
                        consecutive,
                        "scan cycle failed"
                    );
                    if !self.idle(backoff_for(consecutive, self.base_interval)).await {
                        break;
                    }
                    continue;
                }
            }

            let interval = current_interval(self.kind, self.base_interval, to_eastern(Utc::now()));
            if !self.idle(interval.saturating_sub(elapsed)).await {
                break;
            }
        }
        self.set_health(HealthState::Stopped);
        tracing::info!(worker = %self.name, "worker stopped");
    }

    pub(crate) async fn run_cycle(&self) -> Result<CycleStats, FetchError> {
        let job_id = self.scanner.begin_cycle().await;
        let now = Utc::now();

        let batches = self.watchlist.len().div_ceil(self.concurrency);
        let deadline =
            Duration::from_secs(batches as u64 * 30 + 60).max(Duration::from_secs(300));

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let scans = self.watchlist.iter().map(|symbol| {
            let semaphore = semaphore.clone();
            let scanner = self.scanner.clone();
            let cancel = self.cancel.clone();
            let symbol = symbol.clone();
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return (symbol, None);
                };
                if cancel.is_cancelled() {
                    return (symbol, None);
                }
                let result = scanner.scan_symbol(&symbol, now).await;
                (symbol, Some(result))
            }
        });

        let results = match tokio::time::timeout(deadline, join_all(scans)).await {
            Ok(results) => results,
            Err(_) => {
                self.scanner.end_cycle(job_id, CycleStats::default()).await;
                return Err(FetchError::Transient("scan cycle deadline exceeded".into()));
            }
        };

        let mut stats = CycleStats::default();
        let mut payloads: Vec<WebhookPayload> = Vec::new();
        let mut failed = 0usize;
        let mut last_error: Option<FetchError> = None;

        for (symbol, result) in results {
            match result {
                None => {}
                Some(Ok(outcome)) => {
                    stats.symbols_scanned += 1;
                    stats.signals += outcome.payloads.len() as u64;
                    if !outcome.skips.is_empty() {
                        let mut m = self.metrics.lock().expect("metrics lock poisoned");
                        for reason in &outcome.skips {
                            m.record_skip(&symbol, reason);
                        }
                    }
                    payloads.extend(outcome.payloads);
                }
                Some(Err(e)) => {
                    stats.symbols_scanned += 1;
                    stats.errors += 1;
                    failed += 1;
                    if matches!(e, FetchError::NotFound(_)) {
                        tracing::debug!(worker = %self.name, symbol, "symbol not found, skipped");
                    } else {
                        tracing::warn!(worker = %self.name, symbol, error = %e, "symbol scan failed");
                    }
                    last_error = Some(e);
                }
            }
        }

        for payload in &payloads {
            match self.sink.post(payload).await {
                Ok(()) => {
                    stats.alerts_sent += 1;
                    self.metrics.lock().expect("metrics lock poisoned").webhook_ok += 1;
                }
                Err(e) => {
                    self.metrics
                        .lock()
                        .expect("metrics lock poisoned")
                        .webhook_failed += 1;
                    tracing::warn!(worker = %self.name, error = %e, "webhook post failed");
                }
            }
        }
        self.metrics.lock().expect("metrics lock poisoned").signals += stats.signals;

        self.scanner.end_cycle(job_id, stats).await;

        if failed > 0 && failed == self.watchlist.len() {
            return Err(
                last_error.unwrap_or_else(|| FetchError::Transient("all symbols failed".into()))
            );
        }
        Ok(stats)
    }
}

fn backoff_for(consecutive: u32, base: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(consecutive.min(6)))
        .min(MAX_BACKOFF)
}
