//! Typed, rate-limited access to the market-data REST provider.
//!
//! Every operation runs through the same pipeline: sticky-404 skip list →
//! TTL response cache → circuit breaker → token bucket → transport, with
//! exponential backoff on transient failures and server-directed waits on
//! 429. Payloads are validated here so the rest of the scanner never sees a
//! NaN price or a half-parsed contract.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use dashmap::DashSet;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;

use super::cache::ResponseCache;
use super::limiter::{CircuitBreaker, TokenBucket};
use super::transport::Transport;
use crate::engine::types::{Bar, ContractSnapshot, OptionKind, Timeframe};
use crate::error::FetchError;

const PRICE_TTL: Duration = Duration::from_secs(30);
const SNAPSHOT_TTL: Duration = Duration::from_secs(30);
const INTRADAY_AGG_TTL: Duration = Duration::from_secs(60);
const DAILY_AGG_TTL: Duration = Duration::from_secs(900);
const AGG_LIMIT: u32 = 5000;
const CHAIN_PAGE_LIMIT: u32 = 250;
const MAX_CHAIN_PAGES: u32 = 10;
const TRADES_LIMIT: u32 = 1000;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub api_key: String,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

/// An equity trade, used by block-trade detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub ts: DateTime<Utc>,
    pub price: f64,
    pub size: u64,
}

pub struct PolygonClient {
    transport: Arc<dyn Transport>,
    limiter: Arc<TokenBucket>,
    breaker: Arc<CircuitBreaker>,
    cache: ResponseCache,
    skip_list: DashSet<String>,
    opts: ClientOptions,
}

impl PolygonClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: Arc<TokenBucket>,
        breaker: Arc<CircuitBreaker>,
        opts: ClientOptions,
    ) -> Self {
        Self {
            transport,
            limiter,
            breaker,
            cache: ResponseCache::new(),
            skip_list: DashSet::new(),
            opts,
        }
    }

    /// Whether the symbol 404'd earlier in this process.
    pub fn is_skipped(&self, symbol: &str) -> bool {
        self.skip_list.contains(&symbol.to_uppercase())
    }

    fn check_skip(&self, symbol: &str) -> Result<(), FetchError> {
        if self.is_skipped(symbol) {
            Err(FetchError::NotFound(symbol.to_uppercase()))
        } else {
            Ok(())
        }
    }

    pub fn purge_cache(&self) {
        self.cache.purge_expired();
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.opts.retry_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(6));
        let jitter = if base >= 2 {
            rand::rng().random_range(0..base / 2)
        } else {
            0
        };
        Duration::from_millis(exp + jitter)
    }

    /// One validated GET with retries. `ttl` of zero disables caching.
    async fn request(
        &self,
        symbol: &str,
        path: &str,
        params: &[(String, String)],
        ttl: Duration,
    ) -> Result<Value, FetchError> {
        let key = ResponseCache::key(path, params);
        if ttl > Duration::ZERO {
            if let Some(hit) = self.cache.get(&key) {
                return Ok(hit);
            }
        }

        let url = format!("{}{}", self.opts.base_url, path);
        let mut query: Vec<(String, String)> = params.to_vec();
        query.push(("apiKey".into(), self.opts.api_key.clone()));

        let mut attempt: u32 = 0;
        loop {
            self.breaker.check()?;
            self.limiter.acquire().await;

            match self.transport.get(&url, &query).await {
                Err(e) => {
                    if e.counts_toward_breaker() {
                        self.breaker.record_failure();
                    }
                    if e.is_retryable() && attempt < self.opts.retry_attempts {
                        let wait = self.backoff(attempt);
                        tracing::warn!(
                            symbol,
                            path,
                            attempt,
                            wait_ms = wait.as_millis() as u64,
                            error = %e,
                            "transport error, retrying"
                        );
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
                Ok(resp) => match resp.status {
                    200..=299 => {
                        self.breaker.record_success();
                        if ttl > Duration::ZERO {
                            self.cache.put(key, resp.body.clone(), ttl);
                        }
                        return Ok(resp.body);
                    }
                    404 => {
                        // Sticky: never ask the provider about this symbol
                        // again in this process.
                        self.skip_list.insert(symbol.to_uppercase());
                        tracing::info!(symbol, "404 from provider, added to skip list");
                        return Err(FetchError::NotFound(symbol.to_uppercase()));
                    }
                    429 => {
                        if attempt < self.opts.retry_attempts {
                            let wait = resp.retry_after.unwrap_or_else(|| self.backoff(attempt));
                            tracing::warn!(
                                symbol,
                                path,
                                wait_ms = wait.as_millis() as u64,
                                "rate limited, waiting"
                            );
                            tokio::time::sleep(wait).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::RateLimited {
                            retry_after: resp.retry_after,
                        });
                    }
                    s if s >= 500 => {
                        self.breaker.record_failure();
                        if attempt < self.opts.retry_attempts {
                            let wait = self.backoff(attempt);
                            tracing::warn!(symbol, path, status = s, "server error, retrying");
                            tokio::time::sleep(wait).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Status(s));
                    }
                    s => return Err(FetchError::Status(s)),
                },
            }
        }
    }

    // -- stock price --------------------------------------------------------

    /// Current price for a symbol via the snapshot endpoint's fallback
    /// chain: day close, day VWAP, last trade, quote midpoint/bid/ask,
    /// previous-day close/VWAP.
    pub async fn get_stock_price(&self, symbol: &str) -> Result<f64, FetchError> {
        self.check_skip(symbol)?;
        let symbol = symbol.to_uppercase();
        let path = format!("/v2/snapshot/locale/us/markets/stocks/tickers/{symbol}");
        let body = self.request(&symbol, &path, &[], PRICE_TTL).await?;

        let snap: StockSnapshotEnvelope = serde_json::from_value(body)
            .map_err(|e| FetchError::DataValidation(format!("stock snapshot: {e}")))?;
        let t = snap
            .ticker
            .ok_or_else(|| FetchError::DataValidation("stock snapshot missing ticker".into()))?;

        let quote_mid = t.last_quote.as_ref().and_then(|q| {
            match (positive(q.bid), positive(q.ask)) {
                (Some(b), Some(a)) => Some(f64::midpoint(b, a)),
                _ => None,
            }
        });

        let candidates = [
            t.day.as_ref().and_then(|d| positive(d.c)),
            t.day.as_ref().and_then(|d| positive(d.vw)),
            t.last_trade.as_ref().and_then(|lt| positive(lt.p)),
            quote_mid,
            t.last_quote.as_ref().and_then(|q| positive(q.bid)),
            t.last_quote.as_ref().and_then(|q| positive(q.ask)),
            t.prev_day.as_ref().and_then(|d| positive(d.c)),
            t.prev_day.as_ref().and_then(|d| positive(d.vw)),
        ];
        candidates.into_iter().flatten().next().ok_or_else(|| {
            FetchError::DataValidation(format!("no usable price for {symbol}"))
        })
    }

    // -- aggregates ---------------------------------------------------------

    /// OHLCV aggregates. Intraday frames are requested as minute multiples
    /// (60/240/720), never `timespan=hour`.
    pub async fn get_aggregates(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Bar>, FetchError> {
        self.check_skip(symbol)?;
        let symbol = symbol.to_uppercase();
        let (mult, span) = timeframe.aggregate_params();
        let path = format!("/v2/aggs/ticker/{symbol}/range/{mult}/{span}/{from}/{to}");
        let params = vec![
            ("adjusted".to_string(), "true".to_string()),
            ("sort".to_string(), "asc".to_string()),
            ("limit".to_string(), AGG_LIMIT.to_string()),
        ];
        let ttl = if timeframe.is_intraday() {
            INTRADAY_AGG_TTL
        } else {
            DAILY_AGG_TTL
        };
        let body = self.request(&symbol, &path, &params, ttl).await?;

        let envelope: AggsEnvelope = serde_json::from_value(body)
            .map_err(|e| FetchError::DataValidation(format!("aggregates: {e}")))?;
        let results = envelope
            .results
            .ok_or_else(|| FetchError::DataValidation("aggregates missing results".into()))?;

        let mut bars = Vec::with_capacity(results.len());
        for raw in results {
            let start = Utc
                .timestamp_millis_opt(raw.t)
                .single()
                .ok_or_else(|| FetchError::DataValidation("bad bar timestamp".into()))?;
            let bar = Bar {
                start,
                end: start + chrono::Duration::minutes(timeframe.minutes()),
                open: raw.o,
                high: raw.h,
                low: raw.l,
                close: raw.c,
                volume: raw.v,
                vwap: raw.vw.filter(|v| v.is_finite()),
            };
            bar.validate()
                .map_err(|e| FetchError::DataValidation(format!("bar at {start}: {e}")))?;
            bars.push(bar);
        }
        Ok(bars)
    }

    // -- option chain snapshot ---------------------------------------------

    /// Full chain snapshot for an underlying, following pagination.
    /// Malformed individual contracts are skipped; a malformed envelope is
    /// a validation error.
    pub async fn get_option_chain_snapshot(
        &self,
        underlying: &str,
    ) -> Result<Vec<ContractSnapshot>, FetchError> {
        self.check_skip(underlying)?;
        let underlying = underlying.to_uppercase();
        let path = format!("/v3/snapshot/options/{underlying}");
        let base_params = vec![("limit".to_string(), CHAIN_PAGE_LIMIT.to_string())];

        let cache_key = ResponseCache::key(&path, &base_params);
        let combined = if let Some(hit) = self.cache.get(&cache_key) {
            hit
        } else {
            let mut all_results: Vec<Value> = Vec::new();
            let mut cursor: Option<String> = None;
            for _page in 0..MAX_CHAIN_PAGES {
                let mut params = base_params.clone();
                if let Some(c) = &cursor {
                    params.push(("cursor".to_string(), c.clone()));
                }
                let body = self
                    .request(&underlying, &path, &params, Duration::ZERO)
                    .await?;
                let envelope: ChainEnvelope = serde_json::from_value(body)
                    .map_err(|e| FetchError::DataValidation(format!("chain snapshot: {e}")))?;
                let results = envelope.results.ok_or_else(|| {
                    FetchError::DataValidation("chain snapshot missing results".into())
                })?;
                all_results.extend(results);
                cursor = envelope.next_url.as_deref().and_then(extract_cursor);
                if cursor.is_none() {
                    break;
                }
            }
            let combined = Value::Array(all_results);
            self.cache
                .put(cache_key, combined.clone(), SNAPSHOT_TTL);
            combined
        };

        let as_of = Utc::now();
        let raw_contracts = combined
            .as_array()
            .cloned()
            .unwrap_or_default();
        let mut contracts = Vec::with_capacity(raw_contracts.len());
        let mut skipped = 0usize;
        for raw in &raw_contracts {
            match parse_contract(raw, &underlying, as_of) {
                Ok(c) => contracts.push(c),
                Err(reason) => {
                    skipped += 1;
                    tracing::debug!(underlying = %underlying, %reason, "skipping contract");
                }
            }
        }
        if skipped > 0 {
            tracing::debug!(
                underlying = %underlying,
                skipped,
                kept = contracts.len(),
                "chain snapshot had unusable contracts"
            );
        }
        Ok(contracts)
    }

    // -- stock trades -------------------------------------------------------

    /// Recent trades for block detection. Not cached: callers poll with a
    /// moving `since`.
    pub async fn get_stock_trades(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Trade>, FetchError> {
        self.check_skip(symbol)?;
        let symbol = symbol.to_uppercase();
        let path = format!("/v3/trades/{symbol}");
        let nanos = since
            .timestamp_nanos_opt()
            .ok_or_else(|| FetchError::DataValidation("since out of range".into()))?;
        let params = vec![
            ("timestamp.gte".to_string(), nanos.to_string()),
            ("limit".to_string(), TRADES_LIMIT.to_string()),
            ("sort".to_string(), "timestamp".to_string()),
        ];
        let body = self.request(&symbol, &path, &params, Duration::ZERO).await?;

        let envelope: TradesEnvelope = serde_json::from_value(body)
            .map_err(|e| FetchError::DataValidation(format!("trades: {e}")))?;
        let results = envelope.results.unwrap_or_default();
        let mut trades = Vec::with_capacity(results.len());
        for raw in results {
            let Some(price) = positive(raw.price) else {
                continue;
            };
            trades.push(Trade {
                ts: Utc.timestamp_nanos(raw.participant_timestamp),
                price,
                size: raw.size.unwrap_or(0.0).max(0.0) as u64,
            });
        }
        Ok(trades)
    }
}

fn positive(v: Option<f64>) -> Option<f64> {
    v.filter(|p| p.is_finite() && *p > 0.0)
}

fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|p| p.is_finite())
}

/// Pull the pagination cursor out of a provider `next_url`.
fn extract_cursor(next_url: &str) -> Option<String> {
    let (_, query) = next_url.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == "cursor" && !v.is_empty()).then(|| v.to_string())
    })
}

/// Validate and convert one raw chain entry. Errors name the offending
/// field so skip diagnostics stay useful.
fn parse_contract(
    raw: &Value,
    underlying: &str,
    as_of: DateTime<Utc>,
) -> Result<ContractSnapshot, String> {
    let c: RawContract =
        serde_json::from_value(raw.clone()).map_err(|e| format!("deserialize: {e}"))?;

    let details = c.details.ok_or("missing details")?;
    let ticker = details.ticker.ok_or("missing ticker")?;
    let strike = positive(details.strike_price).ok_or("bad strike")?;
    let expiration_str = details.expiration_date.ok_or("missing expiration")?;
    let expiration = NaiveDate::parse_from_str(&expiration_str, "%Y-%m-%d")
        .map_err(|_| format!("bad expiration {expiration_str}"))?;
    if expiration < as_of.date_naive() {
        return Err(format!("expired {expiration}"));
    }

    let kind = details
        .contract_type
        .as_deref()
        .and_then(|t| match t.to_ascii_lowercase().as_str() {
            "call" => Some(OptionKind::Call),
            "put" => Some(OptionKind::Put),
            _ => None,
        });

    let (bid, ask) = match &c.last_quote {
        Some(q) => {
            let bid = q.bid.or(q.bp);
            let ask = q.ask.or(q.ap);
            for v in [bid, ask] {
                if let Some(p) = v {
                    if !p.is_finite() || p < 0.0 {
                        return Err("bad quote price".into());
                    }
                }
            }
            if let (Some(b), Some(a)) = (bid, ask) {
                if b > a && a > 0.0 {
                    return Err(format!("crossed quote {b}/{a}"));
                }
            }
            (bid, ask)
        }
        None => (None, None),
    };

    let day = c.day.as_ref();
    for v in [
        day.and_then(|d| d.c),
        day.and_then(|d| d.o),
        day.and_then(|d| d.h),
        day.and_then(|d| d.l),
    ] {
        if let Some(p) = v {
            if !p.is_finite() || p < 0.0 {
                return Err("bad day price".into());
            }
        }
    }

    let day_volume = day
        .and_then(|d| d.volume)
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(0.0) as u64;
    let open_interest = c
        .open_interest
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(0.0) as u64;

    Ok(ContractSnapshot {
        ticker,
        underlying: underlying.to_string(),
        kind,
        strike,
        expiration,
        day_volume,
        open_interest,
        day_close: day.and_then(|d| positive(d.c)),
        day_open: day.and_then(|d| positive(d.o)),
        day_high: day.and_then(|d| positive(d.h)),
        day_low: day.and_then(|d| positive(d.l)),
        last_trade_price: c.last_trade.as_ref().and_then(|t| positive(t.price)),
        bid: positive(bid),
        ask: positive(ask),
        bid_size: c
            .last_quote
            .as_ref()
            .and_then(|q| q.bid_size)
            .map(|s| s.max(0.0) as u64),
        ask_size: c
            .last_quote
            .as_ref()
            .and_then(|q| q.ask_size)
            .map(|s| s.max(0.0) as u64),
        iv: positive(c.implied_volatility),
        delta: finite(c.greeks.as_ref().and_then(|g| g.delta)),
        gamma: finite(c.greeks.as_ref().and_then(|g| g.gamma)),
        theta: finite(c.greeks.as_ref().and_then(|g| g.theta)),
        vega: finite(c.greeks.as_ref().and_then(|g| g.vega)),
        underlying_price: positive(c.underlying_asset.as_ref().and_then(|u| u.price)),
        as_of,
    })
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StockSnapshotEnvelope {
    ticker: Option<TickerSnapshot>,
}

#[derive(Debug, Deserialize)]
struct TickerSnapshot {
    day: Option<DayAgg>,
    #[serde(rename = "lastTrade")]
    last_trade: Option<LastTrade>,
    #[serde(rename = "lastQuote")]
    last_quote: Option<StockQuote>,
    #[serde(rename = "prevDay")]
    prev_day: Option<DayAgg>,
}

/// Day aggregate; the stock snapshot uses short keys (`c`, `v`), the option
/// chain uses long ones (`close`, `volume`).
#[derive(Debug, Deserialize)]
struct DayAgg {
    #[serde(alias = "close")]
    c: Option<f64>,
    #[serde(alias = "open")]
    o: Option<f64>,
    #[serde(alias = "high")]
    h: Option<f64>,
    #[serde(alias = "low")]
    l: Option<f64>,
    #[serde(alias = "v")]
    volume: Option<f64>,
    #[serde(alias = "vwap")]
    vw: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LastTrade {
    p: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StockQuote {
    #[serde(alias = "bp")]
    bid: Option<f64>,
    #[serde(alias = "ap")]
    ask: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AggsEnvelope {
    results: Option<Vec<RawAggBar>>,
}

#[derive(Debug, Deserialize)]
struct RawAggBar {
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    vw: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChainEnvelope {
    results: Option<Vec<Value>>,
    next_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawContract {
    details: Option<RawDetails>,
    day: Option<DayAgg>,
    last_quote: Option<ContractQuote>,
    last_trade: Option<ContractTrade>,
    greeks: Option<RawGreeks>,
    implied_volatility: Option<f64>,
    open_interest: Option<f64>,
    underlying_asset: Option<RawUnderlying>,
}

#[derive(Debug, Deserialize)]
struct RawDetails {
    ticker: Option<String>,
    strike_price: Option<f64>,
    expiration_date: Option<String>,
    contract_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContractQuote {
    bid: Option<f64>,
    ask: Option<f64>,
    bp: Option<f64>,
    ap: Option<f64>,
    bid_size: Option<f64>,
    ask_size: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ContractTrade {
    price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawGreeks {
    delta: Option<f64>,
    gamma: Option<f64>,
    theta: Option<f64>,
    vega: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawUnderlying {
    price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TradesEnvelope {
    results: Option<Vec<RawTrade>>,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    participant_timestamp: i64,
    price: Option<f64>,
    size: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::transport::HttpResponse;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct FakeTransport {
        responses: Mutex<VecDeque<HttpResponse>>,
        requests: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn new(responses: Vec<HttpResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn ok(body: Value) -> HttpResponse {
            HttpResponse {
                status: 200,
                retry_after: None,
                body,
            }
        }

        fn status(status: u16) -> HttpResponse {
            HttpResponse {
                status,
                retry_after: None,
                body: Value::Null,
            }
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn get(
            &self,
            url: &str,
            _query: &[(String, String)],
        ) -> Result<HttpResponse, FetchError> {
            self.requests.lock().unwrap().push(url.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| FetchError::Transient("no scripted response".into()))
        }
    }

    fn client(transport: Arc<FakeTransport>) -> PolygonClient {
        PolygonClient::new(
            transport,
            Arc::new(TokenBucket::new(1000.0)),
            Arc::new(CircuitBreaker::with_defaults()),
            ClientOptions {
                base_url: "https://api.test".into(),
                api_key: "test-key".into(),
                retry_attempts: 2,
                retry_delay: Duration::from_millis(1),
            },
        )
    }

    fn stock_snapshot_body(day_close: f64) -> Value {
        json!({
            "ticker": {
                "day": {"c": day_close, "o": day_close - 1.0, "h": day_close + 1.0,
                        "l": day_close - 2.0, "v": 1_000_000.0, "vw": day_close - 0.5},
                "lastTrade": {"p": day_close + 0.1},
                "lastQuote": {"bp": day_close - 0.2, "ap": day_close + 0.2},
                "prevDay": {"c": day_close - 3.0}
            },
            "status": "OK"
        })
    }

    #[tokio::test]
    async fn stock_price_uses_day_close_first() {
        let transport = FakeTransport::new(vec![FakeTransport::ok(stock_snapshot_body(198.5))]);
        let c = client(transport);
        let price = c.get_stock_price("aapl").await.unwrap();
        assert!((price - 198.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn stock_price_falls_back_when_day_missing() {
        let body = json!({
            "ticker": {
                "lastQuote": {"bp": 10.0, "ap": 10.4},
            },
            "status": "OK"
        });
        let transport = FakeTransport::new(vec![FakeTransport::ok(body)]);
        let c = client(transport);
        let price = c.get_stock_price("AAPL").await.unwrap();
        assert!((price - 10.2).abs() < 1e-12, "quote midpoint, got {price}");
    }

    #[tokio::test]
    async fn four_oh_four_is_sticky_and_issues_one_request() {
        let transport = FakeTransport::new(vec![FakeTransport::status(404)]);
        let c = client(transport.clone());

        let first = c.get_stock_price("ZZZZ").await;
        assert!(matches!(first, Err(FetchError::NotFound(_))));

        let second = c.get_stock_price("ZZZZ").await;
        assert!(matches!(second, Err(FetchError::NotFound(_))));
        let third = c
            .get_aggregates(
                "ZZZZ",
                Timeframe::H1,
                NaiveDate::from_ymd_opt(2025, 10, 20).unwrap(),
                NaiveDate::from_ymd_opt(2025, 10, 22).unwrap(),
            )
            .await;
        assert!(matches!(third, Err(FetchError::NotFound(_))));

        assert_eq!(transport.request_count(), 1, "exactly one HTTP request");
    }

    #[tokio::test]
    async fn transient_500_is_retried_then_succeeds() {
        let transport = FakeTransport::new(vec![
            FakeTransport::status(502),
            FakeTransport::ok(stock_snapshot_body(100.0)),
        ]);
        let c = client(transport.clone());
        let price = c.get_stock_price("SPY").await.unwrap();
        assert!((price - 100.0).abs() < 1e-12);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn rate_limit_waits_and_retries_without_tripping_breaker() {
        let retry_after = HttpResponse {
            status: 429,
            retry_after: Some(Duration::from_millis(1)),
            body: Value::Null,
        };
        let transport = FakeTransport::new(vec![
            retry_after,
            FakeTransport::ok(stock_snapshot_body(50.0)),
        ]);
        let breaker = Arc::new(CircuitBreaker::new(
            1,
            Duration::from_secs(30),
            Duration::from_secs(60),
        ));
        let c = PolygonClient::new(
            transport,
            Arc::new(TokenBucket::new(1000.0)),
            breaker.clone(),
            ClientOptions {
                base_url: "https://api.test".into(),
                api_key: "k".into(),
                retry_attempts: 2,
                retry_delay: Duration::from_millis(1),
            },
        );
        let price = c.get_stock_price("SPY").await.unwrap();
        assert!((price - 50.0).abs() < 1e-12);
        // A threshold-1 breaker would be open had the 429 counted.
        assert!(breaker.check().is_ok());
    }

    #[tokio::test]
    async fn repeated_server_errors_open_the_circuit() {
        let responses: Vec<HttpResponse> = (0..5).map(|_| FakeTransport::status(503)).collect();
        let transport = FakeTransport::new(responses);
        let c = PolygonClient::new(
            transport.clone(),
            Arc::new(TokenBucket::new(1000.0)),
            Arc::new(CircuitBreaker::with_defaults()),
            ClientOptions {
                base_url: "https://api.test".into(),
                api_key: "k".into(),
                retry_attempts: 4,
                retry_delay: Duration::from_millis(1),
            },
        );
        let result = c.get_stock_price("SPY").await;
        assert!(matches!(result, Err(FetchError::Status(503))));

        // Circuit is now open: the next call fails fast with no request.
        let before = transport.request_count();
        let next = c.get_stock_price("QQQ").await;
        assert!(matches!(next, Err(FetchError::CircuitOpen)));
        assert_eq!(transport.request_count(), before);
    }

    #[tokio::test]
    async fn price_cache_serves_second_call_without_io() {
        let transport = FakeTransport::new(vec![FakeTransport::ok(stock_snapshot_body(75.0))]);
        let c = client(transport.clone());
        let a = c.get_stock_price("SPY").await.unwrap();
        let b = c.get_stock_price("SPY").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(transport.request_count(), 1);
    }

    fn agg_body(bars: &[(i64, f64, f64, f64, f64)]) -> Value {
        let results: Vec<Value> = bars
            .iter()
            .map(|(t, o, h, l, c)| json!({"t": t, "o": o, "h": h, "l": l, "c": c, "v": 1000.0}))
            .collect();
        json!({"results": results, "resultsCount": results.len(), "status": "OK"})
    }

    #[tokio::test]
    async fn aggregates_parse_and_carry_timeframe_span() {
        let t0 = 1_760_000_000_000i64;
        let transport = FakeTransport::new(vec![FakeTransport::ok(agg_body(&[(
            t0, 100.0, 101.0, 99.0, 100.5,
        )]))]);
        let c = client(transport);
        let bars = c
            .get_aggregates(
                "SPY",
                Timeframe::H4,
                NaiveDate::from_ymd_opt(2025, 10, 20).unwrap(),
                NaiveDate::from_ymd_opt(2025, 10, 22).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(
            bars[0].end - bars[0].start,
            chrono::Duration::minutes(240)
        );
    }

    #[tokio::test]
    async fn aggregates_reject_invalid_prices() {
        let t0 = 1_760_000_000_000i64;
        // high below low
        let transport = FakeTransport::new(vec![FakeTransport::ok(agg_body(&[(
            t0, 100.0, 99.0, 101.0, 100.5,
        )]))]);
        let c = client(transport);
        let result = c
            .get_aggregates(
                "SPY",
                Timeframe::H1,
                NaiveDate::from_ymd_opt(2025, 10, 20).unwrap(),
                NaiveDate::from_ymd_opt(2025, 10, 22).unwrap(),
            )
            .await;
        assert!(matches!(result, Err(FetchError::DataValidation(_))));
    }

    #[tokio::test]
    async fn aggregates_missing_results_is_validation_error() {
        let transport = FakeTransport::new(vec![FakeTransport::ok(json!({"status": "OK"}))]);
        let c = client(transport);
        let result = c
            .get_aggregates(
                "SPY",
                Timeframe::H1,
                NaiveDate::from_ymd_opt(2025, 10, 20).unwrap(),
                NaiveDate::from_ymd_opt(2025, 10, 22).unwrap(),
            )
            .await;
        assert!(matches!(result, Err(FetchError::DataValidation(_))));
    }

    fn contract_json() -> Value {
        json!({
            "details": {
                "ticker": "O:AAPL261219C00200000",
                "strike_price": 200.0,
                "expiration_date": "2026-12-19",
                "contract_type": "call"
            },
            "day": {"c": 7.0, "o": 6.5, "h": 7.2, "l": 6.4, "v": 1500.0},
            "last_quote": {"bid": 6.95, "ask": 7.01, "bid_size": 25.0, "ask_size": 40.0},
            "last_trade": {"price": 7.0},
            "greeks": {"delta": 0.55, "gamma": 0.01, "theta": -0.05, "vega": 0.12},
            "implied_volatility": 0.30,
            "open_interest": 3000.0,
            "underlying_asset": {"price": 198.5}
        })
    }

    #[tokio::test]
    async fn chain_snapshot_parses_contracts_and_skips_malformed() {
        let body = json!({
            "results": [
                contract_json(),
                {"details": {"ticker": "O:BAD", "strike_price": -5.0,
                             "expiration_date": "2026-12-19"}},
                {"day": {"c": 1.0}}
            ],
            "status": "OK"
        });
        let transport = FakeTransport::new(vec![FakeTransport::ok(body)]);
        let c = client(transport);
        let contracts = c.get_option_chain_snapshot("AAPL").await.unwrap();
        assert_eq!(contracts.len(), 1);
        let k = &contracts[0];
        assert_eq!(k.ticker, "O:AAPL261219C00200000");
        assert_eq!(k.kind, Some(OptionKind::Call));
        assert_eq!(k.day_volume, 1500);
        assert_eq!(k.open_interest, 3000);
        assert_eq!(k.bid, Some(6.95));
        assert_eq!(k.ask, Some(7.01));
        assert_eq!(k.delta, Some(0.55));
        assert_eq!(k.underlying_price, Some(198.5));
    }

    #[tokio::test]
    async fn chain_snapshot_rejects_crossed_quotes_per_contract() {
        let mut crossed = contract_json();
        crossed["last_quote"] = json!({"bid": 7.5, "ask": 7.0});
        let body = json!({"results": [crossed], "status": "OK"});
        let transport = FakeTransport::new(vec![FakeTransport::ok(body)]);
        let c = client(transport);
        let contracts = c.get_option_chain_snapshot("AAPL").await.unwrap();
        assert!(contracts.is_empty());
    }

    #[tokio::test]
    async fn chain_snapshot_follows_pagination() {
        let page1 = json!({
            "results": [contract_json()],
            "next_url": "https://api.test/v3/snapshot/options/AAPL?cursor=abc123",
            "status": "OK"
        });
        let mut second = contract_json();
        second["details"]["ticker"] = json!("O:AAPL261219P00190000");
        second["details"]["contract_type"] = json!("put");
        let page2 = json!({"results": [second], "status": "OK"});
        let transport =
            FakeTransport::new(vec![FakeTransport::ok(page1), FakeTransport::ok(page2)]);
        let c = client(transport.clone());
        let contracts = c.get_option_chain_snapshot("AAPL").await.unwrap();
        assert_eq!(contracts.len(), 2);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn trades_parse_with_since_filter_applied_by_provider() {
        let body = json!({
            "results": [
                {"participant_timestamp": 1_760_000_000_000_000_000i64,
                 "price": 198.5, "size": 12000.0},
                {"participant_timestamp": 1_760_000_001_000_000_000i64,
                 "price": 0.0, "size": 100.0}
            ],
            "status": "OK"
        });
        let transport = FakeTransport::new(vec![FakeTransport::ok(body)]);
        let c = client(transport);
        let trades = c
            .get_stock_trades("AAPL", Utc.timestamp_nanos(1_759_999_999_000_000_000))
            .await
            .unwrap();
        assert_eq!(trades.len(), 1, "zero-price trade dropped");
        assert_eq!(trades[0].size, 12000);
    }

    #[test]
    fn extract_cursor_finds_param() {
        assert_eq!(
            extract_cursor("https://x/v3?limit=250&cursor=abc"),
            Some("abc".to_string())
        );
        assert_eq!(extract_cursor("https://x/v3?limit=250"), None);
        assert_eq!(extract_cursor("no-query"), None);
    }
}
