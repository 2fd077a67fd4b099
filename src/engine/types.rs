//! Domain model: bars, contracts, flow events, pattern signals.
//!
//! Everything crossing a component boundary is a strongly-typed record;
//! validation happens once at the provider boundary so downstream code never
//! sees NaN, negative prices, or half-filled payloads.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionKind {
    Call,
    Put,
}

impl OptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OptionKind::Call => "CALL",
            OptionKind::Put => "PUT",
        }
    }
}

impl std::fmt::Display for OptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionSide {
    Ask,
    Bid,
    Mid,
    Unknown,
}

impl ExecutionSide {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionSide::Ask => "ASK",
            ExecutionSide::Bid => "BID",
            ExecutionSide::Mid => "MID",
            ExecutionSide::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlowIntensity {
    Normal,
    Moderate,
    Strong,
    Aggressive,
}

impl FlowIntensity {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowIntensity::Normal => "NORMAL",
            FlowIntensity::Moderate => "MODERATE",
            FlowIntensity::Strong => "STRONG",
            FlowIntensity::Aggressive => "AGGRESSIVE",
        }
    }
}

/// Aggregation timeframes the scanner requests. Intraday frames are always
/// fetched as minute multiples so the provider cannot hand back
/// hour-boundary bars that disagree with ET session alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    H1,
    H4,
    H12,
    D1,
}

impl Timeframe {
    /// `(multiplier, timespan)` for the aggregates endpoint.
    pub fn aggregate_params(self) -> (u32, &'static str) {
        match self {
            Timeframe::H1 => (60, "minute"),
            Timeframe::H4 => (240, "minute"),
            Timeframe::H12 => (720, "minute"),
            Timeframe::D1 => (1, "day"),
        }
    }

    pub fn minutes(self) -> i64 {
        match self {
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::H12 => 720,
            Timeframe::D1 => 1440,
        }
    }

    pub fn is_intraday(self) -> bool {
        !matches!(self, Timeframe::D1)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::H1 => "60m",
            Timeframe::H4 => "4h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// STRAT classification of a bar relative to its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarType {
    One,
    TwoUp,
    TwoDown,
    Three,
}

impl BarType {
    pub fn as_str(self) -> &'static str {
        match self {
            BarType::One => "1",
            BarType::TwoUp => "2U",
            BarType::TwoDown => "2D",
            BarType::Three => "3",
        }
    }

    pub fn is_directional(self) -> bool {
        matches!(self, BarType::TwoUp | BarType::TwoDown)
    }
}

impl std::fmt::Display for BarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternKind {
    ThreeTwoTwo,
    TwoTwo,
    Miyagi,
}

impl PatternKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternKind::ThreeTwoTwo => "3-2-2",
            PatternKind::TwoTwo => "2-2",
            PatternKind::Miyagi => "1-3-1",
        }
    }

    pub fn timeframe(self) -> Timeframe {
        match self {
            PatternKind::ThreeTwoTwo => Timeframe::H1,
            PatternKind::TwoTwo => Timeframe::H4,
            PatternKind::Miyagi => Timeframe::H12,
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One OHLCV bar, half-open interval `[start, end)` in UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: Option<f64>,
}

impl Bar {
    /// Structural invariants; violating bars are rejected at the provider
    /// boundary rather than propagated.
    pub fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("volume", self.volume),
        ] {
            if !v.is_finite() {
                return Err(format!("{name} is not finite"));
            }
        }
        if self.low < 0.0 {
            return Err("low is negative".into());
        }
        if self.high < self.low {
            return Err("high below low".into());
        }
        if self.open < self.low || self.open > self.high {
            return Err("open outside [low, high]".into());
        }
        if self.close < self.low || self.close > self.high {
            return Err("close outside [low, high]".into());
        }
        if self.volume < 0.0 {
            return Err("volume is negative".into());
        }
        if self.end <= self.start {
            return Err("end not after start".into());
        }
        Ok(())
    }

    /// |close − open| relative to range, used by the confidence model.
    pub fn body_ratio(&self) -> Option<f64> {
        let range = self.high - self.low;
        if range > 0.0 {
            Some((self.close - self.open).abs() / range)
        } else {
            None
        }
    }
}

/// One option contract from a chain snapshot, raw enough to run the price
/// fallback chain but already numerically validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSnapshot {
    pub ticker: String,
    pub underlying: String,
    /// Explicit `contract_type` when the provider sent one.
    pub kind: Option<OptionKind>,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub day_volume: u64,
    pub open_interest: u64,
    pub day_close: Option<f64>,
    pub day_open: Option<f64>,
    pub day_high: Option<f64>,
    pub day_low: Option<f64>,
    pub last_trade_price: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub bid_size: Option<u64>,
    pub ask_size: Option<u64>,
    pub iv: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub underlying_price: Option<f64>,
    pub as_of: DateTime<Utc>,
}

fn usable(price: Option<f64>) -> Option<f64> {
    price.filter(|p| p.is_finite() && *p > 0.0)
}

impl ContractSnapshot {
    /// Robust reference price: day close, then last trade, then quote
    /// midpoint, then bid, ask, and finally the day's open/high/low.
    pub fn reference_price(&self) -> Option<f64> {
        usable(self.day_close)
            .or_else(|| usable(self.last_trade_price))
            .or_else(|| match (usable(self.bid), usable(self.ask)) {
                (Some(b), Some(a)) => Some(f64::midpoint(b, a)),
                _ => None,
            })
            .or_else(|| usable(self.bid))
            .or_else(|| usable(self.ask))
            .or_else(|| usable(self.day_open))
            .or_else(|| usable(self.day_high))
            .or_else(|| usable(self.day_low))
    }

    /// Explicit contract type wins; otherwise the OCC ticker marker decides,
    /// and anything unparseable is treated as a put.
    pub fn resolve_kind(&self) -> OptionKind {
        if let Some(kind) = self.kind {
            return kind;
        }
        match occ_kind(&self.ticker) {
            Some(OptionKind::Call) => OptionKind::Call,
            _ => OptionKind::Put,
        }
    }
}

/// Parse the C/P marker out of an OCC-style ticker such as
/// `O:AAPL261219C00200000` (the marker sits before the 8-digit strike).
pub fn occ_kind(ticker: &str) -> Option<OptionKind> {
    let bytes = ticker.as_bytes();
    if bytes.len() < 9 {
        return None;
    }
    let strike = &bytes[bytes.len() - 8..];
    if !strike.iter().all(u8::is_ascii_digit) {
        return None;
    }
    match bytes[bytes.len() - 9] {
        b'C' => Some(OptionKind::Call),
        b'P' => Some(OptionKind::Put),
        _ => None,
    }
}

/// One detected flow event; produced fresh every scan, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub contract_ticker: String,
    pub underlying: String,
    pub kind: OptionKind,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub volume_delta: u64,
    pub total_volume: u64,
    pub open_interest: u64,
    pub vol_oi_ratio: Option<f64>,
    pub last_price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub bid_size: Option<u64>,
    pub ask_size: Option<u64>,
    pub premium_usd: f64,
    pub iv: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub underlying_price: Option<f64>,
    pub execution_side: ExecutionSide,
    pub intensity: FlowIntensity,
    pub observed_at: DateTime<Utc>,
}

impl FlowEvent {
    pub fn dte(&self, today: NaiveDate) -> i64 {
        (self.expiration - today).num_days()
    }

    /// Quote spread as a percentage of the midpoint.
    pub fn spread_pct(&self) -> Option<f64> {
        let bid = usable(self.bid)?;
        let ask = usable(self.ask)?;
        let mid = f64::midpoint(bid, ask);
        if mid > 0.0 && ask >= bid {
            Some((ask - bid) / mid * 100.0)
        } else {
            None
        }
    }
}

/// A completed pattern detection, scored and ready for dedup + alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSignal {
    pub symbol: String,
    pub pattern: PatternKind,
    pub timeframe: Timeframe,
    pub completion_bar_start: DateTime<Utc>,
    pub direction: OptionKind,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub confidence: f64,
    pub meta: serde_json::Value,
}

impl PatternSignal {
    /// At most one alert per `(symbol, pattern, timeframe, ET trading date)`.
    pub fn dedup_key(&self, trading_date_et: NaiveDate) -> String {
        format!(
            "{}|{}|{}|{}",
            self.symbol, self.pattern, self.timeframe, trading_date_et
        )
    }
}
