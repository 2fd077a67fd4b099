//! Dynamic confidence for pattern signals.
//!
//! Four weighted components computed purely from the bar series: relative
//! volume (30), trend alignment (30), pattern clarity (25), and volatility
//! regime (15). The sum is normalized and clamped to [0.40, 0.95] so a
//! signal is never presented as either worthless or certain.

use rust_ti::standard_indicators::bulk as sti;

use super::types::{Bar, OptionKind};

const TREND_PERIOD: usize = 20;
const VOLUME_LOOKBACK: usize = 20;
const ATR_PERIOD: usize = 14;
const WICK_PENALTY: f64 = 6.0;

pub const CONFIDENCE_FLOOR: f64 = 0.40;
pub const CONFIDENCE_CEILING: f64 = 0.95;

/// Score a detection given the full aligned series (ending at the
/// completion bar) and the bars that form the pattern itself.
pub fn confidence(bars: &[Bar], direction: OptionKind, reference: &[&Bar]) -> f64 {
    let total = volume_factor(bars) * 30.0
        + trend_factor(bars, direction) * 30.0
        + clarity_points(reference)
        + volatility_points(bars);
    (total / 100.0).clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEILING)
}

/// Completion-bar volume relative to the median of the preceding bars,
/// capped at 1. Too little history reads as neutral.
fn volume_factor(bars: &[Bar]) -> f64 {
    let Some((current, history)) = bars.split_last() else {
        return 0.5;
    };
    let volumes: Vec<f64> = history
        .iter()
        .rev()
        .take(VOLUME_LOOKBACK)
        .map(|b| b.volume)
        .collect();
    if volumes.len() < 5 {
        return 0.5;
    }
    let median = rust_ti::basic_indicators::single::median(&volumes);
    if median <= 0.0 {
        return 0.5;
    }
    (current.volume / median).min(1.0)
}

/// 1.0 when the signal direction agrees with close vs. EMA, 0.33 otherwise.
/// (The EMA here intentionally replaces the simple-mean proxy.)
fn trend_factor(bars: &[Bar], direction: OptionKind) -> f64 {
    if bars.len() < TREND_PERIOD {
        return 0.66;
    }
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let ema_series = sti::exponential_moving_average(&closes, TREND_PERIOD);
    let Some(ema) = ema_series.last() else {
        return 0.66;
    };
    let close = closes[closes.len() - 1];
    let agrees = match direction {
        OptionKind::Call => close > *ema,
        OptionKind::Put => close < *ema,
    };
    if agrees {
        1.0
    } else {
        0.33
    }
}

/// Start from full credit and penalize each reference bar whose body is
/// less than half its range (indecisive, wick-heavy).
fn clarity_points(reference: &[&Bar]) -> f64 {
    let mut points = 25.0;
    for bar in reference {
        let weak = match bar.body_ratio() {
            Some(ratio) => ratio < 0.5,
            None => true,
        };
        if weak {
            points -= WICK_PENALTY;
        }
    }
    points.max(0.0)
}

/// Full credit when 14-bar ATR sits in the 1–3% band of price; partial in
/// the adjacent bands; token credit outside.
fn volatility_points(bars: &[Bar]) -> f64 {
    if bars.len() < ATR_PERIOD + 1 {
        return 9.0;
    }
    let window = &bars[bars.len() - ATR_PERIOD..];
    let close: Vec<f64> = window.iter().map(|b| b.close).collect();
    let high: Vec<f64> = window.iter().map(|b| b.high).collect();
    let low: Vec<f64> = window.iter().map(|b| b.low).collect();
    let atr = rust_ti::other_indicators::single::average_true_range(
        &close,
        &high,
        &low,
        rust_ti::ConstantModelType::SimpleMovingAverage,
    );
    let last_close = close[close.len() - 1];
    if last_close <= 0.0 || !atr.is_finite() {
        return 4.0;
    }
    let atr_pct = atr / last_close * 100.0;
    if (1.0..=3.0).contains(&atr_pct) {
        15.0
    } else if (0.5..1.0).contains(&atr_pct) || (3.0..=5.0).contains(&atr_pct) {
        9.0
    } else {
        4.0
    }
}
