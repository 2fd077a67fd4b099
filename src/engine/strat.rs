//! STRAT bar classification and the three pattern detectors.
//!
//! Detectors are pure functions over a slice of aligned bars; they return a
//! [`Detection`] that the scanner enriches with symbol and confidence. Alert
//! emission is gated separately by the per-pattern ET time windows.

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use serde_json::json;

use super::bars::{bar_containing, previous_bar};
use super::types::{Bar, BarType, OptionKind, PatternKind};

/// Classify `bar` against its predecessor.
///
/// Inclusive comparisons make equal-high/equal-low cases deterministic: a
/// bar matching its predecessor's extremes is inside, and a bar must
/// strictly exceed an extreme to be directional or outside.
pub fn classify(bar: &Bar, prev: &Bar) -> BarType {
    let broke_high = bar.high > prev.high;
    let broke_low = bar.low < prev.low;
    match (broke_high, broke_low) {
        (true, true) => BarType::Three,
        (false, false) => BarType::One,
        (true, false) => BarType::TwoUp,
        (false, true) => BarType::TwoDown,
    }
}

/// A pattern hit before scoring: geometry only.
#[derive(Debug, Clone)]
pub struct Detection {
    pub pattern: PatternKind,
    pub direction: OptionKind,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub completion_bar_start: DateTime<Utc>,
    pub meta: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Alert windows
// ---------------------------------------------------------------------------

/// Inclusive window in minutes since ET midnight.
#[derive(Debug, Clone, Copy)]
pub struct AlertWindow {
    pub start_min: u32,
    pub end_min: u32,
}

impl AlertWindow {
    const fn new(start_h: u32, start_m: u32, end_h: u32, end_m: u32) -> Self {
        Self {
            start_min: start_h * 60 + start_m,
            end_min: end_h * 60 + end_m,
        }
    }

    pub fn contains(&self, now_et: DateTime<Tz>) -> bool {
        let m = now_et.hour() * 60 + now_et.minute();
        self.start_min <= m && m <= self.end_min
    }
}

const THREE_TWO_TWO_WINDOWS: &[AlertWindow] = &[AlertWindow::new(10, 1, 10, 6)];
const TWO_TWO_WINDOWS: &[AlertWindow] = &[
    AlertWindow::new(4, 0, 4, 5),
    AlertWindow::new(8, 0, 8, 5),
];
const MIYAGI_WINDOWS: &[AlertWindow] = &[
    AlertWindow::new(8, 0, 8, 5),
    AlertWindow::new(20, 0, 20, 5),
];

pub fn alert_windows(pattern: PatternKind) -> &'static [AlertWindow] {
    match pattern {
        PatternKind::ThreeTwoTwo => THREE_TWO_TWO_WINDOWS,
        PatternKind::TwoTwo => TWO_TWO_WINDOWS,
        PatternKind::Miyagi => MIYAGI_WINDOWS,
    }
}

pub fn in_alert_window(pattern: PatternKind, now_et: DateTime<Tz>) -> bool {
    alert_windows(pattern).iter().any(|w| w.contains(now_et))
}

/// Whether any pattern window is active, or starts within `lead_min`
/// minutes. Drives the STRAT worker's adaptive cadence.
pub fn window_proximity(now_et: DateTime<Tz>, lead_min: u32) -> WindowProximity {
    let m = now_et.hour() * 60 + now_et.minute();
    let all = [THREE_TWO_TWO_WINDOWS, TWO_TWO_WINDOWS, MIYAGI_WINDOWS];
    for windows in all {
        for w in windows {
            if w.start_min <= m && m <= w.end_min {
                return WindowProximity::Inside;
            }
        }
    }
    for windows in all {
        for w in windows {
            if m < w.start_min && w.start_min - m <= lead_min {
                return WindowProximity::Approaching;
            }
        }
    }
    WindowProximity::Far
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowProximity {
    Inside,
    Approaching,
    Far,
}

// ---------------------------------------------------------------------------
// Detectors
// ---------------------------------------------------------------------------

/// 3-2-2 reversal on 60-minute bars: an outside 08:00 bar, then two
/// directional bars in opposite directions at 09:00 and 10:00.
pub fn detect_three_two_two(bars: &[Bar], date: NaiveDate) -> Option<Detection> {
    let b8 = bar_containing(bars, date, 8)?;
    let b9 = bar_containing(bars, date, 9)?;
    let b10 = bar_containing(bars, date, 10)?;
    let p = previous_bar(bars, b8)?;

    if classify(b8, p) != BarType::Three {
        return None;
    }
    let t9 = classify(b9, b8);
    let t10 = classify(b10, b9);
    if !t9.is_directional() || !t10.is_directional() || t9 == t10 {
        return None;
    }

    let (direction, entry, target, stop) = match t10 {
        BarType::TwoUp => (OptionKind::Call, b9.high, b8.high, b10.low),
        BarType::TwoDown => (OptionKind::Put, b9.low, b8.low, b10.high),
        _ => unreachable!("t10 is directional"),
    };

    Some(Detection {
        pattern: PatternKind::ThreeTwoTwo,
        direction,
        entry,
        stop,
        target,
        completion_bar_start: b10.start,
        meta: json!({
            "bar_types": ["3", t9.as_str(), t10.as_str()],
            "session_hours_et": [8, 9, 10],
        }),
    })
}

/// 2-2 reversal on 4-hour bars: a directional 04:00 bar, an 08:00 open
/// inside its range, and an 08:00 bar breaking the other way.
pub fn detect_two_two(bars: &[Bar], date: NaiveDate) -> Option<Detection> {
    let b4 = bar_containing(bars, date, 4)?;
    let b8 = bar_containing(bars, date, 8)?;
    let p = previous_bar(bars, b4)?;

    let t4 = classify(b4, p);
    if !t4.is_directional() {
        return None;
    }
    if b8.open < b4.low || b8.open > b4.high {
        return None;
    }
    let t8 = classify(b8, b4);
    if !t8.is_directional() || t8 == t4 {
        return None;
    }

    let (direction, entry, stop) = match t8 {
        BarType::TwoUp => (OptionKind::Call, b4.high, b4.low),
        BarType::TwoDown => (OptionKind::Put, b4.low, b4.high),
        _ => unreachable!("t8 is directional"),
    };
    // Fixed 2% objective beyond the trigger.
    let target = match direction {
        OptionKind::Call => entry * 1.02,
        OptionKind::Put => entry * 0.98,
    };

    Some(Detection {
        pattern: PatternKind::TwoTwo,
        direction,
        entry,
        stop,
        target,
        completion_bar_start: b8.start,
        meta: json!({
            "bar_types": [t4.as_str(), t8.as_str()],
            "setup_open_inside_range": true,
        }),
    })
}

/// 1-3-1 Miyagi on 12-hour bars: inside, outside, inside, then a
/// directional bar closing across the third bar's midpoint signals a
/// reversal the other way.
pub fn detect_miyagi(bars: &[Bar]) -> Option<Detection> {
    if bars.len() < 5 {
        return None;
    }
    let w = &bars[bars.len() - 5..];
    let (c0, c1, c2, c3, c4) = (&w[0], &w[1], &w[2], &w[3], &w[4]);

    if classify(c1, c0) != BarType::One
        || classify(c2, c1) != BarType::Three
        || classify(c3, c2) != BarType::One
    {
        return None;
    }
    let t4 = classify(c4, c3);
    let trigger = f64::midpoint(c3.high, c3.low);

    let (direction, stop) = match t4 {
        BarType::TwoUp if c4.close > trigger => (OptionKind::Put, c3.high),
        BarType::TwoDown if c4.close < trigger => (OptionKind::Call, c3.low),
        _ => return None,
    };
    let entry = trigger;
    // 2:1 reward-to-risk off the third bar's extreme.
    let risk = (entry - stop).abs();
    let target = match direction {
        OptionKind::Put => entry - 2.0 * risk,
        OptionKind::Call => entry + 2.0 * risk,
    };

    Some(Detection {
        pattern: PatternKind::Miyagi,
        direction,
        entry,
        stop,
        target,
        completion_bar_start: c4.start,
        meta: json!({
            "bar_types": ["1", "3", "1", t4.as_str()],
            "trigger": trigger,
        }),
    })
}
