//! Bar alignment in America/New_York.
//!
//! Every boundary comparison happens in ET through the timezone database, so
//! DST transitions are handled by construction: a spring-forward hour that
//! does not exist resolves to "no bar", and a fall-back hour that exists
//! twice resolves to the earlier instant. Bars are half-open `[start, end)`
//! intervals and may legitimately span 45 or 75 wall-clock minutes across a
//! transition.

use chrono::{DateTime, Datelike, LocalResult, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;

use super::types::{Bar, Timeframe};

pub fn to_eastern(t: DateTime<Utc>) -> DateTime<Tz> {
    t.with_timezone(&New_York)
}

/// ET calendar date containing the given instant; used as the dedup-key date.
pub fn trading_date_et(now: DateTime<Utc>) -> NaiveDate {
    to_eastern(now).date_naive()
}

/// Resolve `hour:00` ET on `date` to a UTC instant.
///
/// Returns `None` for a spring-forward gap; an ambiguous fall-back time maps
/// to the earlier UTC instant so a detection never sees the hour twice.
pub fn eastern_hour_instant(date: NaiveDate, hour: u32) -> Option<DateTime<Utc>> {
    match New_York.with_ymd_and_hms(date.year(), date.month(), date.day(), hour, 0, 0) {
        LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _latest) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

/// Whether a bar's ET start sits on a canonical boundary for the timeframe.
///
/// 60-minute bars start on the hour; 240-minute bars on 00/04/08/12/16/20;
/// 720-minute bars on the 08:00 day session or 20:00 overnight session.
pub fn is_aligned(bar: &Bar, timeframe: Timeframe) -> bool {
    let start = to_eastern(bar.start);
    if start.minute() != 0 || start.second() != 0 {
        return false;
    }
    match timeframe {
        Timeframe::H1 => true,
        Timeframe::H4 => start.hour() % 4 == 0,
        Timeframe::H12 => start.hour() == 8 || start.hour() == 20,
        Timeframe::D1 => true,
    }
}

/// Keep only canonically-aligned bars, warning about the rest. The provider
/// occasionally returns buckets anchored to its own epoch; those are
/// rejected here rather than silently re-interpreted.
pub fn retain_aligned(bars: Vec<Bar>, timeframe: Timeframe, symbol: &str) -> Vec<Bar> {
    let before = bars.len();
    let aligned: Vec<Bar> = bars
        .into_iter()
        .filter(|b| is_aligned(b, timeframe))
        .collect();
    let dropped = before - aligned.len();
    if dropped > 0 {
        tracing::warn!(
            symbol,
            timeframe = %timeframe,
            dropped,
            "dropped misaligned bars from provider response"
        );
    }
    aligned
}

/// The bar whose `[start, end)` interval contains `hour:00` ET on `date`.
///
/// Logs a misalignment warning (with the distance to the nearest bar start)
/// when no bar covers the target.
pub fn bar_containing<'a>(bars: &'a [Bar], date: NaiveDate, hour: u32) -> Option<&'a Bar> {
    let target = eastern_hour_instant(date, hour)?;
    let hit = bars.iter().find(|b| b.start <= target && target < b.end);
    if hit.is_none() {
        let nearest = bars
            .iter()
            .map(|b| (b.start - target).num_seconds().abs())
            .min();
        tracing::warn!(
            %date,
            hour,
            nearest_delta_secs = nearest,
            "no bar contains the requested ET hour"
        );
    }
    hit
}

/// Batch form of [`bar_containing`]; one slot per requested hour.
pub fn bars_for_hours<'a>(bars: &'a [Bar], date: NaiveDate, hours: &[u32]) -> Vec<Option<&'a Bar>> {
    hours
        .iter()
        .map(|&h| bar_containing(bars, date, h))
        .collect()
}

/// The bar with the largest start strictly before `bar`'s, regardless of
/// clock hour. Sequential by construction, so session gaps and DST shifts
/// cannot skip it.
pub fn previous_bar<'a>(bars: &'a [Bar], bar: &Bar) -> Option<&'a Bar> {
    bars.iter()
        .filter(|b| b.start < bar.start)
        .max_by_key(|b| b.start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn hour_bar(start: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            start,
            end: start + Duration::hours(1),
            open,
            high,
            low,
            close,
            volume: 1000.0,
            vwap: None,
        }
    }

    fn et_hour(date: (i32, u32, u32), hour: u32) -> DateTime<Utc> {
        let d = NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap();
        eastern_hour_instant(d, hour).unwrap()
    }

    fn session_bars(date: (i32, u32, u32), hours: &[u32]) -> Vec<Bar> {
        hours
            .iter()
            .map(|&h| hour_bar(et_hour(date, h), 100.0, 101.0, 99.0, 100.5))
            .collect()
    }

    #[test]
    fn bar_containing_finds_covering_interval() {
        let date = NaiveDate::from_ymd_opt(2025, 10, 22).unwrap();
        let bars = session_bars((2025, 10, 22), &[8, 9, 10]);
        let b9 = bar_containing(&bars, date, 9).unwrap();
        assert_eq!(b9.start, et_hour((2025, 10, 22), 9));
    }

    #[test]
    fn bar_containing_returns_none_when_uncovered() {
        let date = NaiveDate::from_ymd_opt(2025, 10, 22).unwrap();
        let bars = session_bars((2025, 10, 22), &[8, 10]);
        assert!(bar_containing(&bars, date, 9).is_none());
    }

    #[test]
    fn bars_for_hours_batches() {
        let date = NaiveDate::from_ymd_opt(2025, 10, 22).unwrap();
        let bars = session_bars((2025, 10, 22), &[8, 9, 10]);
        let found = bars_for_hours(&bars, date, &[8, 9, 11]);
        assert!(found[0].is_some());
        assert!(found[1].is_some());
        assert!(found[2].is_none());
    }

    #[test]
    fn previous_bar_is_sequential_not_hour_based() {
        // Weekend gap: Friday 16:00 precedes Monday 08:00.
        let friday = hour_bar(et_hour((2025, 10, 17), 16), 100.0, 101.0, 99.0, 100.5);
        let monday = hour_bar(et_hour((2025, 10, 20), 8), 100.0, 101.0, 99.0, 100.5);
        let bars = vec![friday.clone(), monday.clone()];
        let prev = previous_bar(&bars, &monday).unwrap();
        assert_eq!(prev.start, friday.start);
        assert!(previous_bar(&bars, &friday).is_none());
    }

    #[test]
    fn spring_forward_gap_hour_resolves_to_no_bar() {
        // 2025-03-09: 02:00 ET does not exist.
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        assert!(eastern_hour_instant(date, 2).is_none());
        let bars = session_bars((2025, 3, 9), &[0, 1, 3]);
        assert!(bar_containing(&bars, date, 2).is_none());
    }

    #[test]
    fn spring_forward_previous_of_three_am_is_the_one_am_bar() {
        let bars = session_bars((2025, 3, 9), &[0, 1, 3]);
        let three = bars[2].clone();
        let prev = previous_bar(&bars, &three).unwrap();
        assert_eq!(prev.start, et_hour((2025, 3, 9), 1));
        // The 01:00 EST bar ends exactly where the 03:00 EDT bar starts.
        assert_eq!(prev.end, three.start);
    }

    #[test]
    fn fall_back_ambiguous_hour_uses_earlier_instant() {
        // 2025-11-02: 01:00 ET occurs twice; the earlier (EDT) instant wins.
        let date = NaiveDate::from_ymd_opt(2025, 11, 2).unwrap();
        let target = eastern_hour_instant(date, 1).unwrap();

        let first = hour_bar(target, 100.0, 101.0, 99.0, 100.5);
        let second = hour_bar(target + Duration::hours(1), 100.0, 101.0, 99.0, 100.5);
        let bars = vec![first.clone(), second];

        let hit = bar_containing(&bars, date, 1).unwrap();
        assert_eq!(hit.start, first.start, "only the first 01:00 bar is used");
    }

    #[test]
    fn alignment_accepts_canonical_boundaries() {
        let b4 = Bar {
            start: et_hour((2025, 10, 22), 8),
            end: et_hour((2025, 10, 22), 12),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 1.0,
            vwap: None,
        };
        assert!(is_aligned(&b4, Timeframe::H4));
        assert!(is_aligned(&b4, Timeframe::H12));
        assert!(is_aligned(&b4, Timeframe::H1));
    }

    #[test]
    fn alignment_rejects_off_boundary_starts() {
        let b = Bar {
            start: et_hour((2025, 10, 22), 9),
            end: et_hour((2025, 10, 22), 13),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 1.0,
            vwap: None,
        };
        // 09:00 is a valid hourly boundary but not a 240-minute or
        // 720-minute session boundary.
        assert!(is_aligned(&b, Timeframe::H1));
        assert!(!is_aligned(&b, Timeframe::H4));
        assert!(!is_aligned(&b, Timeframe::H12));
    }

    #[test]
    fn retain_aligned_drops_provider_epoch_buckets() {
        let good = Bar {
            start: et_hour((2025, 10, 22), 8),
            end: et_hour((2025, 10, 22), 12),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 1.0,
            vwap: None,
        };
        let bad = Bar {
            start: et_hour((2025, 10, 22), 10),
            end: et_hour((2025, 10, 22), 14),
            ..good.clone()
        };
        let kept = retain_aligned(vec![good.clone(), bad], Timeframe::H4, "SPY");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].start, good.start);
    }

    #[test]
    fn trading_date_uses_eastern_calendar() {
        // 2025-10-23 01:30 UTC is still 2025-10-22 in New York.
        let t = Utc.with_ymd_and_hms(2025, 10, 23, 1, 30, 0).unwrap();
        assert_eq!(
            trading_date_et(t),
            NaiveDate::from_ymd_opt(2025, 10, 22).unwrap()
        );
    }
}
