//! Per-strategy policy: names, env prefixes, cadence, active windows.

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime};
use chrono_tz::Tz;

use crate::engine::strat::{window_proximity, WindowProximity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    /// Institutional swing (bullseye) flow.
    Bullseye,
    /// Golden sweeps: very large ask-side premium.
    Golden,
    /// Short-dated scalp flow.
    Sweeps,
    /// General notable flow.
    Flow,
    /// STRAT pattern engine (3-2-2 / 2-2 / 1-3-1).
    Strat,
}

impl StrategyKind {
    pub fn all() -> [StrategyKind; 5] {
        [
            StrategyKind::Bullseye,
            StrategyKind::Golden,
            StrategyKind::Sweeps,
            StrategyKind::Flow,
            StrategyKind::Strat,
        ]
    }

    /// Env-var prefix, e.g. `BULLSEYE_WEBHOOK` / `BULLSEYE_INTERVAL`.
    pub fn env_prefix(self) -> &'static str {
        match self {
            StrategyKind::Bullseye => "BULLSEYE",
            StrategyKind::Golden => "GOLDEN",
            StrategyKind::Sweeps => "SWEEPS",
            StrategyKind::Flow => "FLOW",
            StrategyKind::Strat => "STRAT",
        }
    }

    /// Display name in the webhook username (`ORAKL <BotName>`).
    pub fn bot_name(self) -> &'static str {
        match self {
            StrategyKind::Bullseye => "Bullseye",
            StrategyKind::Golden => "Golden",
            StrategyKind::Sweeps => "Sweeps",
            StrategyKind::Flow => "Flow",
            StrategyKind::Strat => "Strat",
        }
    }

    pub fn default_interval(self) -> Duration {
        match self {
            StrategyKind::Strat => Duration::from_secs(300),
            _ => Duration::from_secs(30),
        }
    }

    pub fn is_flow(self) -> bool {
        !matches!(self, StrategyKind::Strat)
    }
}

/// Daily ET activity window; scans outside it just sleep.
#[derive(Debug, Clone, Copy)]
pub struct ActiveWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub weekdays_only: bool,
}

impl ActiveWindow {
    pub fn contains(&self, now_et: DateTime<Tz>) -> bool {
        if self.weekdays_only && now_et.weekday().number_from_monday() > 5 {
            return false;
        }
        let t = now_et.time();
        t >= self.start && t <= self.end
    }
}

/// Flow bots track the equities session; the STRAT worker is awake from the
/// pre-market 04:00 windows through the 20:00 overnight-session window.
pub fn active_window(kind: StrategyKind) -> ActiveWindow {
    match kind {
        StrategyKind::Strat => ActiveWindow {
            start: NaiveTime::from_hms_opt(3, 55, 0).expect("valid time"),
            end: NaiveTime::from_hms_opt(20, 10, 0).expect("valid time"),
            weekdays_only: true,
        },
        _ => ActiveWindow {
            start: NaiveTime::from_hms_opt(9, 30, 0).expect("valid time"),
            end: NaiveTime::from_hms_opt(16, 15, 0).expect("valid time"),
            weekdays_only: true,
        },
    }
}

/// Adaptive cadence: the STRAT worker tightens to 60 s inside any alert
/// window and 120 s in the five minutes before one; flow bots poll at
/// their configured base rate.
pub fn current_interval(kind: StrategyKind, base: Duration, now_et: DateTime<Tz>) -> Duration {
    if kind != StrategyKind::Strat {
        return base;
    }
    match window_proximity(now_et, 5) {
        WindowProximity::Inside => Duration::from_secs(60),
        WindowProximity::Approaching => Duration::from_secs(120),
        WindowProximity::Far => base,
    }
}
