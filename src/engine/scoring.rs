//! Institutional scoring of flow events.
//!
//! Additive 0–100 model: premium tier (35), execution aggressiveness (25),
//! volume/open-interest dynamics (20), catalyst proximity (10), repeat
//! activity (10). Purely a presentation aid; filtering happened upstream.

use chrono::NaiveDate;

use super::types::{ExecutionSide, FlowEvent, FlowIntensity};

pub const WHALE_PREMIUM: f64 = 5_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreBreakdown {
    pub premium: u32,
    pub aggressiveness: u32,
    pub flow_dynamics: u32,
    pub catalyst: u32,
    pub repeat: u32,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u32 {
        self.premium + self.aggressiveness + self.flow_dynamics + self.catalyst + self.repeat
    }
}

/// `repeat_hits` is the count of other recent flow alerts on the same
/// underlying, supplied by the dedup store so this stays a pure function.
pub fn institutional_score(e: &FlowEvent, today: NaiveDate, repeat_hits: u32) -> ScoreBreakdown {
    let premium = match e.premium_usd {
        p if p >= WHALE_PREMIUM => 35,
        p if p >= 2_500_000.0 => 30,
        p if p >= 1_000_000.0 => 25,
        p if p >= 500_000.0 => 18,
        p if p >= 100_000.0 => 10,
        _ => 4,
    };

    let aggressiveness = match e.execution_side {
        ExecutionSide::Ask => match e.intensity {
            FlowIntensity::Aggressive => 25,
            FlowIntensity::Strong => 20,
            _ => 15,
        },
        ExecutionSide::Mid => 10,
        ExecutionSide::Bid => 4,
        ExecutionSide::Unknown => 0,
    };

    let flow_dynamics = match e.vol_oi_ratio {
        Some(r) if r >= 1.0 => 20,
        Some(r) if r >= 0.5 => 16,
        Some(r) if r >= 0.2 => 11,
        Some(r) if r >= 0.1 => 6,
        _ => 2,
    };

    let catalyst = match e.dte(today) {
        d if (0..=7).contains(&d) => 10,
        d if (8..=30).contains(&d) => 6,
        _ => 2,
    };

    let repeat = repeat_hits.min(5) * 2;

    ScoreBreakdown {
        premium,
        aggressiveness,
        flow_dynamics,
        catalyst,
        repeat,
    }
}

/// Qualitative size tag attached to the alert title.
pub fn tier_label(premium_usd: f64) -> &'static str {
    if premium_usd >= WHALE_PREMIUM {
        "WHALE"
    } else if premium_usd >= 1_000_000.0 {
        "INSTITUTIONAL"
    } else if premium_usd >= 500_000.0 {
        "LARGE"
    } else {
        "NOTABLE"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::OptionKind;
    use chrono::{TimeZone, Utc};

    fn event(premium: f64, side: ExecutionSide, intensity: FlowIntensity) -> FlowEvent {
        FlowEvent {
            contract_ticker: "O:AAPL261219C00200000".into(),
            underlying: "AAPL".into(),
            kind: OptionKind::Call,
            strike: 200.0,
            expiration: NaiveDate::from_ymd_opt(2026, 7, 3).unwrap(),
            volume_delta: 1500,
            total_volume: 1500,
            open_interest: 3000,
            vol_oi_ratio: Some(0.5),
            last_price: 7.0,
            bid: Some(6.95),
            ask: Some(7.01),
            bid_size: None,
            ask_size: None,
            premium_usd: premium,
            iv: Some(0.3),
            delta: Some(0.55),
            gamma: None,
            theta: None,
            vega: None,
            underlying_price: Some(198.5),
            execution_side: side,
            intensity,
            observed_at: Utc.with_ymd_and_hms(2026, 7, 1, 14, 0, 0).unwrap(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 7, 1).unwrap()
    }

    #[test]
    fn max_score_is_one_hundred() {
        let e = event(6_000_000.0, ExecutionSide::Ask, FlowIntensity::Aggressive);
        let mut e = e;
        e.vol_oi_ratio = Some(1.5);
        let s = institutional_score(&e, today(), 5);
        assert_eq!(s.total(), 100);
    }

    #[test]
    fn score_monotonic_in_premium_tier() {
        let tiers = [50_000.0, 200_000.0, 600_000.0, 1_500_000.0, 3_000_000.0, 6_000_000.0];
        let scores: Vec<u32> = tiers
            .iter()
            .map(|p| {
                institutional_score(
                    &event(*p, ExecutionSide::Ask, FlowIntensity::Aggressive),
                    today(),
                    0,
                )
                .premium
            })
            .collect();
        for pair in scores.windows(2) {
            assert!(pair[0] < pair[1], "premium points must rise: {scores:?}");
        }
    }

    #[test]
    fn ask_side_aggressive_outranks_bid_side() {
        let ask = event(1_050_000.0, ExecutionSide::Ask, FlowIntensity::Aggressive);
        let bid = event(1_050_000.0, ExecutionSide::Bid, FlowIntensity::Aggressive);
        assert!(
            institutional_score(&ask, today(), 0).total()
                > institutional_score(&bid, today(), 0).total()
        );
    }

    #[test]
    fn unknown_side_earns_no_aggressiveness_points() {
        let e = event(1_050_000.0, ExecutionSide::Unknown, FlowIntensity::Normal);
        assert_eq!(institutional_score(&e, today(), 0).aggressiveness, 0);
    }

    #[test]
    fn repeat_hits_are_capped() {
        let e = event(1_050_000.0, ExecutionSide::Ask, FlowIntensity::Aggressive);
        assert_eq!(institutional_score(&e, today(), 50).repeat, 10);
        assert_eq!(institutional_score(&e, today(), 2).repeat, 4);
    }

    #[test]
    fn near_expiry_earns_catalyst_points() {
        let near = event(100_000.0, ExecutionSide::Mid, FlowIntensity::Normal);
        let mut far = near.clone();
        far.expiration = NaiveDate::from_ymd_opt(2026, 12, 19).unwrap();
        assert!(
            institutional_score(&near, today(), 0).catalyst
                > institutional_score(&far, today(), 0).catalyst
        );
    }

    #[test]
    fn tier_labels() {
        assert_eq!(tier_label(6_000_000.0), "WHALE");
        assert_eq!(tier_label(1_200_000.0), "INSTITUTIONAL");
        assert_eq!(tier_label(600_000.0), "LARGE");
        assert_eq!(tier_label(50_000.0), "NOTABLE");
    }
}
