//! Per-strategy filter cascades over flow events.
//!
//! Every filter returns `Keep` or `Skip` with a structured reason; there is
//! no exception-driven control flow. Cascades fail closed: a field the
//! filter needs but cannot sanitize (missing Greeks, absent quotes) skips
//! the event rather than passing it through.

use chrono::NaiveDate;
use garde::Validate;

use super::pricing::{expected_move, prob_itm};
use super::types::{ExecutionSide, FlowEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipReason {
    pub filter: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    Keep,
    Skip(SkipReason),
}

impl FilterOutcome {
    pub fn is_keep(&self) -> bool {
        matches!(self, FilterOutcome::Keep)
    }

    fn skip(filter: &'static str, detail: impl Into<String>) -> Self {
        FilterOutcome::Skip(SkipReason {
            filter,
            detail: detail.into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Golden sweep
// ---------------------------------------------------------------------------

/// Very large premium hitting the ask near the money.
#[derive(Debug, Clone, Validate)]
pub struct GoldenSweepFilter {
    #[garde(range(min = 0.0))]
    pub min_premium: f64,
    /// Max |strike − spot| / spot.
    #[garde(range(min = 0.0, max = 1.0))]
    pub max_strike_distance: f64,
    #[garde(range(min = 0))]
    pub min_dte: i64,
    #[garde(range(min = 0))]
    pub max_dte: i64,
}

impl Default for GoldenSweepFilter {
    fn default() -> Self {
        Self {
            min_premium: 1_000_000.0,
            max_strike_distance: 0.05,
            min_dte: 1,
            max_dte: 180,
        }
    }
}

impl GoldenSweepFilter {
    pub fn evaluate(&self, e: &FlowEvent, today: NaiveDate) -> FilterOutcome {
        if e.premium_usd < self.min_premium {
            return FilterOutcome::skip(
                "golden_premium",
                format!("premium {:.0} below {:.0}", e.premium_usd, self.min_premium),
            );
        }
        let dte = e.dte(today);
        if dte < self.min_dte || dte > self.max_dte {
            return FilterOutcome::skip("golden_dte", format!("dte {dte} outside band"));
        }
        let Some(spot) = e.underlying_price.filter(|s| *s > 0.0) else {
            return FilterOutcome::skip("golden_spot", "missing underlying price");
        };
        let distance = (e.strike - spot).abs() / spot;
        if distance > self.max_strike_distance {
            return FilterOutcome::skip(
                "golden_moneyness",
                format!("strike {:.1}% from spot", distance * 100.0),
            );
        }
        if e.execution_side != ExecutionSide::Ask {
            return FilterOutcome::skip(
                "golden_side",
                format!("side {}", e.execution_side.as_str()),
            );
        }
        FilterOutcome::Keep
    }
}

// ---------------------------------------------------------------------------
// Institutional swing (bullseye)
// ---------------------------------------------------------------------------

/// Short-dated, liquid, mid-delta flow sized like positioning rather than
/// noise, with a Black–Scholes sanity check on the strike.
#[derive(Debug, Clone, Validate)]
pub struct InstitutionalSwingFilter {
    #[garde(range(min = 0.0))]
    pub min_premium: f64,
    #[garde(range(min = 0))]
    pub min_open_interest: u64,
    #[garde(range(min = 0.0, max = 100.0))]
    pub max_spread_pct: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub delta_min: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub delta_max: f64,
    #[garde(range(min = 0))]
    pub min_dte: i64,
    #[garde(range(min = 0))]
    pub max_dte: i64,
    #[garde(range(min = 0))]
    pub min_volume_delta: u64,
    #[garde(range(min = 0.0))]
    pub min_vol_oi_ratio: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub min_itm_probability: f64,
    /// Horizon (days) for the expected-move strike check.
    #[garde(range(min = 1.0))]
    pub expected_move_days: f64,
}

impl Default for InstitutionalSwingFilter {
    fn default() -> Self {
        Self {
            min_premium: 500_000.0,
            min_open_interest: 10_000,
            max_spread_pct: 5.0,
            delta_min: 0.35,
            delta_max: 0.65,
            min_dte: 1,
            max_dte: 5,
            min_volume_delta: 2_500,
            min_vol_oi_ratio: 0.8,
            min_itm_probability: 0.35,
            expected_move_days: 5.0,
        }
    }
}

impl InstitutionalSwingFilter {
    pub fn evaluate(&self, e: &FlowEvent, today: NaiveDate) -> FilterOutcome {
        if e.premium_usd < self.min_premium {
            return FilterOutcome::skip(
                "swing_premium",
                format!("premium {:.0} below {:.0}", e.premium_usd, self.min_premium),
            );
        }
        if e.open_interest < self.min_open_interest {
            return FilterOutcome::skip("swing_oi", format!("oi {}", e.open_interest));
        }
        match e.spread_pct() {
            Some(spread) if spread <= self.max_spread_pct => {}
            Some(spread) => {
                return FilterOutcome::skip("swing_spread", format!("spread {spread:.1}%"));
            }
            None => return FilterOutcome::skip("swing_spread", "no two-sided quote"),
        }
        let Some(delta) = e.delta.filter(|d| d.is_finite()) else {
            return FilterOutcome::skip("swing_delta", "missing delta");
        };
        let abs_delta = delta.abs();
        if abs_delta < self.delta_min || abs_delta > self.delta_max {
            return FilterOutcome::skip("swing_delta", format!("|delta| {abs_delta:.2}"));
        }
        let dte = e.dte(today);
        if dte < self.min_dte || dte > self.max_dte {
            return FilterOutcome::skip("swing_dte", format!("dte {dte}"));
        }
        if e.volume_delta < self.min_volume_delta {
            return FilterOutcome::skip(
                "swing_volume",
                format!("volume delta {}", e.volume_delta),
            );
        }
        match e.vol_oi_ratio {
            Some(r) if r >= self.min_vol_oi_ratio => {}
            Some(r) => return FilterOutcome::skip("swing_voi", format!("ratio {r:.2}")),
            None => return FilterOutcome::skip("swing_voi", "no open interest"),
        }
        let (Some(spot), Some(iv)) = (
            e.underlying_price.filter(|s| *s > 0.0),
            e.iv.filter(|v| *v > 0.0),
        ) else {
            return FilterOutcome::skip("swing_inputs", "missing spot or IV");
        };
        let band = expected_move(spot, iv, self.expected_move_days);
        if (e.strike - spot).abs() > band {
            return FilterOutcome::skip(
                "swing_expected_move",
                format!("strike {:.2} beyond ±{band:.2}", e.strike),
            );
        }
        match prob_itm(e.kind, spot, e.strike, iv, dte as f64) {
            Some(p) if p >= self.min_itm_probability => {}
            Some(p) => {
                return FilterOutcome::skip("swing_itm", format!("p(itm) {p:.2}"));
            }
            None => return FilterOutcome::skip("swing_itm", "d2 undefined"),
        }
        FilterOutcome::Keep
    }
}

// ---------------------------------------------------------------------------
// Scalp and general flow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Validate)]
pub struct ScalpFilter {
    #[garde(range(min = 0.0))]
    pub min_premium: f64,
    #[garde(range(min = 0))]
    pub min_dte: i64,
    #[garde(range(min = 0))]
    pub max_dte: i64,
}

impl Default for ScalpFilter {
    fn default() -> Self {
        Self {
            min_premium: 2_000.0,
            min_dte: 0,
            max_dte: 7,
        }
    }
}

impl ScalpFilter {
    pub fn evaluate(&self, e: &FlowEvent, today: NaiveDate) -> FilterOutcome {
        if e.premium_usd < self.min_premium {
            return FilterOutcome::skip("scalp_premium", format!("premium {:.0}", e.premium_usd));
        }
        let dte = e.dte(today);
        if dte < self.min_dte || dte > self.max_dte {
            return FilterOutcome::skip("scalp_dte", format!("dte {dte}"));
        }
        FilterOutcome::Keep
    }
}

#[derive(Debug, Clone, Validate)]
pub struct GeneralFlowFilter {
    #[garde(range(min = 0.0))]
    pub min_premium: f64,
    #[garde(range(min = 0))]
    pub min_dte: i64,
    #[garde(range(min = 0))]
    pub max_dte: i64,
    #[garde(range(min = 0))]
    pub min_volume_delta: u64,
}

impl Default for GeneralFlowFilter {
    fn default() -> Self {
        Self {
            min_premium: 10_000.0,
            min_dte: 1,
            max_dte: 45,
            min_volume_delta: 500,
        }
    }
}

impl GeneralFlowFilter {
    pub fn evaluate(&self, e: &FlowEvent, today: NaiveDate) -> FilterOutcome {
        if e.premium_usd < self.min_premium {
            return FilterOutcome::skip("flow_premium", format!("premium {:.0}", e.premium_usd));
        }
        let dte = e.dte(today);
        if dte < self.min_dte || dte > self.max_dte {
            return FilterOutcome::skip("flow_dte", format!("dte {dte}"));
        }
        if e.volume_delta < self.min_volume_delta {
            return FilterOutcome::skip("flow_volume", format!("delta {}", e.volume_delta));
        }
        FilterOutcome::Keep
    }
}

// ---------------------------------------------------------------------------
// Cascade dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum FilterCascade {
    GoldenSweep(GoldenSweepFilter),
    InstitutionalSwing(InstitutionalSwingFilter),
    Scalp(ScalpFilter),
    GeneralFlow(GeneralFlowFilter),
}

impl FilterCascade {
    pub fn name(&self) -> &'static str {
        match self {
            FilterCascade::GoldenSweep(_) => "golden_sweep",
            FilterCascade::InstitutionalSwing(_) => "institutional_swing",
            FilterCascade::Scalp(_) => "scalp",
            FilterCascade::GeneralFlow(_) => "general_flow",
        }
    }

    pub fn evaluate(&self, e: &FlowEvent, today: NaiveDate) -> FilterOutcome {
        match self {
            FilterCascade::GoldenSweep(f) => f.evaluate(e, today),
            FilterCascade::InstitutionalSwing(f) => f.evaluate(e, today),
            FilterCascade::Scalp(f) => f.evaluate(e, today),
            FilterCascade::GeneralFlow(f) => f.evaluate(e, today),
        }
    }

    /// Threshold sanity, run once at startup; violations are fatal config.
    pub fn validate_params(&self) -> Result<(), garde::Report> {
        match self {
            FilterCascade::GoldenSweep(f) => f.validate(),
            FilterCascade::InstitutionalSwing(f) => f.validate(),
            FilterCascade::Scalp(f) => f.validate(),
            FilterCascade::GeneralFlow(f) => f.validate(),
        }
    }
}
