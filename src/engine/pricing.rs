//! Probability and expected-move helpers for the filter cascades.

use statrs::distribution::{ContinuousCDF, Normal};

use super::types::OptionKind;

/// Annualized risk-free rate used in d₂. The downstream check is a coarse
/// probability floor, so a fixed constant is adequate.
const RISK_FREE_RATE: f64 = 0.05;

const DAYS_PER_YEAR: f64 = 365.0;

/// Black–Scholes d₂ term, `None` when inputs cannot support it.
pub fn d2(spot: f64, strike: f64, iv: f64, t_years: f64) -> Option<f64> {
    if spot <= 0.0 || strike <= 0.0 || iv <= 0.0 || t_years <= 0.0 {
        return None;
    }
    if !(spot.is_finite() && strike.is_finite() && iv.is_finite() && t_years.is_finite()) {
        return None;
    }
    let sigma_sqrt_t = iv * t_years.sqrt();
    let value =
        ((spot / strike).ln() + (RISK_FREE_RATE - iv * iv / 2.0) * t_years) / sigma_sqrt_t;
    value.is_finite().then_some(value)
}

/// Risk-neutral probability the contract finishes in the money: `N(d₂)` for
/// calls, `N(−d₂)` for puts.
pub fn prob_itm(
    kind: OptionKind,
    spot: f64,
    strike: f64,
    iv: f64,
    dte_days: f64,
) -> Option<f64> {
    let d2 = d2(spot, strike, iv, dte_days / DAYS_PER_YEAR)?;
    let norm = Normal::new(0.0, 1.0).ok()?;
    let p = match kind {
        OptionKind::Call => norm.cdf(d2),
        OptionKind::Put => norm.cdf(-d2),
    };
    Some(p)
}

/// One-standard-deviation move over `days`: `spot · IV · √(days/365)`.
pub fn expected_move(spot: f64, iv: f64, days: f64) -> f64 {
    spot * iv * (days / DAYS_PER_YEAR).sqrt()
}
