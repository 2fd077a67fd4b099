//! Environment configuration.
//!
//! | Env Var | Default | Purpose |
//! |---------|---------|---------|
//! | `POLYGON_API_KEY` | (required) | data-provider credential |
//! | `POLYGON_BASE_URL` | `https://api.polygon.io` | provider base URL |
//! | `WATCHLIST` | built-in universe | comma-separated tickers |
//! | `WATCHLIST_MODE` | `STATIC` | `STATIC` or `ALL_MARKET` |
//! | `SKIP_TICKERS` | (none) | tickers removed from the watchlist |
//! | `<STRATEGY>_WEBHOOK` | (none) | per-strategy webhook; unset disables the bot |
//! | `<STRATEGY>_INTERVAL` | per-strategy | scan period in seconds |
//! | `RATE_LIMIT_PER_SEC` | `5` | provider token-bucket rate |
//! | `MAX_CONCURRENT_REQUESTS` | `10` | per-worker symbol concurrency |
//! | `REQUEST_TIMEOUT` | `30` | total per-request timeout (seconds) |
//! | `RETRY_ATTEMPTS` | `3` | fetcher retry budget |
//! | `RETRY_DELAY` | `500` | base backoff (milliseconds) |
//! | `DATABASE_URL` | (none) | SQLite path; unset → in-memory dedup |
//! | `HEALTH_PORT` | (none) | optional health/metrics HTTP port |
//!
//! Per-strategy thresholds (`BULLSEYE_MIN_PREMIUM`, `GOLDEN_MIN_PREMIUM`,
//! `SWEEPS_MIN_PREMIUM`, `MIN_PREMIUM`, `MIN_VOLUME`, …) override the
//! cascade defaults. Anything unparseable is a fatal startup error.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::bots::strategy::StrategyKind;
use crate::engine::filters::{
    FilterCascade, GeneralFlowFilter, GoldenSweepFilter, InstitutionalSwingFilter, ScalpFilter,
};
use crate::engine::flow::FlowThresholds;

/// Liquid fallback universe for `ALL_MARKET` mode with no explicit list.
pub const DEFAULT_UNIVERSE: &[&str] = &[
    "SPY", "QQQ", "IWM", "DIA", "AAPL", "MSFT", "NVDA", "AMZN", "GOOGL", "META", "TSLA", "AMD",
    "NFLX", "AVGO", "CRM", "COST", "JPM", "BAC", "XOM", "COIN", "PLTR", "SMCI", "ARM", "MU",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchlistMode {
    Static,
    AllMarket,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub strategy: StrategyKind,
    pub webhook_url: String,
    pub interval: Duration,
    /// Flow bots carry a cascade plus detector thresholds; the STRAT bot
    /// carries neither.
    pub cascade: Option<FilterCascade>,
    pub flow: Option<FlowThresholds>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub base_url: String,
    pub watchlist: Vec<String>,
    pub rate_limit_per_sec: f64,
    pub max_concurrent_requests: usize,
    pub request_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub database_url: Option<String>,
    pub health_port: Option<u16>,
    pub flow_cooldown: Duration,
    pub bots: Vec<BotConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_provider(&|key| std::env::var(key).ok())
    }

    /// Build from any key→value source; tests pass closures instead of
    /// mutating process env.
    pub fn from_provider(get: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = get("POLYGON_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .context("POLYGON_API_KEY is required")?;
        let base_url =
            get("POLYGON_BASE_URL").unwrap_or_else(|| "https://api.polygon.io".to_string());

        let mode = match get("WATCHLIST_MODE").as_deref() {
            None => WatchlistMode::Static,
            Some(raw) => match raw.trim().to_uppercase().as_str() {
                "STATIC" | "" => WatchlistMode::Static,
                "ALL_MARKET" => WatchlistMode::AllMarket,
                other => bail!("WATCHLIST_MODE must be STATIC or ALL_MARKET, got {other}"),
            },
        };
        let watchlist = build_watchlist(
            get("WATCHLIST").as_deref(),
            get("SKIP_TICKERS").as_deref(),
            mode,
        );
        if watchlist.is_empty() {
            bail!("watchlist is empty after applying SKIP_TICKERS");
        }

        let rate_limit_per_sec: f64 = parse_or(get, "RATE_LIMIT_PER_SEC", 5.0)?;
        if rate_limit_per_sec <= 0.0 {
            bail!("RATE_LIMIT_PER_SEC must be positive");
        }
        let max_concurrent_requests: usize = parse_or(get, "MAX_CONCURRENT_REQUESTS", 10)?;
        if max_concurrent_requests == 0 {
            bail!("MAX_CONCURRENT_REQUESTS must be positive");
        }
        let request_timeout = Duration::from_secs(parse_or(get, "REQUEST_TIMEOUT", 30u64)?);
        let retry_attempts: u32 = parse_or(get, "RETRY_ATTEMPTS", 3)?;
        let retry_delay = Duration::from_millis(parse_or(get, "RETRY_DELAY", 500u64)?);
        let flow_cooldown = Duration::from_secs(parse_or(get, "FLOW_COOLDOWN_SECS", 4 * 3600u64)?);

        let health_port = match get("HEALTH_PORT") {
            None => None,
            Some(raw) => Some(
                raw.parse::<u16>()
                    .with_context(|| format!("HEALTH_PORT invalid: {raw}"))?,
            ),
        };

        let mut bots = Vec::new();
        for kind in StrategyKind::all() {
            let webhook_key = format!("{}_WEBHOOK", kind.env_prefix());
            let Some(webhook_url) = get(&webhook_key).filter(|u| !u.trim().is_empty()) else {
                continue;
            };
            let interval_key = format!("{}_INTERVAL", kind.env_prefix());
            let interval_secs: u64 =
                parse_or(get, &interval_key, kind.default_interval().as_secs())?;
            let (cascade, flow) = if kind.is_flow() {
                let cascade = cascade_for(kind, get)?;
                cascade
                    .validate_params()
                    .map_err(|e| anyhow::anyhow!("{} thresholds invalid: {e}", kind.bot_name()))?;
                let flow = flow_thresholds_for(&cascade);
                (Some(cascade), Some(flow))
            } else {
                (None, None)
            };
            bots.push(BotConfig {
                strategy: kind,
                webhook_url,
                interval: Duration::from_secs(interval_secs.max(5)),
                cascade,
                flow,
            });
        }
        if bots.is_empty() {
            bail!("no <STRATEGY>_WEBHOOK configured; nothing to run");
        }

        Ok(Self {
            api_key,
            base_url,
            watchlist,
            rate_limit_per_sec,
            max_concurrent_requests,
            request_timeout,
            retry_attempts,
            retry_delay,
            database_url: get("DATABASE_URL").filter(|u| !u.trim().is_empty()),
            health_port,
            flow_cooldown,
            bots,
        })
    }
}

/// Uppercase, order-preserving dedup, minus the skip list.
fn build_watchlist(
    raw: Option<&str>,
    skip: Option<&str>,
    mode: WatchlistMode,
) -> Vec<String> {
    let skip: Vec<String> = split_symbols(skip.unwrap_or(""));
    let base = match raw {
        Some(r) if !r.trim().is_empty() => split_symbols(r),
        _ => {
            if mode == WatchlistMode::AllMarket {
                tracing::info!("ALL_MARKET watchlist: using built-in liquid universe");
            }
            DEFAULT_UNIVERSE.iter().map(|s| (*s).to_string()).collect()
        }
    };
    base.into_iter().filter(|s| !skip.contains(s)).collect()
}

fn split_symbols(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

fn parse_or<T: FromStr>(
    get: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{key} invalid ({raw}): {e}")),
    }
}

fn cascade_for(kind: StrategyKind, get: &dyn Fn(&str) -> Option<String>) -> Result<FilterCascade> {
    Ok(match kind {
        StrategyKind::Golden => {
            let mut f = GoldenSweepFilter::default();
            f.min_premium = parse_or(get, "GOLDEN_MIN_PREMIUM", f.min_premium)?;
            FilterCascade::GoldenSweep(f)
        }
        StrategyKind::Bullseye => {
            let mut f = InstitutionalSwingFilter::default();
            f.min_premium = parse_or(get, "BULLSEYE_MIN_PREMIUM", f.min_premium)?;
            f.min_dte = parse_or(get, "BULLSEYE_MIN_DTE", f.min_dte)?;
            f.max_dte = parse_or(get, "BULLSEYE_MAX_DTE", f.max_dte)?;
            f.delta_min = parse_or(get, "BULLSEYE_DELTA_MIN", f.delta_min)?;
            f.delta_max = parse_or(get, "BULLSEYE_DELTA_MAX", f.delta_max)?;
            f.min_itm_probability =
                parse_or(get, "BULLSEYE_MIN_ITM_PROBABILITY", f.min_itm_probability)?;
            f.max_spread_pct = parse_or(get, "BULLSEYE_MAX_SPREAD_PCT", f.max_spread_pct)?;
            FilterCascade::InstitutionalSwing(f)
        }
        StrategyKind::Sweeps => {
            let mut f = ScalpFilter::default();
            f.min_premium = parse_or(get, "SWEEPS_MIN_PREMIUM", f.min_premium)?;
            FilterCascade::Scalp(f)
        }
        StrategyKind::Flow => {
            let mut f = GeneralFlowFilter::default();
            f.min_premium = parse_or(get, "MIN_PREMIUM", f.min_premium)?;
            f.min_volume_delta = parse_or(get, "MIN_VOLUME", f.min_volume_delta)?;
            FilterCascade::GeneralFlow(f)
        }
        StrategyKind::Strat => bail!("STRAT bot has no filter cascade"),
    })
}

/// Detector-level pre-filters derived from the cascade so the flow pass
/// prunes before the cascade runs.
fn flow_thresholds_for(cascade: &FilterCascade) -> FlowThresholds {
    match cascade {
        FilterCascade::GoldenSweep(f) => FlowThresholds {
            min_premium: f.min_premium,
            min_volume_delta: 100,
            min_vol_oi_ratio: None,
        },
        FilterCascade::InstitutionalSwing(f) => FlowThresholds {
            min_premium: f.min_premium,
            min_volume_delta: f.min_volume_delta,
            min_vol_oi_ratio: Some(f.min_vol_oi_ratio),
        },
        FilterCascade::Scalp(f) => FlowThresholds {
            min_premium: f.min_premium,
            min_volume_delta: 50,
            min_vol_oi_ratio: None,
        },
        FilterCascade::GeneralFlow(f) => FlowThresholds {
            min_premium: f.min_premium,
            min_volume_delta: f.min_volume_delta,
            min_vol_oi_ratio: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn provider(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn base_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("POLYGON_API_KEY", "pk_test"),
            ("FLOW_WEBHOOK", "https://discord.test/hook"),
        ]
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let env = base_env();
        let cfg = Config::from_provider(&provider(&env)).unwrap();
        assert_eq!(cfg.rate_limit_per_sec, 5.0);
        assert_eq!(cfg.max_concurrent_requests, 10);
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.bots.len(), 1);
        assert_eq!(cfg.bots[0].strategy, StrategyKind::Flow);
        assert_eq!(cfg.bots[0].interval, Duration::from_secs(30));
        assert!(!cfg.watchlist.is_empty());
    }

    #[test]
    fn missing_api_key_is_fatal() {
        let env = vec![("FLOW_WEBHOOK", "https://x")];
        assert!(Config::from_provider(&provider(&env)).is_err());
    }

    #[test]
    fn no_webhooks_is_fatal() {
        let env = vec![("POLYGON_API_KEY", "pk")];
        assert!(Config::from_provider(&provider(&env)).is_err());
    }

    #[test]
    fn watchlist_uppercases_dedups_and_skips() {
        let list = build_watchlist(
            Some("aapl, MSFT, aapl, tsla , ,msft"),
            Some("TSLA"),
            WatchlistMode::Static,
        );
        assert_eq!(list, vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn empty_watchlist_falls_back_to_universe() {
        let list = build_watchlist(None, None, WatchlistMode::AllMarket);
        assert_eq!(list.len(), DEFAULT_UNIVERSE.len());
    }

    #[test]
    fn threshold_overrides_apply() {
        let mut env = base_env();
        env.push(("BULLSEYE_WEBHOOK", "https://discord.test/bullseye"));
        env.push(("BULLSEYE_MIN_PREMIUM", "750000"));
        env.push(("BULLSEYE_MAX_DTE", "10"));
        let cfg = Config::from_provider(&provider(&env)).unwrap();
        let bullseye = cfg
            .bots
            .iter()
            .find(|b| b.strategy == StrategyKind::Bullseye)
            .unwrap();
        let Some(FilterCascade::InstitutionalSwing(f)) = &bullseye.cascade else {
            panic!("wrong cascade");
        };
        assert_eq!(f.min_premium, 750_000.0);
        assert_eq!(f.max_dte, 10);
        let flow = bullseye.flow.as_ref().unwrap();
        assert_eq!(flow.min_premium, 750_000.0);
        assert_eq!(flow.min_vol_oi_ratio, Some(0.8));
    }

    #[test]
    fn invalid_threshold_value_is_fatal() {
        let mut env = base_env();
        env.push(("MIN_PREMIUM", "lots"));
        assert!(Config::from_provider(&provider(&env)).is_err());
    }

    #[test]
    fn invalid_watchlist_mode_is_fatal() {
        let mut env = base_env();
        env.push(("WATCHLIST_MODE", "EVERYTHING"));
        assert!(Config::from_provider(&provider(&env)).is_err());
    }

    #[test]
    fn strat_bot_has_no_cascade() {
        let mut env = base_env();
        env.push(("STRAT_WEBHOOK", "https://discord.test/strat"));
        let cfg = Config::from_provider(&provider(&env)).unwrap();
        let strat = cfg
            .bots
            .iter()
            .find(|b| b.strategy == StrategyKind::Strat)
            .unwrap();
        assert!(strat.cascade.is_none());
        assert!(strat.flow.is_none());
        assert_eq!(strat.interval, Duration::from_secs(300));
    }

    #[test]
    fn intervals_have_a_floor() {
        let mut env = base_env();
        env.push(("FLOW_INTERVAL", "1"));
        let cfg = Config::from_provider(&provider(&env)).unwrap();
        assert_eq!(cfg.bots[0].interval, Duration::from_secs(5));
    }
}
