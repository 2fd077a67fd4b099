//! Chat-webhook embed construction and sanitization.
//!
//! Hard limits from the webhook contract are enforced here: title ≤ 256,
//! description ≤ 4096, ≤ 25 fields of name ≤ 256 / value ≤ 1024. Every
//! numeric formatter renders non-finite values as a placeholder so a NaN
//! can never leak into a payload, and empty fields are elided.

use chrono::{NaiveDate, SecondsFormat};
use serde::Serialize;

use crate::engine::scoring::{tier_label, ScoreBreakdown, WHALE_PREMIUM};
use crate::engine::types::{FlowEvent, OptionKind, PatternSignal};

pub const TITLE_LIMIT: usize = 256;
pub const DESCRIPTION_LIMIT: usize = 4096;
pub const FIELD_NAME_LIMIT: usize = 256;
pub const FIELD_VALUE_LIMIT: usize = 1024;
pub const MAX_FIELDS: usize = 25;

const PLACEHOLDER: &str = "n/a";

const COLOR_CALL: u32 = 0x2ECC71;
const COLOR_PUT: u32 = 0xE74C3C;
const COLOR_WHALE: u32 = 0xF1C40F;

#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub username: String,
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub color: u32,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Two-decimal rendering with a placeholder for anything non-finite.
pub fn fmt_num(v: f64) -> String {
    if v.is_finite() {
        format!("{v:.2}")
    } else {
        PLACEHOLDER.to_string()
    }
}

pub fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(x) => fmt_num(x),
        None => PLACEHOLDER.to_string(),
    }
}

/// Compact dollar rendering: `$1.05M`, `$72.5K`, `$850`.
pub fn fmt_usd(v: f64) -> String {
    if !v.is_finite() {
        return PLACEHOLDER.to_string();
    }
    let abs = v.abs();
    if abs >= 1_000_000_000.0 {
        format!("${:.2}B", v / 1_000_000_000.0)
    } else if abs >= 1_000_000.0 {
        format!("${:.2}M", v / 1_000_000.0)
    } else if abs >= 1_000.0 {
        format!("${:.1}K", v / 1_000.0)
    } else {
        format!("${v:.0}")
    }
}

fn truncate(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        s.to_string()
    } else {
        s.chars().take(limit).collect()
    }
}

fn push_field(fields: &mut Vec<EmbedField>, name: &str, value: String, inline: bool) {
    if value.is_empty() || fields.len() >= MAX_FIELDS {
        return;
    }
    fields.push(EmbedField {
        name: truncate(name, FIELD_NAME_LIMIT),
        value: truncate(&value, FIELD_VALUE_LIMIT),
        inline,
    });
}

fn finish(username: String, mut embed: Embed) -> WebhookPayload {
    embed.title = truncate(&embed.title, TITLE_LIMIT);
    embed.description = truncate(&embed.description, DESCRIPTION_LIMIT);
    embed.fields.truncate(MAX_FIELDS);
    WebhookPayload {
        username,
        embeds: vec![embed],
    }
}

// ---------------------------------------------------------------------------
// Flow alerts
// ---------------------------------------------------------------------------

pub fn flow_payload(
    bot_name: &str,
    e: &FlowEvent,
    score: &ScoreBreakdown,
    today: NaiveDate,
) -> WebhookPayload {
    let label = tier_label(e.premium_usd);
    let title = format!(
        "{label}: {} {} ${} {}",
        e.underlying,
        e.kind.as_str(),
        fmt_num(e.strike),
        e.expiration.format("%Y-%m-%d"),
    );
    let description = format!(
        "{} premium swept at the {} ({})",
        fmt_usd(e.premium_usd),
        e.execution_side.as_str(),
        e.intensity.as_str(),
    );

    let color = if e.premium_usd >= WHALE_PREMIUM {
        COLOR_WHALE
    } else {
        direction_color(e.kind)
    };

    let mut fields = Vec::new();
    push_field(&mut fields, "Premium", fmt_usd(e.premium_usd), true);
    push_field(&mut fields, "Volume Δ", e.volume_delta.to_string(), true);
    push_field(&mut fields, "Day Volume", e.total_volume.to_string(), true);
    push_field(&mut fields, "Open Interest", e.open_interest.to_string(), true);
    push_field(&mut fields, "Vol/OI", fmt_opt(e.vol_oi_ratio), true);
    push_field(&mut fields, "Last", fmt_num(e.last_price), true);
    push_field(
        &mut fields,
        "Bid × Ask",
        format!("{} × {}", fmt_opt(e.bid), fmt_opt(e.ask)),
        true,
    );
    push_field(&mut fields, "Delta", fmt_opt(e.delta), true);
    push_field(&mut fields, "IV", fmt_opt(e.iv), true);
    push_field(&mut fields, "DTE", e.dte(today).to_string(), true);
    push_field(&mut fields, "Spot", fmt_opt(e.underlying_price), true);
    push_field(
        &mut fields,
        "Score",
        format!("{}/100", score.total()),
        true,
    );

    let embed = Embed {
        title,
        description,
        color,
        timestamp: e.observed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        fields,
        footer: Some(EmbedFooter {
            text: e.contract_ticker.clone(),
        }),
    };
    finish(format!("ORAKL {bot_name}"), embed)
}

// ---------------------------------------------------------------------------
// Pattern alerts
// ---------------------------------------------------------------------------

pub fn pattern_payload(bot_name: &str, s: &PatternSignal) -> WebhookPayload {
    let title = format!(
        "{} {} {} → {}",
        s.symbol,
        s.pattern,
        s.timeframe,
        s.direction.as_str(),
    );
    let description = format!(
        "Confidence {:.0}% — entry {}, stop {}, target {}",
        s.confidence * 100.0,
        fmt_num(s.entry),
        fmt_num(s.stop),
        fmt_num(s.target),
    );

    let mut fields = Vec::new();
    push_field(&mut fields, "Entry", fmt_num(s.entry), true);
    push_field(&mut fields, "Stop", fmt_num(s.stop), true);
    push_field(&mut fields, "Target", fmt_num(s.target), true);
    push_field(&mut fields, "Confidence", fmt_num(s.confidence), true);
    push_field(&mut fields, "Timeframe", s.timeframe.to_string(), true);
    push_field(
        &mut fields,
        "Completed",
        s.completion_bar_start
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        true,
    );

    let embed = Embed {
        title,
        description,
        color: direction_color(s.direction),
        timestamp: s
            .completion_bar_start
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        fields,
        footer: None,
    };
    finish(format!("ORAKL {bot_name}"), embed)
}

fn direction_color(kind: OptionKind) -> u32 {
    match kind {
        OptionKind::Call => COLOR_CALL,
        OptionKind::Put => COLOR_PUT,
    }
}
