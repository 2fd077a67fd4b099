//! SQLite persistence for the pattern pipeline.
//!
//! Five tables: fetched bars, their classifications, detected patterns,
//! posted alerts (with the unique dedup key that survives restarts), and
//! per-cycle job runs. Schema is managed by embedded refinery migrations.

use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::engine::types::{Bar, BarType, PatternSignal, Timeframe};

mod embedded {
    refinery::embed_migrations!("migrations");
}

pub struct SignalStore {
    conn: Mutex<Connection>,
}

impl SignalStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn =
            Connection::open(path).with_context(|| format!("opening sqlite at {path}"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("opening in-memory sqlite")?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enabling foreign keys")?;
        embedded::migrations::runner()
            .run(&mut conn)
            .context("running migrations")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -- bars ---------------------------------------------------------------

    /// Insert or refresh a bar, returning its row id.
    pub fn upsert_bar(&self, symbol: &str, timeframe: Timeframe, bar: &Bar) -> Result<i64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO bars (symbol, timeframe, start_utc, end_utc, o, h, l, c, v)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (symbol, timeframe, start_utc) DO UPDATE SET
                 end_utc = excluded.end_utc,
                 o = excluded.o, h = excluded.h, l = excluded.l,
                 c = excluded.c, v = excluded.v",
            params![
                symbol,
                timeframe.as_str(),
                bar.start.to_rfc3339(),
                bar.end.to_rfc3339(),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume,
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM bars WHERE symbol = ?1 AND timeframe = ?2 AND start_utc = ?3",
            params![symbol, timeframe.as_str(), bar.start.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn record_classification(
        &self,
        bar_id: i64,
        bar_type: BarType,
        previous_bar_id: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO classified_bars (bar_id, type, previous_bar_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (bar_id) DO UPDATE SET
                 type = excluded.type,
                 previous_bar_id = excluded.previous_bar_id",
            params![bar_id, bar_type.as_str(), previous_bar_id],
        )?;
        Ok(())
    }

    // -- patterns & alerts --------------------------------------------------

    pub fn insert_pattern(&self, signal: &PatternSignal) -> Result<i64> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO patterns (symbol, pattern_type, timeframe,
                 completion_bar_start_utc, direction, entry, stop, target,
                 confidence, meta_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                signal.symbol,
                signal.pattern.as_str(),
                signal.timeframe.as_str(),
                signal.completion_bar_start.to_rfc3339(),
                signal.direction.as_str(),
                signal.entry,
                signal.stop,
                signal.target,
                signal.confidence,
                signal.meta.to_string(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Record a posted alert. Returns `false` when the dedup key already
    /// exists (suppressed duplicate), `true` when this is the first alert.
    pub fn insert_alert(
        &self,
        pattern_id: Option<i64>,
        signal: &PatternSignal,
        dedup_key: &str,
        payload_json: &str,
        alert_ts: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let changed = conn.execute(
            "INSERT OR IGNORE INTO alerts (pattern_id, symbol, pattern_type,
                 timeframe, alert_ts_utc, payload_json, dedup_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                pattern_id,
                signal.symbol,
                signal.pattern.as_str(),
                signal.timeframe.as_str(),
                alert_ts.to_rfc3339(),
                payload_json,
                dedup_key,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn has_alert(&self, dedup_key: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM alerts WHERE dedup_key = ?1",
                params![dedup_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // -- job runs -----------------------------------------------------------

    pub fn start_job_run(&self, job_type: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO job_runs (id, job_type, started_at, status)
             VALUES (?1, ?2, ?3, 'running')",
            params![id, job_type, Utc::now().to_rfc3339()],
        )?;
        Ok(id)
    }

    pub fn finish_job_run(
        &self,
        id: &str,
        symbols_scanned: u64,
        patterns_found: u64,
        alerts_sent: u64,
        errors_json: Option<&str>,
        status: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE job_runs SET ended_at = ?2, symbols_scanned = ?3,
                 patterns_found = ?4, alerts_sent = ?5, errors_json = ?6,
                 status = ?7
             WHERE id = ?1",
            params![
                id,
                Utc::now().to_rfc3339(),
                symbols_scanned as i64,
                patterns_found as i64,
                alerts_sent as i64,
                errors_json,
                status,
            ],
        )?;
        Ok(())
    }
}
