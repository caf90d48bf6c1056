use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

pub mod models;
use models::*;

/// Work handed to the persistence task. Senders use `try_send` and never
/// wait on the database.
#[derive(Debug, Clone)]
pub enum PersistCommand {
    Record(GameRecord),
    Batch(Vec<GameRecord>),
    Recommendation(Recommendation),
    Outcome(Outcome),
}

/// Thread-safe SQLite handle (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database mutex poisoned"))
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        self.lock()?.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Game records ─────────────────────────────────────────────────────────

    /// Insert a committed round. Re-committing the same round id is a no-op.
    pub fn insert_game_record(&self, rec: &GameRecord) -> Result<()> {
        let conn = self.lock()?;
        insert_record(&conn, rec)?;
        Ok(())
    }

    pub fn insert_game_records(&self, recs: &[GameRecord]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for rec in recs {
            inserted += insert_record(&tx, rec)?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Most recent `limit` rounds, returned oldest first.
    pub fn recent_game_records(&self, limit: i64) -> Result<Vec<GameRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT round_id, duration_ticks, peak_value, final_value,
                    is_early_termination, volatility_mean, volatility_max,
                    trade_volume, incomplete, revealed_seed, completed_at
             FROM game_records ORDER BY completed_at DESC, id DESC LIMIT ?1",
        )?;
        let mut rows = stmt
            .query_map(params![limit], map_game_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    pub fn count_game_records(&self) -> Result<i64> {
        let conn = self.lock()?;
        let n = conn.query_row("SELECT COUNT(*) FROM game_records", [], |r| r.get(0))?;
        Ok(n)
    }

    // ── Recommendations & outcomes ───────────────────────────────────────────

    pub fn insert_recommendation(&self, rec: &Recommendation) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO recommendations (
                round_id, recommended_at, tick, zone, action, confidence,
                suggested_stake, profile, survival_probability, horizon_ticks,
                patterns
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                rec.round_id,
                rec.timestamp,
                rec.tick,
                rec.zone.as_str(),
                rec.action.as_str(),
                rec.confidence,
                rec.suggested_stake,
                rec.profile.map(|p| p.as_str()),
                rec.survival_probability,
                rec.horizon_ticks,
                serde_json::to_string(&rec.patterns)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_outcome(&self, out: &Outcome) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO outcomes (
                round_id, recommended_at, ticks_to_termination,
                within_horizon, from_incomplete_record, resolved_at
             ) VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                out.round_id,
                out.recommended_at,
                out.ticks_to_termination,
                serde_json::to_string(&out.within_horizon)?,
                out.from_incomplete_record,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn count_outcomes(&self) -> Result<i64> {
        let conn = self.lock()?;
        let n = conn.query_row("SELECT COUNT(*) FROM outcomes", [], |r| r.get(0))?;
        Ok(n)
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    pub fn get_stats(&self) -> Result<Stats> {
        let conn = self.lock()?;
        let (rounds, early, incomplete, mean_duration): (i64, i64, i64, Option<f64>) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(is_early_termination), 0),
                        COALESCE(SUM(incomplete), 0),
                        AVG(duration_ticks)
                 FROM game_records",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )?;
        let recommendations: i64 =
            conn.query_row("SELECT COUNT(*) FROM recommendations", [], |r| r.get(0))?;
        let last_round_at: Option<DateTime<Utc>> = conn.query_row(
            "SELECT MAX(completed_at) FROM game_records",
            [],
            |r| r.get(0),
        )?;
        Ok(Stats {
            rounds,
            early_terminations: early,
            incomplete_rounds: incomplete,
            mean_duration: mean_duration.unwrap_or(0.0),
            recommendations,
            last_round_at,
        })
    }

    /// Apply one queued command.
    pub fn apply(&self, cmd: &PersistCommand) -> Result<()> {
        match cmd {
            PersistCommand::Record(rec) => self.insert_game_record(rec),
            PersistCommand::Batch(recs) => self.insert_game_records(recs).map(|_| ()),
            PersistCommand::Recommendation(rec) => self.insert_recommendation(rec).map(|_| ()),
            PersistCommand::Outcome(out) => self.insert_outcome(out),
        }
    }
}

/// Drains the persistence queue until every sender is dropped. Failures are
/// logged and the command is dropped.
pub async fn run_persistence(db: Database, mut rx: mpsc::Receiver<PersistCommand>) {
    info!("Persistence worker started");
    while let Some(cmd) = rx.recv().await {
        let db = db.clone();
        let res = tokio::task::spawn_blocking(move || db.apply(&cmd)).await;
        match res {
            Ok(Ok(())) => debug!("Persisted command"),
            Ok(Err(e)) => error!("Persistence failed: {}", e),
            Err(e) => error!("Persistence task panicked: {}", e),
        }
    }
    info!("Persistence worker stopped");
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn insert_record(conn: &Connection, rec: &GameRecord) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO game_records (
            round_id, duration_ticks, peak_value, final_value,
            is_early_termination, volatility_mean, volatility_max,
            trade_volume, incomplete, revealed_seed, completed_at
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        params![
            rec.round_id,
            rec.duration_ticks,
            rec.peak_value,
            rec.final_value,
            rec.is_early_termination,
            rec.volatility.mean,
            rec.volatility.max,
            rec.trade_volume,
            rec.incomplete,
            rec.revealed_seed,
            rec.completed_at,
        ],
    )
}

fn map_game_record(row: &rusqlite::Row) -> rusqlite::Result<GameRecord> {
    Ok(GameRecord {
        round_id: row.get(0)?,
        duration_ticks: row.get(1)?,
        peak_value: row.get(2)?,
        final_value: row.get(3)?,
        is_early_termination: row.get(4)?,
        volatility: VolatilitySummary {
            mean: row.get(5)?,
            max: row.get(6)?,
        },
        trade_volume: row.get(7)?,
        incomplete: row.get(8)?,
        revealed_seed: row.get(9)?,
        completed_at: row.get(10)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS game_records (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    round_id             TEXT    NOT NULL UNIQUE,
    duration_ticks       INTEGER NOT NULL,
    peak_value           REAL    NOT NULL,
    final_value          REAL    NOT NULL,
    is_early_termination INTEGER NOT NULL,
    volatility_mean      REAL    NOT NULL,
    volatility_max       REAL    NOT NULL,
    trade_volume         REAL    NOT NULL DEFAULT 0,
    incomplete           INTEGER NOT NULL DEFAULT 0,
    revealed_seed        TEXT,
    completed_at         TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS recommendations (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    round_id             TEXT    NOT NULL,
    recommended_at       TEXT    NOT NULL,
    tick                 INTEGER NOT NULL,
    zone                 TEXT    NOT NULL,
    action               TEXT    NOT NULL,
    confidence           REAL    NOT NULL,
    suggested_stake      REAL    NOT NULL,
    profile              TEXT,
    survival_probability REAL    NOT NULL,
    horizon_ticks        INTEGER NOT NULL,
    patterns             TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS outcomes (
    round_id               TEXT    NOT NULL,
    recommended_at         TEXT    NOT NULL,
    ticks_to_termination   INTEGER NOT NULL,
    within_horizon         TEXT    NOT NULL,
    from_incomplete_record INTEGER NOT NULL DEFAULT 0,
    resolved_at            TEXT    NOT NULL,
    PRIMARY KEY (round_id, recommended_at)
);

CREATE INDEX IF NOT EXISTS idx_game_records_completed ON game_records(completed_at);
CREATE INDEX IF NOT EXISTS idx_recommendations_round ON recommendations(round_id);
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub rounds: i64,
    pub early_terminations: i64,
    pub incomplete_rounds: i64,
    pub mean_duration: f64,
    pub recommendations: i64,
    pub last_round_at: Option<DateTime<Utc>>,
}
