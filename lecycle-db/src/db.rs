use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use crate::models::{
    Cycle, CycleStatus, DrawRecord, MatchResult, NewPrediction, NewTrainingLog, Prediction,
    TrainingLogEntry, TrainingStatus,
};

// Sessions are stored as '' rather than NULL: SQLite treats NULLs as distinct
// inside UNIQUE constraints.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS draws (
    variant      TEXT NOT NULL,
    draw_id      TEXT NOT NULL,
    session      TEXT NOT NULL DEFAULT '',
    draw_date    TEXT NOT NULL,
    numbers      TEXT NOT NULL,
    special      INTEGER,
    ingested_at  TEXT NOT NULL,
    PRIMARY KEY (variant, draw_id, session)
);

CREATE TABLE IF NOT EXISTS cycles (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    variant        TEXT NOT NULL,
    cycle_number   INTEGER NOT NULL,
    status         TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'completed')),
    draws_tracked  INTEGER NOT NULL DEFAULT 0,
    max_draws      INTEGER NOT NULL CHECK (max_draws > 0),
    model_version  TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    completed_at   TEXT,
    evaluated_at   TEXT,
    UNIQUE (variant, cycle_number),
    CHECK (draws_tracked BETWEEN 0 AND max_draws)
);

CREATE UNIQUE INDEX IF NOT EXISTS cycles_one_active_per_variant
    ON cycles (variant) WHERE status = 'active';

CREATE TABLE IF NOT EXISTS predictions (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    cycle_id       INTEGER NOT NULL UNIQUE REFERENCES cycles (id) ON DELETE CASCADE,
    numbers        TEXT NOT NULL,
    special        INTEGER,
    model_version  TEXT NOT NULL,
    created_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS match_results (
    cycle_id           INTEGER NOT NULL REFERENCES cycles (id) ON DELETE CASCADE,
    draw_id            TEXT NOT NULL,
    session            TEXT NOT NULL DEFAULT '',
    draw_date          TEXT NOT NULL,
    position           INTEGER NOT NULL CHECK (position > 0),
    predicted_numbers  TEXT NOT NULL,
    predicted_special  INTEGER,
    actual_numbers     TEXT NOT NULL,
    actual_special     INTEGER,
    matched_numbers    TEXT NOT NULL,
    matched_count      INTEGER NOT NULL,
    special_matched    INTEGER NOT NULL,
    prize_level        TEXT NOT NULL,
    matched_at         TEXT NOT NULL,
    PRIMARY KEY (cycle_id, draw_id, session),
    UNIQUE (cycle_id, position)
);

CREATE TABLE IF NOT EXISTS training_logs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    variant         TEXT NOT NULL,
    cycle_id        INTEGER REFERENCES cycles (id) ON DELETE SET NULL,
    trigger_reason  TEXT NOT NULL,
    params_before   TEXT,
    params_after    TEXT,
    performance     TEXT NOT NULL,
    status          TEXT NOT NULL CHECK (status IN ('triggered', 'success', 'failed', 'skipped')),
    job_ref         TEXT,
    message         TEXT,
    created_at      TEXT NOT NULL,
    resolved_at     TEXT
);

CREATE INDEX IF NOT EXISTS training_logs_by_variant ON training_logs (variant, id);
";

const CYCLE_COLUMNS: &str = "id, variant, cycle_number, status, draws_tracked, max_draws, model_version, created_at, completed_at, evaluated_at";

const MATCH_COLUMNS: &str = "cycle_id, draw_id, session, draw_date, position, predicted_numbers, predicted_special, actual_numbers, actual_special, matched_numbers, matched_count, special_matched, prize_level, matched_at";

const LOG_COLUMNS: &str = "id, variant, cycle_id, trigger_reason, params_before, params_after, performance, status, job_ref, message, created_at, resolved_at";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn db_path() -> std::path::PathBuf {
    let mut path = std::env::current_dir().unwrap_or_default();
    path.push("data");
    path.push("lecycle.db");
    path
}

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Impossible de créer le répertoire {:?}", parent))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Impossible d'ouvrir la base {:?}", path))?;
    configure(&conn).context("Impossible de configurer la connexion")?;
    Ok(conn)
}

/// In-memory database with pragmas and schema applied.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrate(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA).context("Échec de la migration")?;
    Ok(())
}

impl ToSql for CycleStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for CycleStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        CycleStatus::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown cycle status '{}'", s).into()))
    }
}

impl ToSql for TrainingStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TrainingStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        TrainingStatus::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown training status '{}'", s).into()))
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, name: &str) -> rusqlite::Result<T> {
    let text: String = row.get(name)?;
    serde_json::from_str(&text).map_err(|e| {
        let idx = row.as_ref().column_index(name).unwrap_or_default();
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

fn optional_json_column(row: &Row, name: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let text: Option<String> = row.get(name)?;
    match text {
        None => Ok(None),
        Some(_) => json_column(row, name).map(Some),
    }
}

fn session_key(session: &Option<String>) -> &str {
    session.as_deref().unwrap_or("")
}

fn session_column(row: &Row, name: &str) -> rusqlite::Result<Option<String>> {
    let key: String = row.get(name)?;
    Ok(if key.is_empty() { None } else { Some(key) })
}

fn cycle_from_row(row: &Row) -> rusqlite::Result<Cycle> {
    Ok(Cycle {
        id: row.get("id")?,
        variant: row.get("variant")?,
        cycle_number: row.get("cycle_number")?,
        status: row.get("status")?,
        draws_tracked: row.get("draws_tracked")?,
        max_draws: row.get("max_draws")?,
        model_version: row.get("model_version")?,
        created_at: row.get("created_at")?,
        completed_at: row.get("completed_at")?,
        evaluated_at: row.get("evaluated_at")?,
    })
}

fn match_from_row(row: &Row) -> rusqlite::Result<MatchResult> {
    Ok(MatchResult {
        cycle_id: row.get("cycle_id")?,
        draw_id: row.get("draw_id")?,
        session: session_column(row, "session")?,
        draw_date: row.get("draw_date")?,
        position: row.get("position")?,
        predicted_numbers: json_column(row, "predicted_numbers")?,
        predicted_special: row.get("predicted_special")?,
        actual_numbers: json_column(row, "actual_numbers")?,
        actual_special: row.get("actual_special")?,
        matched_numbers: json_column(row, "matched_numbers")?,
        matched_count: row.get("matched_count")?,
        special_matched: row.get("special_matched")?,
        prize_level: row.get("prize_level")?,
        matched_at: row.get("matched_at")?,
    })
}

fn log_from_row(row: &Row) -> rusqlite::Result<TrainingLogEntry> {
    Ok(TrainingLogEntry {
        id: row.get("id")?,
        variant: row.get("variant")?,
        cycle_id: row.get("cycle_id")?,
        trigger_reason: row.get("trigger_reason")?,
        params_before: optional_json_column(row, "params_before")?,
        params_after: optional_json_column(row, "params_after")?,
        performance: json_column(row, "performance")?,
        status: row.get("status")?,
        job_ref: row.get("job_ref")?,
        message: row.get("message")?,
        created_at: row.get("created_at")?,
        resolved_at: row.get("resolved_at")?,
    })
}

// ── draws ─────────────────────────────────────────────────────────

/// Returns false when the draw was already stored.
pub fn insert_draw(conn: &Connection, draw: &DrawRecord, ingested_at: DateTime<Utc>) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO draws (variant, draw_id, session, draw_date, numbers, special, ingested_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            draw.variant,
            draw.draw_id,
            session_key(&draw.session),
            draw.date,
            to_json(&draw.numbers)?,
            draw.special,
            ingested_at,
        ],
    )?;
    Ok(changed > 0)
}

fn draw_from_row(row: &Row) -> rusqlite::Result<DrawRecord> {
    Ok(DrawRecord {
        variant: row.get("variant")?,
        draw_id: row.get("draw_id")?,
        date: row.get("draw_date")?,
        session: session_column(row, "session")?,
        numbers: json_column(row, "numbers")?,
        special: row.get("special")?,
    })
}

pub fn fetch_draw(
    conn: &Connection,
    variant: &str,
    draw_id: &str,
    session: &Option<String>,
) -> rusqlite::Result<Option<DrawRecord>> {
    conn.query_row(
        "SELECT variant, draw_id, session, draw_date, numbers, special
         FROM draws WHERE variant = ?1 AND draw_id = ?2 AND session = ?3",
        params![variant, draw_id, session_key(session)],
        draw_from_row,
    )
    .optional()
}

pub fn fetch_last_draws(conn: &Connection, variant: &str, limit: u32) -> rusqlite::Result<Vec<DrawRecord>> {
    let mut stmt = conn.prepare(
        "SELECT variant, draw_id, session, draw_date, numbers, special
         FROM draws WHERE variant = ?1
         ORDER BY draw_date DESC, draw_id DESC, session DESC LIMIT ?2",
    )?;
    let draws = stmt
        .query_map(params![variant, limit], draw_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(draws)
}

/// When the draw was first stored; replays keep the original timestamp.
pub fn draw_ingested_at(
    conn: &Connection,
    variant: &str,
    draw_id: &str,
    session: &Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    conn.query_row(
        "SELECT ingested_at FROM draws WHERE variant = ?1 AND draw_id = ?2 AND session = ?3",
        params![variant, draw_id, session_key(session)],
        |row| row.get(0),
    )
    .optional()
}

pub fn count_draws(conn: &Connection, variant: &str) -> rusqlite::Result<u32> {
    conn.query_row("SELECT COUNT(*) FROM draws WHERE variant = ?1", [variant], |row| row.get(0))
}

// ── cycles ────────────────────────────────────────────────────────

pub fn active_cycle(conn: &Connection, variant: &str) -> rusqlite::Result<Option<Cycle>> {
    conn.query_row(
        &format!("SELECT {CYCLE_COLUMNS} FROM cycles WHERE variant = ?1 AND status = 'active'"),
        [variant],
        cycle_from_row,
    )
    .optional()
}

pub fn count_active_cycles(conn: &Connection, variant: &str) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM cycles WHERE variant = ?1 AND status = 'active'",
        [variant],
        |row| row.get(0),
    )
}

pub fn fetch_cycle(conn: &Connection, cycle_id: i64) -> rusqlite::Result<Option<Cycle>> {
    conn.query_row(
        &format!("SELECT {CYCLE_COLUMNS} FROM cycles WHERE id = ?1"),
        [cycle_id],
        cycle_from_row,
    )
    .optional()
}

pub fn next_cycle_number(conn: &Connection, variant: &str) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(cycle_number), 0) + 1 FROM cycles WHERE variant = ?1",
        [variant],
        |row| row.get(0),
    )
}

pub fn insert_cycle(
    conn: &Connection,
    variant: &str,
    cycle_number: u32,
    max_draws: u32,
    model_version: &str,
    created_at: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO cycles (variant, cycle_number, status, draws_tracked, max_draws, model_version, created_at)
         VALUES (?1, ?2, 'active', 0, ?3, ?4, ?5)",
        params![variant, cycle_number, max_draws, model_version, created_at],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Conditional increment: only moves an active cycle that still has room.
/// Returns the new counter, or None when the guard did not match.
pub fn advance_draws_tracked(conn: &Connection, cycle_id: i64) -> rusqlite::Result<Option<u32>> {
    conn.query_row(
        "UPDATE cycles SET draws_tracked = draws_tracked + 1
         WHERE id = ?1 AND status = 'active' AND draws_tracked < max_draws
         RETURNING draws_tracked",
        [cycle_id],
        |row| row.get(0),
    )
    .optional()
}

/// active → completed. Returns false if the cycle was not active.
pub fn complete_cycle(conn: &Connection, cycle_id: i64, completed_at: DateTime<Utc>) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE cycles SET status = 'completed', completed_at = ?2 WHERE id = ?1 AND status = 'active'",
        params![cycle_id, completed_at],
    )?;
    Ok(changed > 0)
}

/// Returns false if the cycle was already evaluated (or is not completed).
pub fn mark_evaluated(conn: &Connection, cycle_id: i64, evaluated_at: DateTime<Utc>) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE cycles SET evaluated_at = ?2
         WHERE id = ?1 AND status = 'completed' AND evaluated_at IS NULL",
        params![cycle_id, evaluated_at],
    )?;
    Ok(changed > 0)
}

pub fn cycles_pending_evaluation(conn: &Connection, variant: &str) -> rusqlite::Result<Vec<Cycle>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CYCLE_COLUMNS} FROM cycles
         WHERE variant = ?1 AND status = 'completed' AND evaluated_at IS NULL
         ORDER BY cycle_number ASC"
    ))?;
    let cycles = stmt
        .query_map([variant], cycle_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cycles)
}

/// Completed cycles strictly older than `before_number`, most recent first.
pub fn completed_cycles_before(
    conn: &Connection,
    variant: &str,
    before_number: u32,
    limit: u32,
) -> rusqlite::Result<Vec<Cycle>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CYCLE_COLUMNS} FROM cycles
         WHERE variant = ?1 AND status = 'completed' AND cycle_number < ?2
         ORDER BY cycle_number DESC LIMIT ?3"
    ))?;
    let cycles = stmt
        .query_map(params![variant, before_number, limit], cycle_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cycles)
}

pub fn list_cycles(conn: &Connection, variant: Option<&str>, limit: u32) -> rusqlite::Result<Vec<Cycle>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CYCLE_COLUMNS} FROM cycles
         WHERE ?1 IS NULL OR variant = ?1
         ORDER BY created_at DESC, id DESC LIMIT ?2"
    ))?;
    let cycles = stmt
        .query_map(params![variant, limit], cycle_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cycles)
}

/// Removes the cycle; its prediction and match results go with it.
pub fn delete_cycle(conn: &Connection, cycle_id: i64) -> rusqlite::Result<bool> {
    let changed = conn.execute("DELETE FROM cycles WHERE id = ?1", [cycle_id])?;
    Ok(changed > 0)
}

// ── predictions ───────────────────────────────────────────────────

pub fn insert_prediction(
    conn: &Connection,
    cycle_id: i64,
    prediction: &NewPrediction,
    created_at: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO predictions (cycle_id, numbers, special, model_version, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            cycle_id,
            to_json(&prediction.numbers)?,
            prediction.special,
            prediction.model_version,
            created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn fetch_prediction(conn: &Connection, cycle_id: i64) -> rusqlite::Result<Option<Prediction>> {
    conn.query_row(
        "SELECT id, cycle_id, numbers, special, model_version, created_at
         FROM predictions WHERE cycle_id = ?1",
        [cycle_id],
        |row| {
            Ok(Prediction {
                id: row.get("id")?,
                cycle_id: row.get("cycle_id")?,
                numbers: json_column(row, "numbers")?,
                special: row.get("special")?,
                model_version: row.get("model_version")?,
                created_at: row.get("created_at")?,
            })
        },
    )
    .optional()
}

// ── match_results ─────────────────────────────────────────────────

/// Returns false when (cycle, draw, session) is already recorded.
pub fn insert_match_result(conn: &Connection, result: &MatchResult) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO match_results ({MATCH_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            result.cycle_id,
            result.draw_id,
            session_key(&result.session),
            result.draw_date,
            result.position,
            to_json(&result.predicted_numbers)?,
            result.predicted_special,
            to_json(&result.actual_numbers)?,
            result.actual_special,
            to_json(&result.matched_numbers)?,
            result.matched_count,
            result.special_matched,
            result.prize_level,
            result.matched_at,
        ],
    )?;
    Ok(changed > 0)
}

pub fn match_exists(conn: &Connection, cycle_id: i64, draw_id: &str, session: &Option<String>) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM match_results WHERE cycle_id = ?1 AND draw_id = ?2 AND session = ?3)",
        params![cycle_id, draw_id, session_key(session)],
        |row| row.get(0),
    )
}

pub fn match_results_for_cycle(conn: &Connection, cycle_id: i64) -> rusqlite::Result<Vec<MatchResult>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MATCH_COLUMNS} FROM match_results WHERE cycle_id = ?1 ORDER BY position ASC"
    ))?;
    let rows = stmt
        .query_map([cycle_id], match_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── training_logs ─────────────────────────────────────────────────

pub fn insert_training_log(conn: &Connection, entry: &NewTrainingLog, created_at: DateTime<Utc>) -> rusqlite::Result<i64> {
    let params_before = match &entry.params_before {
        Some(value) => Some(to_json(value)?),
        None => None,
    };
    conn.execute(
        "INSERT INTO training_logs (variant, cycle_id, trigger_reason, params_before, performance, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.variant,
            entry.cycle_id,
            entry.trigger_reason,
            params_before,
            to_json(&entry.performance)?,
            entry.status,
            created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn set_training_job_ref(conn: &Connection, log_id: i64, job_ref: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE training_logs SET job_ref = ?2 WHERE id = ?1",
        params![log_id, job_ref],
    )?;
    Ok(changed > 0)
}

/// Moves a `triggered` entry to its final status. Entries already resolved
/// are left untouched and false is returned.
pub fn resolve_training_log(
    conn: &Connection,
    log_id: i64,
    status: TrainingStatus,
    params_after: Option<&serde_json::Value>,
    message: Option<&str>,
    resolved_at: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let params_after = match params_after {
        Some(value) => Some(to_json(value)?),
        None => None,
    };
    let changed = conn.execute(
        "UPDATE training_logs
         SET status = ?2, params_after = COALESCE(?3, params_after), message = COALESCE(?4, message), resolved_at = ?5
         WHERE id = ?1 AND status = 'triggered'",
        params![log_id, status, params_after, message, resolved_at],
    )?;
    Ok(changed > 0)
}

pub fn fetch_training_log(conn: &Connection, log_id: i64) -> rusqlite::Result<Option<TrainingLogEntry>> {
    conn.query_row(
        &format!("SELECT {LOG_COLUMNS} FROM training_logs WHERE id = ?1"),
        [log_id],
        log_from_row,
    )
    .optional()
}

pub fn training_logs_for_cycle(conn: &Connection, cycle_id: i64) -> rusqlite::Result<Vec<TrainingLogEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LOG_COLUMNS} FROM training_logs WHERE cycle_id = ?1 ORDER BY id ASC"
    ))?;
    let rows = stmt
        .query_map([cycle_id], log_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn fetch_training_logs(conn: &Connection, variant: Option<&str>, limit: u32) -> rusqlite::Result<Vec<TrainingLogEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LOG_COLUMNS} FROM training_logs
         WHERE ?1 IS NULL OR variant = ?1
         ORDER BY id DESC LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![variant, limit], log_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
