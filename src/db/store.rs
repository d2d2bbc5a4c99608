//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::watch::WatchTarget;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("point target {0} is not on an aggregate device topic")]
    InvalidTopic(String),
    #[error("store connection lock poisoned")]
    Poisoned,
}

/// Thread-safe availability log store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // --- Agent runs ---

    /// Record the start of an agent run.
    pub fn start_run(&self, start: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO agent_log (start_time, stop_time) VALUES (?1, NULL)",
            params![format_db_time(start)],
        )?;
        Ok(())
    }

    /// Fill in the stop time of the most recent run.
    pub fn finish_run(&self, stop: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE agent_log SET stop_time = ?1 WHERE rowid = (SELECT MAX(rowid) FROM agent_log)",
            params![format_db_time(stop)],
        )?;
        Ok(())
    }

    /// Most recent runs first.
    pub fn agent_runs(&self, limit: u32) -> Result<Vec<AgentRunEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT start_time, stop_time FROM agent_log ORDER BY rowid DESC LIMIT ?1",
        )?;

        let runs = stmt
            .query_map(params![limit], |row| {
                let start: String = row.get(0)?;
                let stop: Option<String> = row.get(1)?;
                Ok(AgentRunEntry {
                    start_time: parse_db_time(&start).unwrap_or_else(Utc::now),
                    stop_time: stop.as_deref().and_then(parse_db_time),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(runs)
    }

    // --- Topic log ---

    /// Open a timeout row for each target.
    ///
    /// `last_seen` of `None` means the target was never seen, in which case
    /// `fallback` (the agent start time) is recorded instead. Targets that
    /// already have an open row are skipped.
    pub fn log_timeout(
        &self,
        targets: &[(WatchTarget, Option<DateTime<Utc>>)],
        fallback: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if targets.is_empty() {
            return Ok(());
        }

        let rows = targets
            .iter()
            .map(|(target, last_seen)| {
                let topic = canonical_topic(target)?;
                Ok((topic, last_seen.unwrap_or(fallback)))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO topic_log (topic, last_seen_before_timeout, first_seen_after_timeout)
                 SELECT ?1, ?2, NULL
                 WHERE NOT EXISTS (
                     SELECT 1 FROM topic_log WHERE topic = ?1 AND first_seen_after_timeout IS NULL
                 )",
            )?;

            for (topic, last_seen) in &rows {
                stmt.execute(params![topic, format_db_time(*last_seen)])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Close the newest open row of each target with `up_time`.
    pub fn log_recovery(
        &self,
        targets: &[WatchTarget],
        up_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if targets.is_empty() {
            return Ok(());
        }

        let topics = targets
            .iter()
            .map(canonical_topic)
            .collect::<Result<Vec<_>, StoreError>>()?;

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "UPDATE topic_log SET first_seen_after_timeout = ?1
                 WHERE rowid = (
                     SELECT rowid FROM topic_log
                     WHERE topic = ?2 AND first_seen_after_timeout IS NULL
                     ORDER BY rowid DESC LIMIT 1
                 )",
            )?;

            for topic in &topics {
                stmt.execute(params![format_db_time(up_time), topic])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Log rows newest first, optionally restricted to one stored topic.
    pub fn topic_log(&self, topic: Option<&str>, limit: u32) -> Result<Vec<LogEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT topic, last_seen_before_timeout, first_seen_after_timeout FROM topic_log
             WHERE ?1 IS NULL OR topic = ?1
             ORDER BY rowid DESC LIMIT ?2",
        )?;

        let entries = stmt
            .query_map(params![topic, limit], row_to_entry)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(entries)
    }

    /// The open (still down) row for a stored topic, if any.
    pub fn open_timeout(&self, topic: &str) -> Result<Option<LogEntry>, StoreError> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                "SELECT topic, last_seen_before_timeout, first_seen_after_timeout FROM topic_log
                 WHERE topic = ?1 AND first_seen_after_timeout IS NULL
                 ORDER BY rowid DESC LIMIT 1",
                params![topic],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Downtime of `topic` within `[start, end)`.
    ///
    /// Outages still open are counted as down until `end`.
    pub fn downtime(
        &self,
        topic: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DowntimeReport, StoreError> {
        let entries = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT topic, last_seen_before_timeout, first_seen_after_timeout FROM topic_log
                 WHERE topic = ?1
                   AND last_seen_before_timeout < ?3
                   AND (first_seen_after_timeout IS NULL OR first_seen_after_timeout > ?2)
                 ORDER BY last_seen_before_timeout ASC",
            )?;
            let rows = stmt
                .query_map(
                    params![topic, format_db_time(start), format_db_time(end)],
                    row_to_entry,
                )?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };

        let mut down_seconds = 0;
        for entry in &entries {
            let down_from = entry.last_seen_before_timeout.max(start);
            let down_until = entry.first_seen_after_timeout.unwrap_or(end).min(end);
            if down_until > down_from {
                down_seconds += (down_until - down_from).num_seconds();
            }
        }

        let window = (end - start).num_seconds();
        let availability = if window > 0 {
            1.0 - (down_seconds.min(window) as f64 / window as f64)
        } else {
            1.0
        };

        Ok(DowntimeReport {
            topic: topic.to_string(),
            start,
            end,
            down_seconds,
            outages: entries.len(),
            availability,
        })
    }
}

fn canonical_topic(target: &WatchTarget) -> Result<String, StoreError> {
    target
        .log_topic()
        .ok_or_else(|| StoreError::InvalidTopic(target.to_string()))
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> SqlResult<LogEntry> {
    let last_seen: String = row.get(1)?;
    let first_seen: Option<String> = row.get(2)?;
    Ok(LogEntry {
        topic: row.get(0)?,
        last_seen_before_timeout: parse_db_time(&last_seen).unwrap_or_else(Utc::now),
        first_seen_after_timeout: first_seen.as_deref().and_then(parse_db_time),
    })
}

fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
