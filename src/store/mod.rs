//! SQLite storage layer.
//!
//! Single source of truth for all job state, the queue, and the event
//! stream. WAL mode for concurrent read access. Job mutations go through the
//! compare-and-set contract in [`jobs`]; queue operations live in [`queue`].

pub mod jobs;
pub mod queue;

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};

/// Storage backend. Owns the SQLite connection.
///
/// The connection is guarded by a mutex; every public method takes the lock
/// once and releases it before returning, so the store is safe to share
/// between the dispatcher and workers behind an `Arc`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock means a panic mid-operation; any open transaction
        // was rolled back on drop, so the connection is still usable.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn();
        // WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id               TEXT PRIMARY KEY,
                handler          TEXT NOT NULL,
                payload          TEXT NOT NULL DEFAULT 'null',
                priority         INTEGER NOT NULL DEFAULT 0,
                state            TEXT NOT NULL DEFAULT 'pending',
                attempts         INTEGER NOT NULL DEFAULT 0,
                max_attempts     INTEGER NOT NULL,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                lease_owner      TEXT,
                lease_deadline   TEXT,
                result           TEXT,
                error            TEXT,
                version          INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                finished_at      TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
            CREATE INDEX IF NOT EXISTS idx_jobs_handler ON jobs(handler, state);

            CREATE TABLE IF NOT EXISTS queue (
                msg_id      INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id      TEXT NOT NULL REFERENCES jobs(id),
                priority    INTEGER NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL,
                visible_at  TEXT NOT NULL,
                read_ct     INTEGER NOT NULL DEFAULT 0,
                leased_by   TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_queue_ready
                ON queue(visible_at, priority DESC, msg_id ASC);

            CREATE TABLE IF NOT EXISTS events (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp   TEXT NOT NULL,
                kind        TEXT NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    /// Simple health check — run a SELECT 1.
    pub fn health_check(&self) -> Result<()> {
        self.conn().execute_batch("SELECT 1")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Record an event and return it with its sequence number.
    pub fn record_event(&self, kind: EventKind) -> Result<Event> {
        record_event_on(&self.conn(), kind)
    }

    /// Get events since a sequence number.
    pub fn get_events_since(&self, since_seq: u64) -> Result<Vec<Event>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT seq, timestamp, kind FROM events WHERE seq > ?1 ORDER BY seq ASC")?;

        let events = stmt
            .query_map(params![since_seq as i64], |row| {
                let kind_str: String = row.get(2)?;
                Ok(Event {
                    seq: row.get::<_, i64>(0)? as u64,
                    timestamp: parse_ts_or_now(&row.get::<_, String>(1)?),
                    kind: serde_json::from_str(&kind_str)
                        .unwrap_or(EventKind::Unknown { raw: kind_str }),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }
}

pub(crate) fn record_event_on(conn: &Connection, kind: EventKind) -> Result<Event> {
    let now = Utc::now();

    conn.execute(
        "INSERT INTO events (timestamp, kind) VALUES (?1, ?2)",
        params![
            fmt_ts(now),
            serde_json::to_string(&kind).unwrap_or_default(),
        ],
    )?;

    let seq = conn.last_insert_rowid();

    Ok(Event {
        seq: seq as u64,
        timestamp: now,
        kind,
    })
}

// ---------------------------------------------------------------------------
// Timestamp helpers
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 with microseconds, so lexicographic comparison in SQL
/// matches chronological order. Queue visibility depends on this.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("invalid timestamp {s:?}: {e}")))
}

pub(crate) fn parse_ts_or_now(s: &str) -> DateTime<Utc> {
    parse_ts(s).unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_fixed_width_and_ordered() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::milliseconds(1);
        let a = fmt_ts(earlier);
        let b = fmt_ts(later);
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_ts(&a).unwrap(), earlier);
    }

    #[test]
    fn malformed_event_json_returns_unknown_variant() {
        let store = Store::in_memory().unwrap();

        store
            .conn()
            .execute(
                "INSERT INTO events (timestamp, kind) VALUES (?1, ?2)",
                params![fmt_ts(Utc::now()), "this is not valid json {{{"],
            )
            .unwrap();

        let events = store.get_events_since(0).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            EventKind::Unknown { raw } => assert_eq!(raw, "this is not valid json {{{"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }
}
