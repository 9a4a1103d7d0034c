//! Job operations: submit, lookup, compare-and-set mutation, listing.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use rusqlite::types::Value as SqlValue;

use super::{fmt_ts, parse_ts, parse_ts_or_now, record_event_on};
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::{Job, JobId, JobState, Lease};

/// A mutation applied to a job through the compare-and-set contract.
///
/// Only the fields set on the update are written; everything else is left
/// untouched. The store validates the state transition, bumps the version
/// counter, refreshes `updated_at`, and stamps `finished_at` when the new
/// state is terminal.
#[derive(Default)]
pub struct JobUpdate {
    state: Option<JobState>,
    lease: Option<Lease>,
    clear_lease: bool,
    increment_attempts: bool,
    result: Option<serde_json::Value>,
    error: Option<String>,
    cancel_requested: Option<bool>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn lease(mut self, lease: Lease) -> Self {
        self.lease = Some(lease);
        self.clear_lease = false;
        self
    }

    pub fn clear_lease(mut self) -> Self {
        self.lease = None;
        self.clear_lease = true;
        self
    }

    pub fn increment_attempts(mut self) -> Self {
        self.increment_attempts = true;
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn cancel_requested(mut self, requested: bool) -> Self {
        self.cancel_requested = Some(requested);
        self
    }
}

/// Filter for listing jobs.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub handler: Option<String>,
    pub limit: Option<u32>,
}

impl Store {
    /// Persist a new job and enqueue a reference for it, atomically.
    ///
    /// The job must be in `Pending` state. Fails with `DuplicateId` if the id
    /// already exists. Returns the queue message id.
    pub fn submit_job(&self, job: &Job) -> Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        insert_job_on(&tx, job)?;
        let msg_id = super::queue::enqueue_on(&tx, job.id, job.priority, None)?;
        record_event_on(
            &tx,
            EventKind::JobSubmitted {
                id: job.id,
                handler: job.handler.clone(),
                priority: job.priority,
                max_attempts: job.max_attempts,
            },
        )?;

        tx.commit()?;
        Ok(msg_id)
    }

    /// Get a job by ID.
    pub fn get_job(&self, id: JobId) -> Result<Job> {
        get_job_on(&self.conn(), id)
    }

    /// Apply a compare-and-set mutation to a job.
    ///
    /// Fails with `VersionConflict` if the job's version no longer matches
    /// `expected_version`, and with `InvalidTransition` if the update's state
    /// change is not allowed from the job's current state. Returns the
    /// updated job.
    pub fn update_job(&self, id: JobId, expected_version: i64, update: JobUpdate) -> Result<Job> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let current = get_job_on(&tx, id)?;
        if current.version != expected_version {
            return Err(Error::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
            });
        }

        if let Some(to) = update.state
            && !current.state.can_transition_to(to)
        {
            return Err(Error::InvalidTransition {
                from: current.state,
                to,
            });
        }

        let now = Utc::now();
        let mut sets: Vec<String> = vec!["version = version + 1".to_string()];
        let mut values: Vec<SqlValue> = Vec::new();

        fn set(sets: &mut Vec<String>, values: &mut Vec<SqlValue>, column: &str, value: SqlValue) {
            values.push(value);
            sets.push(format!("{column} = ?{}", values.len()));
        }

        set(&mut sets, &mut values, "updated_at", SqlValue::Text(fmt_ts(now)));
        if update.increment_attempts {
            sets.push("attempts = attempts + 1".to_string());
        }
        if let Some(state) = update.state {
            set(&mut sets, &mut values, "state", SqlValue::Text(state.to_string()));
            if state.is_terminal() {
                values.push(SqlValue::Text(fmt_ts(now)));
                sets.push(format!(
                    "finished_at = COALESCE(finished_at, ?{})",
                    values.len()
                ));
            }
        }
        if let Some(ref lease) = update.lease {
            set(&mut sets, &mut values, "lease_owner", SqlValue::Text(lease.owner.clone()));
            set(
                &mut sets,
                &mut values,
                "lease_deadline",
                SqlValue::Text(fmt_ts(lease.deadline)),
            );
        } else if update.clear_lease {
            set(&mut sets, &mut values, "lease_owner", SqlValue::Null);
            set(&mut sets, &mut values, "lease_deadline", SqlValue::Null);
        }
        if let Some(ref result) = update.result {
            set(
                &mut sets,
                &mut values,
                "result",
                SqlValue::Text(serde_json::to_string(result).unwrap_or_default()),
            );
        }
        if let Some(ref error) = update.error {
            set(&mut sets, &mut values, "error", SqlValue::Text(error.clone()));
        }
        if let Some(requested) = update.cancel_requested {
            set(
                &mut sets,
                &mut values,
                "cancel_requested",
                SqlValue::Integer(requested as i64),
            );
        }

        values.push(SqlValue::Text(id.0.to_string()));
        let id_idx = values.len();
        values.push(SqlValue::Integer(expected_version));
        let version_idx = values.len();

        let sql = format!(
            "UPDATE jobs SET {} WHERE id = ?{id_idx} AND version = ?{version_idx}",
            sets.join(", ")
        );

        let rows_affected = tx.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        if rows_affected == 0 {
            return Err(Error::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
            });
        }

        let updated = get_job_on(&tx, id)?;
        tx.commit()?;
        Ok(updated)
    }

    /// List jobs matching a filter, most recent first.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut clauses = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(state) = filter.state {
            values.push(SqlValue::Text(state.to_string()));
            clauses.push(format!("state = ?{}", values.len()));
        }
        if let Some(ref handler) = filter.handler {
            values.push(SqlValue::Text(handler.clone()));
            clauses.push(format!("handler = ?{}", values.len()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        values.push(SqlValue::Integer(filter.limit.unwrap_or(50) as i64));
        let limit_idx = values.len();

        let sql = format!(
            "SELECT * FROM jobs {where_clause} ORDER BY created_at DESC, id DESC LIMIT ?{limit_idx}"
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), |row| {
                Ok(row_to_job(row))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(row.map_err(|e| Error::Other(format!("parse error: {e}")))?);
        }
        Ok(jobs)
    }

    /// Count jobs currently in any of the given states.
    pub fn count_in_states(&self, states: &[JobState]) -> Result<u64> {
        if states.is_empty() {
            return Ok(0);
        }
        let placeholders = (1..=states.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT COUNT(*) FROM jobs WHERE state IN ({placeholders})");
        let values: Vec<SqlValue> = states
            .iter()
            .map(|s| SqlValue::Text(s.to_string()))
            .collect();

        let count: i64 = self
            .conn()
            .query_row(&sql, rusqlite::params_from_iter(values.iter()), |row| {
                row.get(0)
            })?;
        Ok(count as u64)
    }

    /// Delete terminal jobs that finished before the cutoff. Returns how many
    /// were removed. The only path that ever destroys a job record.
    pub fn purge_terminal(&self, finished_before: chrono::DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        // Terminal jobs have no live queue references, but a crash between
        // settle and ack can leave one behind. Clear them before the FK check.
        tx.execute(
            "DELETE FROM queue WHERE job_id IN (
                 SELECT id FROM jobs
                 WHERE state IN ('succeeded', 'failed', 'cancelled')
                 AND finished_at IS NOT NULL AND finished_at < ?1
             )",
            params![fmt_ts(finished_before)],
        )?;
        let removed = tx.execute(
            "DELETE FROM jobs
             WHERE state IN ('succeeded', 'failed', 'cancelled')
             AND finished_at IS NOT NULL AND finished_at < ?1",
            params![fmt_ts(finished_before)],
        )?;
        tx.commit()?;
        Ok(removed)
    }
}

use super::Store;

fn insert_job_on(conn: &Connection, job: &Job) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM jobs WHERE id = ?1",
            params![job.id.0.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Err(Error::DuplicateId(job.id.to_string()));
    }

    conn.execute(
        "INSERT INTO jobs (
            id, handler, payload, priority, state, attempts, max_attempts,
            cancel_requested, lease_owner, lease_deadline, result, error,
            version, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            job.id.0.to_string(),
            job.handler,
            serde_json::to_string(&job.payload).unwrap_or_default(),
            job.priority,
            job.state.to_string(),
            job.attempts,
            job.max_attempts,
            job.cancel_requested,
            job.lease.as_ref().map(|l| l.owner.clone()),
            job.lease.as_ref().map(|l| fmt_ts(l.deadline)),
            job.result
                .as_ref()
                .map(|r| serde_json::to_string(r).unwrap_or_default()),
            job.error,
            job.version,
            fmt_ts(job.created_at),
            fmt_ts(job.updated_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn get_job_on(conn: &Connection, id: JobId) -> Result<Job> {
    conn.query_row(
        "SELECT * FROM jobs WHERE id = ?1",
        params![id.0.to_string()],
        |row| Ok(row_to_job(row)),
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(id.to_string()))?
    .map_err(|e| Error::Other(format!("failed to parse job: {e}")))
}

// ---------------------------------------------------------------------------
// Row parsing
// ---------------------------------------------------------------------------

fn row_to_job(row: &rusqlite::Row) -> std::result::Result<Job, String> {
    let id_str: String = row.get(0).map_err(|e| e.to_string())?;
    let payload_str: String = row.get(2).map_err(|e| e.to_string())?;
    let state_str: String = row.get(4).map_err(|e| e.to_string())?;
    let lease_owner: Option<String> = row.get(8).map_err(|e| e.to_string())?;
    let lease_deadline: Option<String> = row.get(9).map_err(|e| e.to_string())?;
    let result_str: Option<String> = row.get(10).map_err(|e| e.to_string())?;
    let created_str: String = row.get(13).map_err(|e| e.to_string())?;
    let updated_str: String = row.get(14).map_err(|e| e.to_string())?;
    let finished_str: Option<String> = row.get(15).map_err(|e| e.to_string())?;

    let lease = match (lease_owner, lease_deadline) {
        (Some(owner), Some(deadline)) => Some(Lease {
            owner,
            deadline: parse_ts(&deadline).map_err(|e| e.to_string())?,
        }),
        _ => None,
    };

    Ok(Job {
        id: JobId(id_str.parse().map_err(|e: uuid::Error| e.to_string())?),
        handler: row.get(1).map_err(|e| e.to_string())?,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        priority: row.get(3).map_err(|e| e.to_string())?,
        state: state_str.parse().map_err(|e: Error| e.to_string())?,
        attempts: row.get(5).map_err(|e| e.to_string())?,
        max_attempts: row.get(6).map_err(|e| e.to_string())?,
        cancel_requested: row.get(7).map_err(|e| e.to_string())?,
        lease,
        result: result_str.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get(11).map_err(|e| e.to_string())?,
        version: row.get(12).map_err(|e| e.to_string())?,
        created_at: parse_ts(&created_str).map_err(|e| e.to_string())?,
        updated_at: parse_ts(&updated_str).map_err(|e| e.to_string())?,
        finished_at: finished_str.map(|s| parse_ts_or_now(&s)),
    })
}
