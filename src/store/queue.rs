//! Durable queue of ready-to-run job references.
//!
//! Visibility-timeout semantics: `lease_next` hides one ready reference from
//! other leasers for the timeout; if it is not acked before the timeout
//! elapses, the reference becomes visible again. Delivery is at-least-once,
//! never at-most-once. Ordering is FIFO per priority class, a target rather
//! than a strict guarantee, since delayed and retried references interleave.

use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::{Store, fmt_ts, parse_ts};
use crate::error::{Error, Result};
use crate::model::JobId;

/// A queue reference granted to a leaser.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub msg_id: i64,
    pub job_id: JobId,
    pub priority: i32,
    /// How many times this reference has been leased, this lease included.
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    /// When the current lease expires and the reference reappears.
    pub visible_at: chrono::DateTime<chrono::Utc>,
}

impl Store {
    /// Append a reference to the queue. `not_before` delays first delivery.
    /// Returns the message id.
    pub fn enqueue(
        &self,
        job_id: JobId,
        priority: i32,
        not_before: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<i64> {
        enqueue_on(&self.conn(), job_id, priority, not_before)
    }

    /// Lease the next ready reference, hiding it for `visibility_timeout`.
    /// Returns `None` when nothing is ready.
    pub fn lease_next(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let now = Utc::now();
        let row: Option<(i64, String, i32, i32, String)> = tx
            .query_row(
                "SELECT msg_id, job_id, priority, read_ct, enqueued_at FROM queue
                 WHERE visible_at <= ?1
                 ORDER BY priority DESC, msg_id ASC
                 LIMIT 1",
                params![fmt_ts(now)],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((msg_id, job_id_str, priority, read_ct, enqueued_str)) = row else {
            return Ok(None);
        };

        let visible_at = now
            + chrono::Duration::from_std(visibility_timeout)
                .map_err(|e| Error::Other(format!("visibility timeout out of range: {e}")))?;

        tx.execute(
            "UPDATE queue SET visible_at = ?1, read_ct = read_ct + 1, leased_by = ?2
             WHERE msg_id = ?3",
            params![fmt_ts(visible_at), worker_id, msg_id],
        )?;
        tx.commit()?;

        let job_id = JobId(
            job_id_str
                .parse()
                .map_err(|e: uuid::Error| Error::Other(format!("bad job id in queue: {e}")))?,
        );

        Ok(Some(QueueMessage {
            msg_id,
            job_id,
            priority,
            read_ct: read_ct + 1,
            enqueued_at: parse_ts(&enqueued_str)?,
            visible_at,
        }))
    }

    /// Permanently remove an acknowledged reference.
    pub fn ack(&self, msg_id: i64) -> Result<()> {
        self.conn()
            .execute("DELETE FROM queue WHERE msg_id = ?1", params![msg_id])?;
        Ok(())
    }

    /// Return a reference to the queue, visible again after `delay`.
    pub fn nack(&self, msg_id: i64, delay: Duration) -> Result<()> {
        let visible_at = Utc::now()
            + chrono::Duration::from_std(delay)
                .map_err(|e| Error::Other(format!("nack delay out of range: {e}")))?;
        self.conn().execute(
            "UPDATE queue SET visible_at = ?1, leased_by = NULL WHERE msg_id = ?2",
            params![fmt_ts(visible_at), msg_id],
        )?;
        Ok(())
    }

    /// Remove all references for a job, leased or not. Used by cancellation.
    /// Returns whether anything was removed.
    pub fn remove_queued(&self, job_id: JobId) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM queue WHERE job_id = ?1",
            params![job_id.0.to_string()],
        )?;
        Ok(removed > 0)
    }

    /// Total references in the queue, ready or hidden.
    pub fn queue_depth(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

pub(crate) fn enqueue_on(
    conn: &Connection,
    job_id: JobId,
    priority: i32,
    not_before: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<i64> {
    let now = Utc::now();
    let visible_at = not_before.unwrap_or(now);
    conn.execute(
        "INSERT INTO queue (job_id, priority, enqueued_at, visible_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            job_id.0.to_string(),
            priority,
            fmt_ts(now),
            fmt_ts(visible_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}
