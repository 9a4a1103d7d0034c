//! Core data model.
//!
//! A job is a unit of asynchronous work. It has identity, an opaque payload,
//! the name of the handler that executes it, and a lifecycle state tracked by
//! the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A job tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier. Immutable for the store's lifetime.
    pub id: JobId,

    /// Name of the registered handler that executes this job.
    pub handler: String,

    /// Arbitrary payload for the handler. The engine doesn't interpret it.
    pub payload: serde_json::Value,

    /// Priority. Higher = leased sooner. FIFO within a priority class.
    pub priority: i32,

    /// Current lifecycle state.
    pub state: JobState,

    /// Number of execution attempts started so far.
    pub attempts: u32,

    /// Maximum attempts before the job goes terminally failed.
    pub max_attempts: u32,

    /// Set when cancellation was requested. In-flight handlers observe this
    /// cooperatively; not-yet-leased jobs are cancelled immediately.
    pub cancel_requested: bool,

    /// Active lease, if a worker currently owns this job.
    pub lease: Option<Lease>,

    /// Result data from a successful attempt.
    pub result: Option<serde_json::Value>,

    /// Error detail from the most recent failed attempt.
    pub error: Option<String>,

    /// Optimistic concurrency counter. Incremented on every update.
    pub version: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// A worker's exclusive claim on a job, valid until the deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    /// Identifier of the worker holding the lease.
    pub owner: String,
    /// When the lease expires and the job becomes reclaimable.
    pub deadline: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted and enqueued, waiting for a worker.
    Pending,
    /// A worker holds the lease, execution starting.
    Leased,
    /// Handler actively executing.
    Running,
    /// Attempt failed, waiting for its backoff delay before re-queue.
    Retrying,
    /// Done successfully. Terminal.
    Succeeded,
    /// Exhausted attempts or lease expired past the limit. Terminal.
    Failed,
    /// Cancelled before or during execution. Terminal.
    Cancelled,
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Leased)
                | (Pending, Cancelled)
                | (Leased, Running)
                | (Leased, Retrying)   // lease expired before start confirm
                | (Leased, Failed)     // lease expired, attempts exhausted
                | (Leased, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Running, Cancelled)
                | (Retrying, Pending)  // re-enqueued after backoff
                | (Retrying, Cancelled)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Leased => "leased",
            JobState::Running => "running",
            JobState::Retrying => "retrying",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "leased" => Ok(JobState::Leased),
            "running" => Ok(JobState::Running),
            "retrying" => Ok(JobState::Retrying),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            _ => Err(crate::error::Error::Other(format!("unknown state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Status view
// ---------------------------------------------------------------------------

/// Status summary exposed to the submission surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobStatus {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            state: job.state,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            result: job.result,
            error: job.error,
            created_at: job.created_at,
            updated_at: job.updated_at,
            finished_at: job.finished_at,
        }
    }
}

/// Snapshot of engine health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// References in the queue, ready or hidden behind a visibility timeout.
    pub queue_depth: u64,
    /// Jobs currently leased or running.
    pub in_flight: u64,
    /// Workers attached to the engine.
    pub worker_count: usize,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for submitting new jobs. The engine's public submission input.
pub struct NewJob {
    pub(crate) handler: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) priority: i32,
    pub(crate) max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            payload: serde_json::Value::Null,
            priority: 0,
            max_attempts: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Override the engine's default attempt limit for this job.
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        use JobState::*;
        let all = [Pending, Leased, Running, Retrying, Succeeded, Failed, Cancelled];
        for from in [Succeeded, Failed, Cancelled] {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} should be disallowed");
            }
        }
    }

    #[test]
    fn no_transition_skips_running() {
        assert!(!JobState::Pending.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Leased.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Pending.can_transition_to(JobState::Running));
    }

    #[test]
    fn state_round_trips_through_display() {
        use JobState::*;
        for state in [Pending, Leased, Running, Retrying, Succeeded, Failed, Cancelled] {
            let parsed: JobState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }
}
