//! Structured events emitted by the engine on every state transition.
//!
//! Consumers read the event stream to build dashboards, alerting, or audit
//! logs. Events record what the engine decided; job results live on the job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::JobId;

/// A structured event emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    JobSubmitted {
        id: JobId,
        handler: String,
        priority: i32,
        max_attempts: u32,
    },
    JobLeased {
        id: JobId,
        worker_id: String,
    },
    JobStarted {
        id: JobId,
        worker_id: String,
        attempt: u32,
    },
    JobSucceeded {
        id: JobId,
        attempt: u32,
        duration_ms: u64,
    },
    JobRetried {
        id: JobId,
        error: String,
        attempt: u32,
        delay_ms: u64,
    },
    JobFailed {
        id: JobId,
        error: String,
        attempts: u32,
    },
    JobCancelled {
        id: JobId,
    },
    LeaseExpired {
        id: JobId,
        owner: String,
        attempt: u32,
    },
    /// Event written by a future version this build doesn't know about.
    Unknown {
        raw: String,
    },
}
