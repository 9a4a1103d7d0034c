//! Core engine: the public API for submitting and managing jobs.
//!
//! The engine owns the store and the handler registry. Submission, status,
//! cancellation, and health all go through here; execution is driven by the
//! [`Dispatcher`] and [`WorkerPool`].

pub mod dispatcher;
pub mod workers;

pub use dispatcher::{Dispatcher, DispatcherConfig, Polled};
pub use workers::WorkerPool;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use tracing::info;

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::handler::HandlerRegistry;
use crate::model::{Health, Job, JobId, JobState, JobStatus, NewJob};
use crate::store::Store;
use crate::store::jobs::{JobFilter, JobUpdate};

/// Bounded retries for read-modify-write loops that race other mutators.
const CAS_RETRIES: u32 = 5;

/// The job engine. Validates submissions and enforces lifecycle invariants.
pub struct Engine {
    store: Arc<Store>,
    registry: Arc<HandlerRegistry>,
    /// Attempt limit applied when a submission doesn't specify one.
    pub default_max_attempts: u32,
    workers: AtomicUsize,
}

impl Engine {
    pub fn new(store: Arc<Store>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            store,
            registry,
            default_max_attempts: 3,
            workers: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub(crate) fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Submit a new job: persisted in `Pending` state and enqueued, in one
    /// transaction. Fails with `UnknownHandler` for unregistered names.
    pub fn submit(&self, new: NewJob) -> Result<Job> {
        if !self.registry.contains(&new.handler) {
            return Err(Error::UnknownHandler(new.handler));
        }

        let now = Utc::now();
        let job = Job {
            id: JobId::new(),
            handler: new.handler,
            payload: new.payload,
            priority: new.priority,
            state: JobState::Pending,
            attempts: 0,
            max_attempts: new.max_attempts.unwrap_or(self.default_max_attempts).max(1),
            cancel_requested: false,
            lease: None,
            result: None,
            error: None,
            version: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        self.store.submit_job(&job)?;
        info!(id = %job.id, handler = %job.handler, priority = job.priority, "job submitted");
        Ok(job)
    }

    /// Get a job by ID.
    pub fn get(&self, id: JobId) -> Result<Job> {
        self.store.get_job(id)
    }

    /// Status summary for the submission surface.
    pub fn status(&self, id: JobId) -> Result<JobStatus> {
        self.store.get_job(id).map(JobStatus::from)
    }

    /// List jobs matching a filter.
    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.list_jobs(filter)
    }

    /// Request cancellation. Idempotent: terminal jobs and jobs already
    /// marked are returned unchanged.
    ///
    /// A job that hasn't been leased is removed from the queue and cancelled
    /// immediately. An in-flight job is only marked; its worker observes the
    /// flag cooperatively.
    pub fn cancel(&self, id: JobId) -> Result<Job> {
        let mut conflict = None;
        for _ in 0..=CAS_RETRIES {
            let job = self.store.get_job(id)?;

            if job.state.is_terminal() {
                return Ok(job);
            }

            let result = match job.state {
                JobState::Pending | JobState::Retrying => self.store.update_job(
                    id,
                    job.version,
                    JobUpdate::new()
                        .state(JobState::Cancelled)
                        .cancel_requested(true)
                        .clear_lease(),
                ),
                JobState::Leased | JobState::Running => {
                    if job.cancel_requested {
                        return Ok(job);
                    }
                    self.store
                        .update_job(id, job.version, JobUpdate::new().cancel_requested(true))
                }
                // Terminal states returned above.
                _ => return Ok(job),
            };

            match result {
                Ok(updated) => {
                    if updated.state == JobState::Cancelled {
                        self.store.remove_queued(id)?;
                        self.store.record_event(EventKind::JobCancelled { id })?;
                        info!(id = %id, "job cancelled before execution");
                    } else {
                        info!(id = %id, "cancellation requested for in-flight job");
                    }
                    return Ok(updated);
                }
                Err(e @ Error::VersionConflict { .. }) => {
                    conflict = Some(e);
                    continue;
                }
                // The state moved under us in a way that makes the update
                // illegal; re-read and decide again.
                Err(Error::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(conflict.unwrap_or_else(|| Error::Other(format!("cancel of {id} kept conflicting"))))
    }

    /// Snapshot of queue depth, in-flight jobs, and attached workers.
    pub fn health(&self) -> Result<Health> {
        Ok(Health {
            queue_depth: self.store.queue_depth()?,
            in_flight: self
                .store
                .count_in_states(&[JobState::Leased, JobState::Running])?,
            worker_count: self.workers.load(Ordering::Relaxed),
        })
    }

    /// Get lifecycle events since a sequence number.
    pub fn events_since(&self, since_seq: u64) -> Result<Vec<Event>> {
        self.store.get_events_since(since_seq)
    }

    /// Delete terminal jobs that finished before the cutoff.
    pub fn purge_terminal(&self, finished_before: chrono::DateTime<Utc>) -> Result<usize> {
        self.store.purge_terminal(finished_before)
    }

    pub(crate) fn workers_attached(&self, n: usize) {
        self.workers.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn worker_detached(&self) {
        self.workers.fetch_sub(1, Ordering::Relaxed);
    }
}
