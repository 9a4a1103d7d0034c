//! Dispatcher: leases queue references, stamps ownership in the store,
//! recovers expired leases, runs handlers, and settles outcomes through the
//! retry policy.
//!
//! Workers drive the dispatcher by calling [`Dispatcher::poll_once`] in a
//! loop. All coordination happens through the store's compare-and-set update
//! and the queue's atomic lease; there is no worker-to-worker channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{Instrument, error, info, info_span, warn};

use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::handler::{HandlerError, JobContext};
use crate::model::{Job, JobId, JobState, Lease};
use crate::retry::RetryPolicy;
use crate::store::jobs::JobUpdate;
use crate::store::queue::QueueMessage;

use super::Engine;

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long a leased reference stays hidden from other workers. Also the
    /// lease deadline stamped on the job.
    pub visibility_timeout: Duration,
    /// How long idle workers wait before polling again.
    pub poll_interval: Duration,
    /// Upper bound on one handler execution; exceeding it fails the attempt.
    pub handler_timeout: Duration,
    /// Global cap on leased + running jobs. Leasing pauses at the cap.
    pub max_in_flight: usize,
    /// Optional per-handler in-flight caps, by handler name.
    pub per_handler_limits: HashMap<String, usize>,
    /// Bounded retries for compare-and-set races against other mutators.
    pub cas_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            // Kept below the visibility timeout so a slow handler fails its
            // attempt before the queue re-delivers the reference.
            handler_timeout: Duration::from_secs(30),
            max_in_flight: 16,
            per_handler_limits: HashMap::new(),
            cas_retries: 3,
        }
    }
}

/// What one poll accomplished. `Idle` tells the worker to back off for a
/// poll interval before trying again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polled {
    /// A job was processed (or a stale reference was settled).
    Ran,
    /// Nothing ready, or backpressure is holding leasing back.
    Idle,
}

/// Dispatch core shared by all workers.
pub struct Dispatcher {
    engine: Arc<Engine>,
    retry: RetryPolicy,
    config: DispatcherConfig,
    in_flight: AtomicUsize,
    per_handler: Mutex<HashMap<String, usize>>,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>, retry: RetryPolicy, config: DispatcherConfig) -> Self {
        if config.handler_timeout >= config.visibility_timeout {
            warn!(
                handler_timeout_ms = config.handler_timeout.as_millis() as u64,
                visibility_timeout_ms = config.visibility_timeout.as_millis() as u64,
                "handler timeout reaches the visibility timeout; overrunning attempts will be re-delivered"
            );
        }
        Self {
            engine,
            retry,
            config,
            in_flight: AtomicUsize::new(0),
            per_handler: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    /// Jobs currently being executed through this dispatcher.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Lease and process at most one job on behalf of `worker_id`.
    pub async fn poll_once(&self, worker_id: &str) -> Result<Polled> {
        // Backpressure fast path: at the cap we stop leasing entirely.
        // References stay queued; nothing is lost. The authoritative claim
        // is the check-and-increment in try_claim_slot.
        if self.in_flight.load(Ordering::Acquire) >= self.config.max_in_flight {
            return Ok(Polled::Idle);
        }

        let store = self.engine.store();
        let Some(msg) = store.lease_next(worker_id, self.config.visibility_timeout)? else {
            return Ok(Polled::Idle);
        };

        let job = match store.get_job(msg.job_id) {
            Ok(job) => job,
            Err(Error::NotFound(_)) => {
                // Job purged while a reference lingered. Drop the reference.
                store.ack(msg.msg_id)?;
                return Ok(Polled::Ran);
            }
            Err(e) => return Err(e),
        };

        let span = info_span!("job", id = %job.id, handler = %job.handler, worker = worker_id);
        self.dispatch(worker_id, job, msg).instrument(span).await
    }

    async fn dispatch(&self, worker_id: &str, mut job: Job, msg: QueueMessage) -> Result<Polled> {
        let store = self.engine.store();

        if job.state.is_terminal() {
            // Settled elsewhere (cancel, expiry recovery). Drop the reference.
            store.ack(msg.msg_id)?;
            return Ok(Polled::Ran);
        }

        // A visible reference for a Leased/Running job means its lease
        // expired without an ack: the holding worker crashed or overran.
        if matches!(job.state, JobState::Leased | JobState::Running) {
            self.recover_expired(job, &msg)?;
            return Ok(Polled::Ran);
        }

        // Repair a crash between settling an attempt and re-enqueueing: the
        // job is stuck in Retrying but its reference just became visible.
        if job.state == JobState::Retrying {
            job = match self.cas(job.id, |_| {
                JobUpdate::new().state(JobState::Pending).clear_lease()
            }) {
                Ok(job) => job,
                Err(Error::InvalidTransition { .. }) => {
                    // Cancelled while stuck; the cancel path settled it.
                    self.release_reference(job.id, msg.msg_id)?;
                    return Ok(Polled::Ran);
                }
                Err(e) => return Err(e),
            };
        }

        if job.cancel_requested {
            match self.cas(job.id, |_| {
                JobUpdate::new().state(JobState::Cancelled).clear_lease()
            }) {
                Ok(cancelled) => {
                    store.ack(msg.msg_id)?;
                    store.record_event(EventKind::JobCancelled { id: cancelled.id })?;
                    info!("cancelled before lease");
                }
                Err(Error::InvalidTransition { .. }) => {
                    self.release_reference(job.id, msg.msg_id)?;
                }
                Err(e) => return Err(e),
            }
            return Ok(Polled::Ran);
        }

        // Per-handler backpressure: leave the job pending, hide the
        // reference for one poll interval, free the worker.
        let Some(guard) = self.try_claim_slot(&job.handler) else {
            store.nack(msg.msg_id, self.config.poll_interval)?;
            return Ok(Polled::Idle);
        };

        let deadline = Utc::now()
            + chrono::Duration::from_std(self.config.visibility_timeout)
                .map_err(|e| Error::Other(format!("visibility timeout out of range: {e}")))?;
        let job = match self.cas(job.id, |_| {
            JobUpdate::new().state(JobState::Leased).lease(Lease {
                owner: worker_id.to_string(),
                deadline,
            })
        }) {
            Ok(job) => job,
            Err(Error::InvalidTransition { .. }) => {
                // The job moved under us (cancelled, or reclaimed).
                self.release_reference(job.id, msg.msg_id)?;
                return Ok(Polled::Ran);
            }
            Err(e) => return Err(e),
        };
        store.record_event(EventKind::JobLeased {
            id: job.id,
            worker_id: worker_id.to_string(),
        })?;

        let result = self.execute(worker_id, job, &msg).await;
        drop(guard);
        result?;
        Ok(Polled::Ran)
    }

    /// Run one attempt of a leased job and settle the outcome.
    async fn execute(&self, worker_id: &str, job: Job, msg: &QueueMessage) -> Result<()> {
        let store = self.engine.store();

        let Some(handler) = self.engine.registry().get(&job.handler).cloned() else {
            // Registered at submission but gone now; this process simply
            // doesn't serve the handler. Terminal failure, never silent.
            warn!("no handler registered, failing job");
            let settled = self.settle(job.id, msg, |_| {
                JobUpdate::new()
                    .state(JobState::Failed)
                    .error(format!("no handler registered for {:?}", job.handler))
                    .clear_lease()
            })?;
            if let Some(failed) = settled {
                store.record_event(EventKind::JobFailed {
                    id: failed.id,
                    error: failed.error.clone().unwrap_or_default(),
                    attempts: failed.attempts,
                })?;
            }
            return Ok(());
        };

        // Worker confirms start; this is where the attempt is consumed.
        let job = match self.cas(job.id, |_| {
            JobUpdate::new()
                .state(JobState::Running)
                .increment_attempts()
        }) {
            Ok(job) => job,
            Err(Error::InvalidTransition { .. }) => {
                self.release_reference(job.id, msg.msg_id)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let attempt = job.attempts;

        // Cancellation requested between submission and start: honor it
        // before doing any work.
        if job.cancel_requested {
            let settled = self.settle(job.id, msg, |_| {
                JobUpdate::new().state(JobState::Cancelled).clear_lease()
            })?;
            if let Some(settled) = settled {
                store.record_event(EventKind::JobCancelled { id: settled.id })?;
                info!("cancelled before handler ran");
            }
            return Ok(());
        }
        store.record_event(EventKind::JobStarted {
            id: job.id,
            worker_id: worker_id.to_string(),
            attempt,
        })?;
        info!(attempt, "attempt started");

        let ctx = JobContext::new(Arc::clone(store), job.id, attempt);
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.config.handler_timeout, handler.execute(&ctx, job.payload.clone()))
                .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(result)) => {
                let settled = self.settle(job.id, msg, |_| {
                    JobUpdate::new()
                        .state(JobState::Succeeded)
                        .result(result.clone())
                        .clear_lease()
                })?;
                if let Some(settled) = settled {
                    store.record_event(EventKind::JobSucceeded {
                        id: settled.id,
                        attempt,
                        duration_ms,
                    })?;
                    info!(attempt, duration_ms, "attempt succeeded");
                }
            }
            Ok(Err(HandlerError::Cancelled)) => {
                let settled = self.settle(job.id, msg, |_| {
                    JobUpdate::new().state(JobState::Cancelled).clear_lease()
                })?;
                if let Some(settled) = settled {
                    store.record_event(EventKind::JobCancelled { id: settled.id })?;
                    info!(attempt, "handler observed cancellation");
                }
            }
            Ok(Err(HandlerError::Fatal(e))) => {
                let settled = self.settle(job.id, msg, |_| {
                    JobUpdate::new()
                        .state(JobState::Failed)
                        .error(format!("fatal: {e}"))
                        .clear_lease()
                })?;
                if let Some(settled) = settled {
                    store.record_event(EventKind::JobFailed {
                        id: settled.id,
                        error: settled.error.clone().unwrap_or_default(),
                        attempts: settled.attempts,
                    })?;
                    error!(attempt, error = %e, "fatal handler error");
                }
            }
            Ok(Err(HandlerError::Failed(e))) => {
                self.fail_attempt(job.id, msg, attempt, &e)?;
            }
            Err(_elapsed) => {
                let e = format!(
                    "handler timed out after {:?}",
                    self.config.handler_timeout
                );
                self.fail_attempt(job.id, msg, attempt, &e)?;
            }
        }

        Ok(())
    }

    /// Record a failed attempt: terminal failure once attempts are
    /// exhausted, otherwise schedule a retry after the backoff delay.
    fn fail_attempt(&self, id: JobId, msg: &QueueMessage, attempt: u32, error: &str) -> Result<()> {
        let store = self.engine.store();
        let job = store.get_job(id)?;

        if attempt >= job.max_attempts {
            let settled = self.settle(id, msg, |_| {
                JobUpdate::new()
                    .state(JobState::Failed)
                    .error(error)
                    .clear_lease()
            })?;
            if let Some(settled) = settled {
                store.record_event(EventKind::JobFailed {
                    id,
                    error: error.to_string(),
                    attempts: settled.attempts,
                })?;
                error!(attempt, error, "attempts exhausted, job failed");
            }
            return Ok(());
        }

        let retrying = self.cas(id, |_| {
            JobUpdate::new()
                .state(JobState::Retrying)
                .error(error)
                .clear_lease()
        });
        let retrying = match retrying {
            Ok(job) => job,
            Err(Error::InvalidTransition { .. }) => {
                // The job moved while we were failing it (cancellation, or
                // another worker already recovered it).
                self.release_reference(id, msg.msg_id)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let delay = self.retry.compute_delay(attempt);
        store.nack(msg.msg_id, delay)?;
        match self.cas(id, |_| JobUpdate::new().state(JobState::Pending)) {
            Ok(_) => {}
            // Cancelled in the gap; the cancel path already cleaned up.
            Err(Error::InvalidTransition { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        store.record_event(EventKind::JobRetried {
            id,
            error: error.to_string(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        })?;
        warn!(attempt = retrying.attempts, error, delay_ms = delay.as_millis() as u64, "attempt failed, retrying");
        Ok(())
    }

    /// A lease expired without an ack: count it as a failed attempt and
    /// either fail the job or put it back in line.
    fn recover_expired(&self, job: Job, msg: &QueueMessage) -> Result<()> {
        let store = self.engine.store();
        let owner = job
            .lease
            .as_ref()
            .map(|l| l.owner.clone())
            .unwrap_or_default();

        // A job that never confirmed start still consumed its attempt.
        let unconfirmed = job.state == JobState::Leased;
        let attempt = if unconfirmed { job.attempts + 1 } else { job.attempts };

        store.record_event(EventKind::LeaseExpired {
            id: job.id,
            owner: owner.clone(),
            attempt,
        })?;
        warn!(owner = %owner, attempt, "lease expired without ack");

        if job.cancel_requested || attempt >= job.max_attempts {
            let (state, error) = if job.cancel_requested {
                (JobState::Cancelled, None)
            } else {
                (JobState::Failed, Some("lease expired".to_string()))
            };
            let settled = self.settle(job.id, msg, |_| {
                let mut update = JobUpdate::new().state(state).clear_lease();
                if unconfirmed {
                    update = update.increment_attempts();
                }
                if let Some(ref e) = error {
                    update = update.error(e.clone());
                }
                update
            })?;
            if let Some(settled) = settled {
                match state {
                    JobState::Cancelled => {
                        store.record_event(EventKind::JobCancelled { id: settled.id })?
                    }
                    _ => store.record_event(EventKind::JobFailed {
                        id: settled.id,
                        error: "lease expired".to_string(),
                        attempts: settled.attempts,
                    })?,
                };
            }
            return Ok(());
        }

        match self.cas(job.id, move |_| {
            let mut update = JobUpdate::new()
                .state(JobState::Retrying)
                .error("lease expired")
                .clear_lease();
            if unconfirmed {
                update = update.increment_attempts();
            }
            update
        }) {
            Ok(_) => {}
            // The holder settled after all, or the job was cancelled.
            Err(Error::InvalidTransition { .. }) => {
                self.release_reference(job.id, msg.msg_id)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        let delay = self.retry.compute_delay(attempt);
        store.nack(msg.msg_id, delay)?;
        match self.cas(job.id, |_| JobUpdate::new().state(JobState::Pending)) {
            Ok(_) => {}
            Err(Error::InvalidTransition { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        store.record_event(EventKind::JobRetried {
            id: job.id,
            error: "lease expired".to_string(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        })?;
        Ok(())
    }

    /// Apply a terminal settle and ack the reference. Returns `None` when
    /// the job moved through another path first; in that case the reference
    /// is only dropped if the job is settled.
    fn settle(
        &self,
        id: JobId,
        msg: &QueueMessage,
        build: impl Fn(&Job) -> JobUpdate,
    ) -> Result<Option<Job>> {
        let store = self.engine.store();
        match self.cas(id, build) {
            Ok(job) => {
                store.ack(msg.msg_id)?;
                Ok(Some(job))
            }
            Err(Error::InvalidTransition { from, to }) => {
                warn!(%from, %to, "job moved under us, dropping this outcome");
                self.release_reference(id, msg.msg_id)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// A compare-and-set lost to a concurrent transition. The queue
    /// reference may only be dropped once the job is settled; a job another
    /// worker recovered back into the queue owns its reference again, and
    /// acking it here would strand the job outside the queue forever.
    fn release_reference(&self, id: JobId, msg_id: i64) -> Result<()> {
        let store = self.engine.store();
        match store.get_job(id) {
            Ok(job) if job.state.is_terminal() => store.ack(msg_id),
            Ok(_) => Ok(()),
            Err(Error::NotFound(_)) => store.ack(msg_id),
            Err(e) => Err(e),
        }
    }

    /// Read-modify-write with bounded retries on version conflicts. Store
    /// races (a concurrent cancel mark, for example) are transient; the
    /// update is rebuilt against the fresh job each time.
    fn cas(&self, id: JobId, build: impl Fn(&Job) -> JobUpdate) -> Result<Job> {
        let store = self.engine.store();
        let mut conflict = None;
        for _ in 0..=self.config.cas_retries {
            let job = store.get_job(id)?;
            match store.update_job(id, job.version, build(&job)) {
                Ok(updated) => return Ok(updated),
                Err(e @ Error::VersionConflict { .. }) => {
                    conflict = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(conflict.unwrap_or_else(|| Error::Other(format!("cas retries exhausted for {id}"))))
    }

    /// Claim an in-flight slot for a handler, or `None` at a cap. The global
    /// claim is a check-and-increment, so concurrent claimers racing past the
    /// poll-time fast path cannot collectively overshoot the cap.
    fn try_claim_slot(&self, handler: &str) -> Option<SlotGuard<'_>> {
        let mut per_handler = self.per_handler.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&limit) = self.config.per_handler_limits.get(handler)
            && per_handler.get(handler).copied().unwrap_or(0) >= limit
        {
            return None;
        }

        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.config.max_in_flight {
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }

        *per_handler.entry(handler.to_string()).or_insert(0) += 1;
        Some(SlotGuard {
            dispatcher: self,
            handler: handler.to_string(),
        })
    }
}

/// Releases the global and per-handler slots when an attempt finishes,
/// however it finishes.
struct SlotGuard<'a> {
    dispatcher: &'a Dispatcher,
    handler: String,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.in_flight.fetch_sub(1, Ordering::AcqRel);
        let mut per_handler = self
            .dispatcher
            .per_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(count) = per_handler.get_mut(&self.handler) {
            *count = count.saturating_sub(1);
        }
    }
}
