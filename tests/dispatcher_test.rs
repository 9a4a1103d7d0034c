//! End-to-end dispatch tests: lease, execute, retry, recover, cancel.
//!
//! Scenarios poll the dispatcher directly for determinism; the worker-pool
//! test at the end exercises real concurrent workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;

use eventops::engine::{Dispatcher, DispatcherConfig, Engine, Polled, WorkerPool};
use eventops::event::EventKind;
use eventops::handler::{Handler, HandlerError, HandlerRegistry, JobContext};
use eventops::model::{Job, JobId, JobState, Lease, NewJob};
use eventops::retry::RetryPolicy;
use eventops::store::Store;
use eventops::store::jobs::JobUpdate;

// ---------------------------------------------------------------------------
// Test handlers
// ---------------------------------------------------------------------------

struct Ok200;

#[async_trait]
impl Handler for Ok200 {
    async fn execute(
        &self,
        _ctx: &JobContext,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        Ok(payload)
    }
}

struct AlwaysFail;

#[async_trait]
impl Handler for AlwaysFail {
    async fn execute(
        &self,
        _ctx: &JobContext,
        _payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        Err(HandlerError::Failed("boom".to_string()))
    }
}

struct FatalFail;

#[async_trait]
impl Handler for FatalFail {
    async fn execute(
        &self,
        _ctx: &JobContext,
        _payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        Err(HandlerError::Fatal("bad payload".to_string()))
    }
}

/// Fails the first `fail_before` attempts, then succeeds.
struct Flaky {
    fail_before: u32,
    calls: AtomicU32,
}

#[async_trait]
impl Handler for Flaky {
    async fn execute(
        &self,
        _ctx: &JobContext,
        _payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_before {
            Err(HandlerError::Failed(format!("transient #{call}")))
        } else {
            Ok(json!({"call": call}))
        }
    }
}

/// Loops until cancellation is requested, checking cooperatively.
struct UntilCancelled;

#[async_trait]
impl Handler for UntilCancelled {
    async fn execute(
        &self,
        ctx: &JobContext,
        _payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        for _ in 0..400 {
            if ctx.cancel_requested() {
                return Err(HandlerError::Cancelled);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(json!("never cancelled"))
    }
}

/// Sleeps longer than any reasonable handler timeout.
struct Slow;

#[async_trait]
impl Handler for Slow {
    async fn execute(
        &self,
        _ctx: &JobContext,
        _payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(json!(null))
    }
}

/// Blocks until the test releases a permit.
struct Gated {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Handler for Gated {
    async fn execute(
        &self,
        _ctx: &JobContext,
        _payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;
        permit.forget();
        Ok(json!(null))
    }
}

/// Detects a job executing concurrently with itself.
struct Overlap {
    active: Mutex<HashMap<JobId, u32>>,
    violated: AtomicBool,
}

#[async_trait]
impl Handler for Overlap {
    async fn execute(
        &self,
        ctx: &JobContext,
        _payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(ctx.job_id).or_insert(0);
            *count += 1;
            if *count > 1 {
                self.violated.store(true, Ordering::SeqCst);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut active = self.active.lock().unwrap();
        *active.get_mut(&ctx.job_id).unwrap() -= 1;
        Ok(json!(null))
    }
}

/// Succeeds, but only after outliving a short visibility timeout.
struct Lingering;

#[async_trait]
impl Handler for Lingering {
    async fn execute(
        &self,
        _ctx: &JobContext,
        _payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(json!("late"))
    }
}

/// Records the peak number of simultaneously running attempts.
struct CapTracker {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Handler for CapTracker {
    async fn execute(
        &self,
        _ctx: &JobContext,
        _payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(json!(null))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn test_engine(name: &str, handler: Arc<dyn Handler>) -> Arc<Engine> {
    let store = Arc::new(Store::in_memory().unwrap());
    let mut registry = HandlerRegistry::new();
    registry.register(name, handler);
    Arc::new(Engine::new(store, Arc::new(registry)))
}

fn test_dispatcher(engine: Arc<Engine>, config: DispatcherConfig) -> Arc<Dispatcher> {
    let retry = RetryPolicy::fixed(Duration::from_millis(5), 2.0, Duration::from_millis(50));
    Arc::new(Dispatcher::new(engine, retry, config))
}

fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        visibility_timeout: Duration::from_secs(60),
        poll_interval: Duration::from_millis(10),
        handler_timeout: Duration::from_secs(30),
        ..DispatcherConfig::default()
    }
}

/// Poll until the job settles, with a generous iteration bound.
async fn run_until_terminal(dispatcher: &Dispatcher, engine: &Engine, id: JobId) -> Job {
    for _ in 0..500 {
        dispatcher.poll_once("w1").await.unwrap();
        let job = engine.get(id).unwrap();
        if job.state.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {id} never reached a terminal state");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn success_on_first_attempt() {
    let engine = test_engine("ok", Arc::new(Ok200));
    let dispatcher = test_dispatcher(Arc::clone(&engine), fast_config());

    let job = engine.submit(NewJob::new("ok").payload(json!({"n": 7}))).unwrap();
    let done = run_until_terminal(&dispatcher, &engine, job.id).await;

    assert_eq!(done.state, JobState::Succeeded);
    assert_eq!(done.attempts, 1);
    assert_eq!(done.result, Some(json!({"n": 7})));
    assert!(done.finished_at.is_some());
    assert_eq!(engine.health().unwrap().queue_depth, 0);
}

#[tokio::test]
async fn persistent_failure_exhausts_attempts() {
    let engine = test_engine("fail", Arc::new(AlwaysFail));
    let dispatcher = test_dispatcher(Arc::clone(&engine), fast_config());

    let job = engine
        .submit(NewJob::new("fail").max_attempts(3))
        .unwrap();
    let done = run_until_terminal(&dispatcher, &engine, job.id).await;

    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.attempts, 3);
    assert_eq!(done.error.as_deref(), Some("boom"));
    assert_eq!(engine.health().unwrap().queue_depth, 0);

    // Two retries scheduled, then the terminal failure.
    let events = engine.events_since(0).unwrap();
    let retries = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::JobRetried { .. }))
        .count();
    assert_eq!(retries, 2);
    assert!(
        events
            .iter()
            .any(|e| matches!(e.kind, EventKind::JobFailed { attempts: 3, .. }))
    );
}

#[tokio::test]
async fn transient_failure_recovers_within_budget() {
    let flaky = Arc::new(Flaky {
        fail_before: 2,
        calls: AtomicU32::new(0),
    });
    let engine = test_engine("flaky", flaky);
    let dispatcher = test_dispatcher(Arc::clone(&engine), fast_config());

    let job = engine
        .submit(NewJob::new("flaky").max_attempts(3))
        .unwrap();
    let done = run_until_terminal(&dispatcher, &engine, job.id).await;

    assert_eq!(done.state, JobState::Succeeded);
    assert_eq!(done.attempts, 3);
}

#[tokio::test]
async fn single_attempt_budget_fails_without_retry() {
    let engine = test_engine("fail", Arc::new(AlwaysFail));
    let dispatcher = test_dispatcher(Arc::clone(&engine), fast_config());

    let job = engine
        .submit(NewJob::new("fail").max_attempts(1))
        .unwrap();
    let done = run_until_terminal(&dispatcher, &engine, job.id).await;

    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.attempts, 1);
    assert_eq!(engine.health().unwrap().queue_depth, 0);
    let events = engine.events_since(0).unwrap();
    assert!(
        !events
            .iter()
            .any(|e| matches!(e.kind, EventKind::JobRetried { .. }))
    );
}

#[tokio::test]
async fn fatal_error_skips_remaining_attempts() {
    let engine = test_engine("fatal", Arc::new(FatalFail));
    let dispatcher = test_dispatcher(Arc::clone(&engine), fast_config());

    let job = engine
        .submit(NewJob::new("fatal").max_attempts(5))
        .unwrap();
    let done = run_until_terminal(&dispatcher, &engine, job.id).await;

    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.attempts, 1);
    assert!(done.error.as_deref().unwrap_or("").contains("bad payload"));
}

#[tokio::test]
async fn handler_timeout_counts_as_failed_attempt() {
    let engine = test_engine("slow", Arc::new(Slow));
    let config = DispatcherConfig {
        handler_timeout: Duration::from_millis(20),
        ..fast_config()
    };
    let dispatcher = test_dispatcher(Arc::clone(&engine), config);

    let job = engine
        .submit(NewJob::new("slow").max_attempts(1))
        .unwrap();
    let done = run_until_terminal(&dispatcher, &engine, job.id).await;

    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.attempts, 1);
    assert!(done.error.as_deref().unwrap_or("").contains("timed out"));
}

#[tokio::test]
async fn expired_lease_is_recovered_and_rerun() {
    let engine = test_engine("ok", Arc::new(Ok200));
    let dispatcher = test_dispatcher(Arc::clone(&engine), fast_config());
    let store = engine.store();

    let job = engine.submit(NewJob::new("ok").max_attempts(3)).unwrap();

    // Simulate a worker that leased the job and crashed before confirming
    // start: short queue visibility, job stamped Leased, no ack.
    store
        .lease_next("ghost", Duration::from_millis(10))
        .unwrap()
        .expect("reference should be leasable");
    store
        .update_job(
            job.id,
            0,
            JobUpdate::new().state(JobState::Leased).lease(Lease {
                owner: "ghost".to_string(),
                deadline: Utc::now() + chrono::Duration::milliseconds(10),
            }),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let done = run_until_terminal(&dispatcher, &engine, job.id).await;

    // The crashed lease consumed attempt 1; the rerun succeeded on attempt 2.
    assert_eq!(done.state, JobState::Succeeded);
    assert_eq!(done.attempts, 2);

    let events = engine.events_since(0).unwrap();
    assert!(
        events
            .iter()
            .any(|e| matches!(&e.kind, EventKind::LeaseExpired { owner, .. } if owner == "ghost"))
    );
}

#[tokio::test]
async fn expired_lease_on_last_attempt_fails_the_job() {
    let engine = test_engine("ok", Arc::new(Ok200));
    let dispatcher = test_dispatcher(Arc::clone(&engine), fast_config());
    let store = engine.store();

    let job = engine.submit(NewJob::new("ok").max_attempts(1)).unwrap();
    store
        .lease_next("ghost", Duration::from_millis(10))
        .unwrap()
        .unwrap();
    store
        .update_job(
            job.id,
            0,
            JobUpdate::new().state(JobState::Leased).lease(Lease {
                owner: "ghost".to_string(),
                deadline: Utc::now() + chrono::Duration::milliseconds(10),
            }),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let done = run_until_terminal(&dispatcher, &engine, job.id).await;
    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.attempts, 1);
    assert_eq!(done.error.as_deref(), Some("lease expired"));
}

#[tokio::test]
async fn in_flight_job_observes_cancellation() {
    let engine = test_engine("loop", Arc::new(UntilCancelled));
    let dispatcher = test_dispatcher(Arc::clone(&engine), fast_config());

    let job = engine.submit(NewJob::new("loop")).unwrap();

    let poll = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.poll_once("w1").await })
    };

    // Give the handler time to start, then request cancellation.
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if engine.get(job.id).unwrap().state == JobState::Running {
            break;
        }
    }
    let marked = engine.cancel(job.id).unwrap();
    assert_eq!(marked.state, JobState::Running);
    assert!(marked.cancel_requested);

    poll.await.unwrap().unwrap();

    let done = engine.get(job.id).unwrap();
    assert_eq!(done.state, JobState::Cancelled);
    assert_eq!(engine.health().unwrap().queue_depth, 0);
}

#[tokio::test]
async fn global_in_flight_cap_pauses_leasing() {
    let engine = test_engine("ok", Arc::new(Ok200));
    let config = DispatcherConfig {
        max_in_flight: 0,
        ..fast_config()
    };
    let dispatcher = test_dispatcher(Arc::clone(&engine), config);

    let job = engine.submit(NewJob::new("ok")).unwrap();
    assert_eq!(dispatcher.poll_once("w1").await.unwrap(), Polled::Idle);

    // Nothing was leased or lost.
    assert_eq!(engine.get(job.id).unwrap().state, JobState::Pending);
    assert_eq!(engine.health().unwrap().queue_depth, 1);
}

#[tokio::test]
async fn per_handler_cap_defers_without_losing_jobs() {
    let gate = Arc::new(Semaphore::new(0));
    let engine = test_engine(
        "gated",
        Arc::new(Gated {
            gate: Arc::clone(&gate),
        }),
    );
    let config = DispatcherConfig {
        per_handler_limits: HashMap::from([("gated".to_string(), 1)]),
        ..fast_config()
    };
    let dispatcher = test_dispatcher(Arc::clone(&engine), config);

    let first = engine.submit(NewJob::new("gated")).unwrap();
    let second = engine.submit(NewJob::new("gated")).unwrap();

    let poll = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.poll_once("w1").await })
    };
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if dispatcher.in_flight() == 1 {
            break;
        }
    }

    // The slot is taken; the second job is deferred, not dropped.
    assert_eq!(dispatcher.poll_once("w2").await.unwrap(), Polled::Idle);
    assert_eq!(engine.get(second.id).unwrap().state, JobState::Pending);

    gate.add_permits(2);
    poll.await.unwrap().unwrap();
    assert_eq!(engine.get(first.id).unwrap().state, JobState::Succeeded);

    let done = run_until_terminal(&dispatcher, &engine, second.id).await;
    assert_eq!(done.state, JobState::Succeeded);
}

#[tokio::test]
async fn late_outcome_after_recovery_does_not_strand_the_job() {
    let engine = test_engine("linger", Arc::new(Lingering));
    let config = DispatcherConfig {
        visibility_timeout: Duration::from_millis(40),
        ..fast_config()
    };
    let dispatcher = test_dispatcher(Arc::clone(&engine), config);

    let job = engine.submit(NewJob::new("linger").max_attempts(3)).unwrap();

    // w1 starts the handler, then overruns its lease.
    let late = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.poll_once("w1").await })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;

    // w2 finds the expired lease and puts the job back in line.
    dispatcher.poll_once("w2").await.unwrap();
    assert_eq!(engine.get(job.id).unwrap().state, JobState::Pending);
    assert_eq!(engine.health().unwrap().queue_depth, 1);

    // w1 settles late. Its outcome is dropped, and the re-queued reference
    // must survive so the job still runs to completion.
    late.await.unwrap().unwrap();
    let stale = engine.get(job.id).unwrap();
    assert_eq!(stale.state, JobState::Pending);
    assert!(stale.result.is_none());
    assert_eq!(engine.health().unwrap().queue_depth, 1);

    let done = run_until_terminal(&dispatcher, &engine, job.id).await;
    assert_eq!(done.state, JobState::Succeeded);
    assert_eq!(done.attempts, 2);
    assert_eq!(engine.health().unwrap().queue_depth, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn global_cap_holds_under_concurrent_workers() {
    let tracker = Arc::new(CapTracker {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let engine = test_engine("capped", Arc::clone(&tracker) as Arc<dyn Handler>);
    let config = DispatcherConfig {
        max_in_flight: 2,
        ..fast_config()
    };
    let dispatcher = test_dispatcher(Arc::clone(&engine), config);

    let mut ids = Vec::new();
    for _ in 0..16 {
        ids.push(engine.submit(NewJob::new("capped")).unwrap().id);
    }

    let pool = WorkerPool::spawn(8, Arc::clone(&dispatcher));
    for _ in 0..500 {
        let settled = ids
            .iter()
            .all(|id| engine.get(*id).unwrap().state.is_terminal());
        if settled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pool.shutdown_and_join().await;

    assert!(tracker.peak.load(Ordering::SeqCst) <= 2);
    for id in ids {
        assert_eq!(engine.get(id).unwrap().state, JobState::Succeeded);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_overlap_a_job() {
    let overlap = Arc::new(Overlap {
        active: Mutex::new(HashMap::new()),
        violated: AtomicBool::new(false),
    });
    let engine = test_engine("tracked", Arc::clone(&overlap) as Arc<dyn Handler>);
    let dispatcher = test_dispatcher(Arc::clone(&engine), fast_config());

    let mut ids = Vec::new();
    for i in 0..10 {
        let job = engine
            .submit(NewJob::new("tracked").payload(json!({"i": i})))
            .unwrap();
        ids.push(job.id);
    }

    let pool = WorkerPool::spawn(4, Arc::clone(&dispatcher));
    for _ in 0..500 {
        let settled = ids
            .iter()
            .all(|id| engine.get(*id).unwrap().state.is_terminal());
        if settled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pool.shutdown_and_join().await;

    assert!(!overlap.violated.load(Ordering::SeqCst));
    for id in ids {
        let job = engine.get(id).unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.attempts, 1);
    }
    assert_eq!(engine.health().unwrap().worker_count, 0);
}
