//! Handler trait and registry.
//!
//! A handler is the code that executes one kind of job. Handlers register
//! under a unique name at startup; submission validates the name against the
//! registry.
//!
//! Delivery is at-least-once: a lease that expires mid-execution makes the
//! job leasable again, so the same attempt may be redelivered. Handlers must
//! therefore be idempotent, or deduplicate on job id + attempt. The engine
//! documents this contract here; it cannot enforce it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::model::JobId;
use crate::store::Store;

/// Error returned by a handler for one attempt.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Attempt failed; the retry policy decides whether to re-queue.
    #[error("{0}")]
    Failed(String),

    /// Attempt failed and retrying cannot help. The job goes terminally
    /// failed regardless of remaining attempts.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The handler observed a cancellation request and stopped at a safe
    /// point. The job transitions to the cancelled terminal state.
    #[error("cancelled")]
    Cancelled,
}

/// Per-attempt context passed to handlers.
pub struct JobContext {
    store: Arc<Store>,
    /// The job being executed.
    pub job_id: JobId,
    /// Which attempt this is, 1-indexed.
    pub attempt: u32,
}

impl JobContext {
    pub(crate) fn new(store: Arc<Store>, job_id: JobId, attempt: u32) -> Self {
        Self {
            store,
            job_id,
            attempt,
        }
    }

    /// Whether cancellation has been requested for this job.
    ///
    /// Handlers should check this at safe points during long-running work and
    /// return [`HandlerError::Cancelled`] to stop cooperatively.
    pub fn cancel_requested(&self) -> bool {
        self.store
            .get_job(self.job_id)
            .map(|job| job.cancel_requested)
            .unwrap_or(false)
    }
}

/// Executes jobs of one registered type.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Run one attempt. Returns result data on success.
    async fn execute(
        &self,
        ctx: &JobContext,
        payload: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, HandlerError>;
}

/// Registry of handlers, indexed by name. Built at startup, then read-only.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a unique name. Replaces any previous handler
    /// with the same name.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(name)
    }

    /// Whether a handler is registered under this name.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered handler names.
    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}
