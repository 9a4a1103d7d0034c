//! Worker pool: N execution contexts polling the dispatcher.
//!
//! Workers coordinate only through the queue and store; the pool itself just
//! owns the tasks and the shutdown signal. Shutdown is graceful: workers stop
//! taking new leases and in-flight attempts run to completion.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::dispatcher::{Dispatcher, Polled};

/// Handle to a group of spawned workers.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n` workers against the dispatcher.
    pub fn spawn(n: usize, dispatcher: Arc<Dispatcher>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        dispatcher.engine().workers_attached(n);

        let mut joins = Vec::with_capacity(n);
        for i in 0..n {
            let dispatcher = Arc::clone(&dispatcher);
            let mut rx = shutdown_rx.clone();
            let worker_id = format!("worker-{i}");

            joins.push(tokio::spawn(async move {
                worker_loop(&worker_id, &dispatcher, &mut rx).await;
                dispatcher.engine().worker_detached();
            }));
        }

        Self { shutdown_tx, joins }
    }

    /// Signal all workers to stop taking new leases.
    pub fn request_shutdown(&self) {
        // Receivers may already be gone; nothing to do then.
        let _ = self.shutdown_tx.send(true);
    }

    /// Shut down and wait for all workers to finish their current attempt.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

async fn worker_loop(
    worker_id: &str,
    dispatcher: &Dispatcher,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    info!(worker = worker_id, "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match dispatcher.poll_once(worker_id).await {
            Ok(Polled::Ran) => continue,
            Ok(Polled::Idle) => {
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(dispatcher.poll_interval()) => {}
                }
            }
            Err(e) => {
                error!(worker = worker_id, "poll error: {e}");
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(dispatcher.poll_interval()) => {}
                }
            }
        }
    }
    info!(worker = worker_id, "worker stopped");
}
