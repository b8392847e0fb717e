//! Fixed-size pool of claim loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::queue::{JobQueue, JobRecord};
use crate::worker::processor::ConversationWorker;

/// Handles to the running claim loops.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn `concurrency` claim loops over the queue.
    pub fn spawn(
        worker: Arc<ConversationWorker>,
        queue: Arc<JobQueue>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handles = (0..concurrency)
            .map(|n| {
                let worker_id = format!("worker-{}-{n}", std::process::id());
                tokio::spawn(claim_loop(
                    worker_id,
                    Arc::clone(&worker),
                    Arc::clone(&queue),
                    poll_interval,
                    shutdown_rx.clone(),
                ))
            })
            .collect();
        info!(concurrency, "Worker pool started");
        Self { handles, shutdown }
    }

    /// Stop claiming and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn claim_loop(
    worker_id: String,
    worker: Arc<ConversationWorker>,
    queue: Arc<JobQueue>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "Claim loop started");
    while !*shutdown.borrow() {
        match queue.claim(&worker_id).await {
            Ok(Some(record)) => run_job(&worker_id, &worker, &queue, record).await,
            Ok(None) => {
                tokio::select! {
                    _ = queue.wait_for_work(poll_interval) => {}
                    changed = shutdown.changed() => if changed.is_err() { break },
                }
            }
            Err(e) => {
                error!(worker_id, error = %e, "Failed to claim job");
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => if changed.is_err() { break },
                }
            }
        }
    }
    debug!(worker_id, "Claim loop stopped");
}

async fn run_job(worker_id: &str, worker: &ConversationWorker, queue: &JobQueue, record: JobRecord) {
    debug!(
        worker_id,
        job_id = %record.id,
        job = record.job.name(),
        attempt = record.attempts,
        "Job claimed"
    );

    let recorded = match worker.handle(&record).await {
        Ok(outcome) => queue.complete(&record, worker_id, &outcome).await,
        Err(e) => queue.fail(&record, worker_id, &e).await,
    };
    // The lease expires and the job is claimed again.
    if let Err(e) = recorded {
        error!(worker_id, job_id = %record.id, error = %e, "Failed to record job result");
    }
}
