//! Durable job queue.
//!
//! Jobs live in the `jobs` table, so they survive restarts. Delivery is
//! at-least-once: a worker that dies mid-job loses its lease and the job is
//! claimed again once the lease expires. Jobs sharing a partition key run one
//! at a time, in insertion order.

pub mod job;
pub mod retry;

pub use job::{
    ConversationTarget, Job, JobOutcome, JobRecord, JobStatus, NewJob, ProcessMessageJob,
    QualifyLeadJob, Sender, SkipReason,
};
pub use retry::RetryPolicy;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, JobError};
use crate::store::Database;

/// Handle to the durable queue shared by the gateway, the workers and the admin routes.
pub struct JobQueue {
    db: Arc<dyn Database>,
    notify: Notify,
    retry: RetryPolicy,
    lease: Duration,
}

impl JobQueue {
    pub fn new(db: Arc<dyn Database>, retry: RetryPolicy, lease: Duration) -> Arc<Self> {
        Arc::new(Self {
            db,
            notify: Notify::new(),
            retry,
            lease,
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Persist a job and wake one idle worker.
    pub async fn enqueue(
        &self,
        job: Job,
        partition_key: String,
        agent_config_id: Option<Uuid>,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let name = job.name();
        self.db
            .insert_job(&NewJob {
                id,
                job,
                partition_key,
                agent_config_id,
                max_attempts: self.retry.max_attempts,
                available_at: Utc::now(),
            })
            .await?;

        debug!(job_id = %id, job = name, "Job enqueued");
        self.notify.notify_one();
        Ok(id)
    }

    /// Claim the next runnable job, taking a lease on it.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<JobRecord>, DatabaseError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.lease)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        self.db.claim_job(worker_id, now, now + lease).await
    }

    /// Sleep until a job is enqueued or `poll` elapses.
    ///
    /// Polling still matters: backed-off retries and expired leases become
    /// runnable without anyone enqueueing.
    pub async fn wait_for_work(&self, poll: Duration) {
        let _ = tokio::time::timeout(poll, self.notify.notified()).await;
    }

    /// Record a finished job.
    pub async fn complete(
        &self,
        record: &JobRecord,
        worker_id: &str,
        outcome: &JobOutcome,
    ) -> Result<(), DatabaseError> {
        match outcome {
            JobOutcome::Completed => {
                self.db
                    .finish_job(record.id, worker_id, JobStatus::Completed, None)
                    .await?;
                debug!(job_id = %record.id, job = record.job.name(), "Job completed");
            }
            JobOutcome::Skipped(reason) => {
                let reason = reason.to_string();
                self.db
                    .finish_job(record.id, worker_id, JobStatus::Skipped, Some(&reason))
                    .await?;
                info!(job_id = %record.id, job = record.job.name(), reason = %reason, "Job skipped");
            }
        }
        // Finishing frees the partition for the next job.
        self.notify.notify_one();
        Ok(())
    }

    /// Record a failed attempt: back off and retry, or dead-letter.
    pub async fn fail(
        &self,
        record: &JobRecord,
        worker_id: &str,
        err: &JobError,
    ) -> Result<(), DatabaseError> {
        let message = err.to_string();
        let retryable = err.is_retryable();
        let max_attempts = record.max_attempts.min(self.retry.max_attempts);

        if retryable && record.attempts < max_attempts {
            let delay = self.retry.backoff_with_jitter(record.attempts);
            let available_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.db
                .reschedule_job(record.id, worker_id, available_at, &message)
                .await?;
            warn!(
                job_id = %record.id,
                job = record.job.name(),
                attempt = record.attempts,
                max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %message,
                "Job failed, will retry"
            );
        } else {
            self.db
                .dead_letter_job(record.id, worker_id, &message)
                .await?;
            error!(
                job_id = %record.id,
                job = record.job.name(),
                attempts = record.attempts,
                retryable,
                error = %message,
                "Job moved to dead-letter"
            );
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Cancel every queued, not-yet-started job of an agent.
    pub async fn cancel_for_agent(&self, agent_config_id: Uuid) -> Result<u64, DatabaseError> {
        let cancelled = self.db.cancel_pending_jobs(agent_config_id).await?;
        info!(agent_config_id = %agent_config_id, cancelled, "Cancelled queued jobs");
        Ok(cancelled)
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<JobRecord>, DatabaseError> {
        self.db.list_jobs_by_status(JobStatus::Dead, limit).await
    }

    /// Give a dead-lettered job a fresh attempt budget.
    pub async fn requeue(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let requeued = self.db.requeue_job(id, Utc::now()).await?;
        if requeued {
            info!(job_id = %id, "Dead-lettered job requeued");
            self.notify.notify_one();
        }
        Ok(requeued)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, DatabaseError> {
        self.db.get_job(id).await
    }
}
