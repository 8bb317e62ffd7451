// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash-safe delivery of worker jobs.
//!
//! Jobs are delivered in claim mode: taking a batch records one claim row
//! per job in the same transaction that advances the consumer cursor. A
//! healthy worker heartbeats its claims and deletes them when the terminal
//! result is reconciled; a dead worker's claims go stale and the liveness
//! monitor either republishes the job with an incremented attempt or, past
//! the attempt cap, fails the task run terminally.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use strom_model::StateType;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::CoreError;
use crate::message::{self, ExecutionMessage, WorkerJob};
use crate::queue::{Delivery, Envelope, Queue};
use crate::storage::Storage;

/// Consumer group shared by all workers of the job topic.
const WORKER_GROUP_CONSUMER: &str = "workers";

/// One worker process identity.
#[derive(Debug, Clone)]
pub struct WorkerInstance {
    /// Unique id of this worker process, regenerated on restart.
    pub worker_id: Uuid,
    /// The worker group this process serves.
    pub worker_group: String,
}

impl WorkerInstance {
    /// A fresh worker identity in `worker_group`.
    pub fn new(worker_group: impl Into<String>) -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            worker_group: worker_group.into(),
        }
    }
}

fn claim_meta(payload: &str) -> Option<(String, i32)> {
    let job: WorkerJob = serde_json::from_str(payload).ok()?;
    Some((job.job_id().to_string(), job.attempt()))
}

/// Claim-mode access to the worker-job topic.
#[derive(Clone)]
pub struct WorkerJobQueue {
    storage: Arc<dyn Storage>,
}

impl WorkerJobQueue {
    /// A handle over `storage`.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Publish a job for workers.
    pub async fn publish(&self, job: &WorkerJob) -> Result<i64, CoreError> {
        let payload = serde_json::to_string(job)?;
        self.storage
            .publish(message::WORKER_JOBS, Some(job.job_id()), &payload)
            .await
    }

    /// Take one batch for `worker`, recording a claim per job atomically
    /// with the cursor advance.
    pub async fn poll_and_claim(
        &self,
        worker: &WorkerInstance,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Delivery<WorkerJob>>, CoreError> {
        let items = self
            .storage
            .poll_and_claim(
                message::WORKER_JOBS,
                WORKER_GROUP_CONSUMER,
                &worker.worker_id.to_string(),
                &worker.worker_group,
                now,
                limit,
                &claim_meta,
            )
            .await?;

        Ok(items
            .into_iter()
            .map(|item| {
                serde_json::from_str(&item.payload)
                    .map(|message| Envelope {
                        offset: item.offset,
                        message,
                    })
                    .map_err(|e| CoreError::Malformed {
                        topic: message::WORKER_JOBS.to_string(),
                        offset: item.offset,
                        details: e.to_string(),
                    })
            })
            .collect())
    }

    /// Refresh every claim held by `worker`.
    pub async fn heartbeat(
        &self,
        worker: &WorkerInstance,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.storage
            .heartbeat_worker(&worker.worker_id.to_string(), now)
            .await
    }

    /// Drop the claim of a job whose terminal result is reconciled.
    pub async fn complete(&self, job_id: &str) -> Result<(), CoreError> {
        self.storage.delete_worker_job(job_id).await
    }
}

/// Detects orphaned worker jobs and puts them back on the queue.
pub struct LivenessMonitor {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    heartbeat_timeout: Duration,
    max_job_attempts: u32,
    executions: Queue<ExecutionMessage>,
}

impl LivenessMonitor {
    /// A monitor over `storage`, failing jobs past `max_job_attempts`.
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        heartbeat_timeout: Duration,
        max_job_attempts: u32,
    ) -> Self {
        let executions = Queue::new(storage.clone(), message::EXECUTIONS);
        Self {
            storage,
            clock,
            heartbeat_timeout,
            max_job_attempts,
            executions,
        }
    }

    /// One sweep over stale claims. Returns how many jobs were handled.
    ///
    /// The per-job removal re-checks staleness inside its own transaction,
    /// so concurrent monitors reclaim each orphan exactly once.
    pub async fn sweep(&self) -> Result<usize, CoreError> {
        let now = self.clock.now();
        let cutoff = now
            - chrono::Duration::from_std(self.heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let stale = self.storage.stale_worker_jobs(cutoff).await?;
        let mut handled = 0;

        for row in stale {
            let job: WorkerJob = match serde_json::from_str(&row.payload) {
                Ok(job) => job,
                Err(e) => {
                    error!(job_id = %row.job_id, error = %e, "dropping undecodable stale claim");
                    self.storage.delete_worker_job(&row.job_id).await?;
                    continue;
                }
            };

            let next_attempt = row.attempt + 1;
            if next_attempt > self.max_job_attempts as i32 {
                warn!(
                    job_id = %row.job_id,
                    attempts = row.attempt,
                    "job exhausted its attempts, failing terminally"
                );
                self.fail_terminally(&job).await?;
                self.storage.delete_worker_job(&row.job_id).await?;
                handled += 1;
                continue;
            }

            let payload = serde_json::to_string(&job.with_attempt(next_attempt))?;
            let requeued = self
                .storage
                .requeue_stale_job(
                    &row.job_id,
                    cutoff,
                    message::WORKER_JOBS,
                    Some(&row.job_id),
                    &payload,
                )
                .await?;

            if requeued {
                info!(job_id = %row.job_id, attempt = next_attempt, "requeued orphaned job");
                handled += 1;
            }
        }

        Ok(handled)
    }

    async fn fail_terminally(&self, job: &WorkerJob) -> Result<(), CoreError> {
        if let WorkerJob::Task {
            execution_id,
            task_run,
            ..
        } = job
        {
            let failed = task_run.with_state(StateType::Failed);
            self.executions
                .publish(
                    Some(execution_id),
                    &ExecutionMessage::TaskRunResult {
                        execution_id: execution_id.clone(),
                        task_run: failed,
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Sweep periodically until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        info!("liveness monitor started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("liveness monitor stopping");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "liveness sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use sqlx::sqlite::SqlitePoolOptions;
    use strom_model::TaskRun;

    use crate::clock::FixedClock;
    use crate::storage::SqliteStorage;

    async fn storage() -> Arc<dyn Storage> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::run_sqlite(&pool).await.unwrap();
        Arc::new(SqliteStorage::new(pool))
    }

    fn task_job(job_id: &str, attempt: i32) -> WorkerJob {
        WorkerJob::Task {
            job_id: job_id.to_string(),
            execution_id: "exec-1".to_string(),
            task_run: TaskRun::new("run-1", "extract"),
            attempt,
        }
    }

    #[tokio::test]
    async fn claimed_batch_is_not_redelivered() {
        let storage = storage().await;
        let jobs = WorkerJobQueue::new(storage.clone());
        let worker = WorkerInstance::new("default");
        let now = Utc::now();

        jobs.publish(&task_job("job-1", 1)).await.unwrap();

        let batch = jobs.poll_and_claim(&worker, now, 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].as_ref().unwrap().message.job_id(), "job-1");

        let other = WorkerInstance::new("default");
        assert!(jobs.poll_and_claim(&other, now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn crash_recovery_requeues_with_incremented_attempt() {
        let storage = storage().await;
        let jobs = WorkerJobQueue::new(storage.clone());
        let worker = WorkerInstance::new("default");
        let t0 = Utc::now();

        jobs.publish(&task_job("job-1", 1)).await.unwrap();
        jobs.poll_and_claim(&worker, t0, 10).await.unwrap();

        // Worker dies: no heartbeat. Advance past the timeout and sweep.
        let clock = Arc::new(FixedClock::new(t0 + ChronoDuration::seconds(60)));
        let monitor =
            LivenessMonitor::new(storage.clone(), clock, Duration::from_secs(30), 5);

        let handled = monitor.sweep().await.unwrap();
        assert_eq!(handled, 1);

        // The job is back on the queue with attempt 2, claimable again.
        let survivor = WorkerInstance::new("default");
        let batch = jobs
            .poll_and_claim(&survivor, t0 + ChronoDuration::seconds(61), 10)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].as_ref().unwrap().message.attempt(), 2);
    }

    #[tokio::test]
    async fn heartbeat_keeps_claims_alive() {
        let storage = storage().await;
        let jobs = WorkerJobQueue::new(storage.clone());
        let worker = WorkerInstance::new("default");
        let t0 = Utc::now();

        jobs.publish(&task_job("job-1", 1)).await.unwrap();
        jobs.poll_and_claim(&worker, t0, 10).await.unwrap();
        jobs.heartbeat(&worker, t0 + ChronoDuration::seconds(50))
            .await
            .unwrap();

        let clock = Arc::new(FixedClock::new(t0 + ChronoDuration::seconds(60)));
        let monitor =
            LivenessMonitor::new(storage.clone(), clock, Duration::from_secs(30), 5);

        assert_eq!(monitor.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exhausted_job_fails_the_task_run_terminally() {
        let storage = storage().await;
        let jobs = WorkerJobQueue::new(storage.clone());
        let worker = WorkerInstance::new("default");
        let t0 = Utc::now();

        jobs.publish(&task_job("job-1", 5)).await.unwrap();
        jobs.poll_and_claim(&worker, t0, 10).await.unwrap();

        let clock = Arc::new(FixedClock::new(t0 + ChronoDuration::seconds(60)));
        let monitor =
            LivenessMonitor::new(storage.clone(), clock, Duration::from_secs(30), 5);

        assert_eq!(monitor.sweep().await.unwrap(), 1);

        // No requeue: the worker topic cursor finds nothing new.
        let survivor = WorkerInstance::new("default");
        assert!(jobs
            .poll_and_claim(&survivor, t0 + ChronoDuration::seconds(61), 10)
            .await
            .unwrap()
            .is_empty());

        // Instead a terminal FAILED result went to the executions topic.
        let executions: Queue<ExecutionMessage> = Queue::new(storage.clone(), message::EXECUTIONS);
        let deliveries = executions.poll_once("test").await.unwrap();
        assert_eq!(deliveries.len(), 1);
        match &deliveries[0].as_ref().unwrap().message {
            ExecutionMessage::TaskRunResult { execution_id, task_run } => {
                assert_eq!(execution_id, "exec-1");
                assert_eq!(task_run.state.current, StateType::Failed);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // The claim row is gone.
        assert!(storage
            .stale_worker_jobs(t0 + ChronoDuration::seconds(120))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn complete_drops_the_claim() {
        let storage = storage().await;
        let jobs = WorkerJobQueue::new(storage.clone());
        let worker = WorkerInstance::new("default");
        let t0 = Utc::now();

        jobs.publish(&task_job("job-1", 1)).await.unwrap();
        jobs.poll_and_claim(&worker, t0, 10).await.unwrap();
        jobs.complete("job-1").await.unwrap();

        let clock = Arc::new(FixedClock::new(t0 + ChronoDuration::seconds(60)));
        let monitor =
            LivenessMonitor::new(storage.clone(), clock, Duration::from_secs(30), 5);
        assert_eq!(monitor.sweep().await.unwrap(), 0);
    }
}
