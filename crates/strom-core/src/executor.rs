// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The execution reconciler.
//!
//! Consumes the executions topic and folds every message into the stored
//! execution under a row lock: task-run results are joined or dropped by
//! the staleness rules, kills and resumes transition the aggregate, and
//! once every task run is terminal the final state is computed and the
//! admission slot released. Each message is processed in one transaction,
//! so a crash between lock and commit redelivers cleanly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use strom_model::{Concurrency, Execution, FlowId, RetryBehavior, State, StateType, TaskResolver, TaskRun};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmissionOutcome};
use crate::error::CoreError;
use crate::message::{self, ExecutionMessage, WorkerJob};
use crate::queue::{Delivery, Queue};
use crate::storage::Storage;
use crate::tracker::WorkerJobQueue;

/// Consumer group of the reconciler on the executions topic.
const EXECUTOR_GROUP: &str = "executor";

/// Stable claim key of a task-run job: attempts of the same run share it.
pub fn task_job_id(execution_id: &str, task_run_id: &str) -> String {
    format!("{execution_id}|{task_run_id}")
}

/// Resolves per-flow concurrency settings at admission time.
///
/// Implemented by the flow registry; the reconciler itself never parses
/// flow definitions.
pub trait ConcurrencyResolver: Send + Sync {
    /// The concurrency settings of `flow`, if it has any.
    fn concurrency(&self, flow: &FlowId) -> Option<Concurrency>;
}

impl ConcurrencyResolver for HashMap<String, Concurrency> {
    fn concurrency(&self, flow: &FlowId) -> Option<Concurrency> {
        self.get(&flow.uid()).cloned()
    }
}

/// A resolver with no concurrency limits configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConcurrency;

impl ConcurrencyResolver for NoConcurrency {
    fn concurrency(&self, _flow: &FlowId) -> Option<Concurrency> {
        None
    }
}

/// The execution reconciler.
pub struct Executor {
    storage: Arc<dyn Storage>,
    admission: AdmissionController,
    tasks: Arc<dyn TaskResolver>,
    flows: Arc<dyn ConcurrencyResolver>,
    jobs: WorkerJobQueue,
    executions: Queue<ExecutionMessage>,
    changed: broadcast::Sender<Execution>,
}

impl Executor {
    /// An executor over `storage`, resolving tasks and flow settings through
    /// the given seams.
    pub fn new(
        storage: Arc<dyn Storage>,
        tasks: Arc<dyn TaskResolver>,
        flows: Arc<dyn ConcurrencyResolver>,
    ) -> Self {
        let (changed, _) = broadcast::channel(256);
        Self {
            admission: AdmissionController::new(storage.clone()),
            jobs: WorkerJobQueue::new(storage.clone()),
            executions: Queue::new(storage.clone(), message::EXECUTIONS),
            storage,
            tasks,
            flows,
            changed,
        }
    }

    /// Subscribe to execution snapshots as they change.
    pub fn on_execution_changed(&self) -> broadcast::Receiver<Execution> {
        self.changed.subscribe()
    }

    /// Submit a new execution through the admission gate and persist it.
    ///
    /// Returns the stored execution: unchanged when admitted, or moved to
    /// Queued, Cancelled or Failed by the flow's concurrency policy.
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    pub async fn submit(&self, execution: Execution) -> Result<Execution, CoreError> {
        let concurrency = self.flows.concurrency(&execution.flow());
        let outcome = self
            .admission
            .try_admit(&execution, concurrency.as_ref())
            .await?;

        let stored = match outcome {
            AdmissionOutcome::Admitted => execution,
            AdmissionOutcome::Deferred => {
                info!("flow at limit, queueing execution");
                execution.with_state(StateType::Queued)
            }
            AdmissionOutcome::Cancelled => {
                info!("flow at limit, cancelling execution");
                execution.with_state(StateType::Cancelled)
            }
            AdmissionOutcome::Failed => {
                info!("flow at limit, failing execution");
                execution.with_state(StateType::Failed)
            }
        };

        self.storage.save_execution(&stored).await?;
        let _ = self.changed.send(stored.clone());
        Ok(stored)
    }

    /// Publish a kill request for an execution.
    pub async fn kill(&self, execution_id: &str) -> Result<(), CoreError> {
        self.executions
            .publish(
                Some(execution_id),
                &ExecutionMessage::Kill {
                    execution_id: execution_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Publish a resume request for a paused execution.
    pub async fn resume(&self, execution_id: &str) -> Result<(), CoreError> {
        self.executions
            .publish(
                Some(execution_id),
                &ExecutionMessage::Resume {
                    execution_id: execution_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Fold one message from the executions topic into stored state.
    pub async fn handle(&self, message: ExecutionMessage) -> Result<(), CoreError> {
        match message {
            ExecutionMessage::Execution { execution } => self.handle_execution(execution).await,
            ExecutionMessage::TaskRunResult {
                execution_id,
                task_run,
            } => self.apply_task_run(&execution_id, task_run).await,
            ExecutionMessage::Kill { execution_id } => self.apply_kill(&execution_id).await,
            ExecutionMessage::Resume { execution_id } => self.apply_resume(&execution_id).await,
        }
    }

    /// An execution snapshot arriving on the topic: a first sighting is
    /// submitted through the gate; a Queued one retries admission.
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn handle_execution(&self, execution: Execution) -> Result<(), CoreError> {
        let stored = self.storage.get_execution(&execution.id).await?;

        match stored {
            None => {
                self.submit(execution).await?;
                Ok(())
            }
            Some(stored) if stored.state.current == StateType::Queued => {
                let concurrency = self.flows.concurrency(&stored.flow());
                let outcome = self
                    .admission
                    .try_admit(&stored, concurrency.as_ref())
                    .await?;
                if outcome == AdmissionOutcome::Admitted {
                    let running = stored.with_state(StateType::Running);
                    self.storage.save_execution(&running).await?;
                    info!("queued execution admitted");
                    let _ = self.changed.send(running);
                }
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    /// Join a task-run result into the execution, or drop it as stale.
    #[instrument(skip(self, task_run), fields(execution_id = %execution_id, task_run_id = %task_run.id))]
    async fn apply_task_run(
        &self,
        execution_id: &str,
        task_run: TaskRun,
    ) -> Result<(), CoreError> {
        let mut tx = self.storage.begin().await?;
        let Some(execution) = tx.lock_execution(execution_id).await? else {
            tx.rollback().await?;
            return Err(CoreError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            });
        };

        if !execution.has_task_run_joinable(&task_run) {
            debug!(
                state = ?task_run.state.current,
                "dropping stale or duplicate task-run update"
            );
            tx.rollback().await?;
            return Ok(());
        }

        let incoming_terminal = task_run.state.is_terminated();
        let (effective, retry_followup) = self.resolve_retry(&execution, task_run.clone());

        let mut updated = execution.with_task_run(effective);

        if updated.state.is_created() && updated.has_running() {
            updated = updated.with_state(StateType::Running);
        }

        if updated.all_terminated() && !updated.state.is_terminated() {
            let kill_requested = updated.state.current == StateType::Killing;
            let final_state = updated.guess_final_state(self.tasks.as_ref(), kill_requested);
            updated = updated.with_state(final_state);
        }

        tx.save_execution(&updated).await?;
        tx.commit().await?;

        if incoming_terminal {
            self.jobs
                .complete(&task_job_id(execution_id, &task_run.id))
                .await?;
        }

        match retry_followup {
            Some(RetryFollowup::Job(job)) => {
                self.jobs.publish(&job).await?;
            }
            Some(RetryFollowup::Execution(child)) => {
                info!(child_id = %child.id, "retrying through a new execution");
                let child_id = child.id.clone();
                self.executions
                    .publish(
                        Some(&child_id),
                        &ExecutionMessage::Execution { execution: child },
                    )
                    .await?;
            }
            None => {}
        }

        if updated.state.is_terminated() {
            self.admission.release(&updated).await?;
        }

        let _ = self.changed.send(updated);
        Ok(())
    }

    /// Apply the task's retry policy to a failed result. Returns the state
    /// to store for the run, and what to publish after commit.
    fn resolve_retry(
        &self,
        execution: &Execution,
        task_run: TaskRun,
    ) -> (TaskRun, Option<RetryFollowup>) {
        if !task_run.state.is_failed() {
            return (task_run, None);
        }

        let Some(descriptor) = self.tasks.resolve(&task_run.task_id) else {
            return (task_run, None);
        };
        let Some(retry) = descriptor.retry else {
            return (task_run, None);
        };

        let last_attempt = task_run.state.ended_at().unwrap_or_else(chrono::Utc::now);
        if retry
            .policy
            .next_retry_at(task_run.attempt_count(), last_attempt)
            .is_none()
        {
            debug!(task_id = %task_run.task_id, "retry policy exhausted");
            return (task_run, None);
        }

        match retry.behavior {
            RetryBehavior::RetryFailedTask => {
                let retrying = task_run.with_state(StateType::Retrying);
                let job = WorkerJob::Task {
                    job_id: task_job_id(&execution.id, &task_run.id),
                    execution_id: execution.id.clone(),
                    task_run: retrying.clone(),
                    attempt: task_run.attempt_count() as i32 + 1,
                };
                (retrying, Some(RetryFollowup::Job(job)))
            }
            RetryBehavior::CreateNewExecution => {
                let retried = task_run.with_state(StateType::Retried);
                let child = execution.child_execution(
                    Uuid::new_v4().to_string(),
                    Vec::new(),
                    State::default(),
                );
                (retried, Some(RetryFollowup::Execution(child)))
            }
        }
    }

    /// Move a live execution into Killing; the final Killed state lands
    /// when the in-flight task runs report back terminal.
    #[instrument(skip(self))]
    async fn apply_kill(&self, execution_id: &str) -> Result<(), CoreError> {
        let mut tx = self.storage.begin().await?;
        let Some(execution) = tx.lock_execution(execution_id).await? else {
            tx.rollback().await?;
            return Err(CoreError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            });
        };

        if execution.state.is_terminated() {
            debug!("kill for an already terminated execution, ignoring");
            tx.rollback().await?;
            return Ok(());
        }

        // Nothing in flight to wait for: terminal immediately.
        let updated = if execution.task_run_list.is_empty() || execution.all_terminated() {
            execution.with_state(StateType::Killed)
        } else {
            execution.with_state(StateType::Killing)
        };

        tx.save_execution(&updated).await?;
        tx.commit().await?;

        if updated.state.is_terminated() {
            self.admission.release(&updated).await?;
        }
        let _ = self.changed.send(updated);
        Ok(())
    }

    /// Move a paused execution back to Running.
    #[instrument(skip(self))]
    async fn apply_resume(&self, execution_id: &str) -> Result<(), CoreError> {
        let mut tx = self.storage.begin().await?;
        let Some(execution) = tx.lock_execution(execution_id).await? else {
            tx.rollback().await?;
            return Err(CoreError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            });
        };

        if !execution.state.is_paused() {
            warn!(state = ?execution.state.current, "resume for an execution that is not paused");
            tx.rollback().await?;
            return Ok(());
        }

        let updated = execution.with_state(StateType::Running);
        tx.save_execution(&updated).await?;
        tx.commit().await?;

        let _ = self.changed.send(updated);
        Ok(())
    }

    /// Consume the executions topic until shutdown.
    pub async fn run(
        self: Arc<Self>,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) {
        let executions = self.executions.clone();
        executions
            .subscribe(EXECUTOR_GROUP, poll_interval, shutdown, |delivery| {
                let executor = self.clone();
                async move { executor.deliver(delivery).await }
            })
            .await;
    }

    async fn deliver(&self, delivery: Delivery<ExecutionMessage>) -> Result<(), CoreError> {
        match delivery {
            Ok(envelope) => match self.handle(envelope.message).await {
                // An unknown execution cannot become known by redelivering
                // the same message; drop it instead of wedging the topic.
                Err(CoreError::ExecutionNotFound { execution_id }) => {
                    warn!(execution_id = %execution_id, "result for unknown execution, dropping");
                    Ok(())
                }
                other => other,
            },
            Err(e) => {
                warn!(error = %e, "skipping malformed execution message");
                Ok(())
            }
        }
    }
}

enum RetryFollowup {
    Job(WorkerJob),
    Execution(Execution),
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration as StdDuration;
    use strom_model::{
        ConcurrencyBehavior, EmptyResolver, Retry, RetryPolicy, TaskDescriptor,
    };

    use crate::storage::SqliteStorage;

    async fn sqlite() -> Arc<dyn Storage> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::run_sqlite(&pool).await.unwrap();
        Arc::new(SqliteStorage::new(pool))
    }

    fn executor(storage: Arc<dyn Storage>) -> Executor {
        Executor::new(storage, Arc::new(EmptyResolver), Arc::new(NoConcurrency))
    }

    fn flow() -> FlowId {
        FlowId::new("main", "company.team", "daily-report")
    }

    fn running_run(id: &str) -> TaskRun {
        TaskRun::new(id, "extract").with_state(StateType::Running)
    }

    #[tokio::test]
    async fn task_run_results_drive_the_execution_to_success() {
        let storage = sqlite().await;
        let executor = executor(storage.clone());

        let execution = executor.submit(Execution::new(&flow())).await.unwrap();
        assert_eq!(execution.state.current, StateType::Created);

        executor
            .apply_task_run(&execution.id, running_run("run-1"))
            .await
            .unwrap();
        let mid = storage.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(mid.state.current, StateType::Running);

        executor
            .apply_task_run(&execution.id, running_run("run-1").with_state(StateType::Success))
            .await
            .unwrap();
        let done = storage.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(done.state.current, StateType::Success);
        assert!(done.state.ended_at().is_some());
    }

    #[tokio::test]
    async fn stale_result_does_not_regress_the_execution() {
        let storage = sqlite().await;
        let executor = executor(storage.clone());

        let execution = executor.submit(Execution::new(&flow())).await.unwrap();
        let terminal = running_run("run-1").with_state(StateType::Success);
        executor
            .apply_task_run(&execution.id, terminal)
            .await
            .unwrap();

        // A late RUNNING snapshot from a slow worker must be dropped.
        executor
            .apply_task_run(&execution.id, running_run("run-1"))
            .await
            .unwrap();

        let stored = storage.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.state.current, StateType::Success);
        assert_eq!(
            stored.task_run_list[0].state.current,
            StateType::Success
        );
    }

    #[tokio::test]
    async fn unknown_execution_is_an_error() {
        let storage = sqlite().await;
        let executor = executor(storage);

        let err = executor
            .apply_task_run("missing", running_run("run-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ExecutionNotFound { .. }));
    }

    #[tokio::test]
    async fn kill_waits_for_running_tasks_then_lands_killed() {
        let storage = sqlite().await;
        let executor = executor(storage.clone());

        let execution = executor.submit(Execution::new(&flow())).await.unwrap();
        executor
            .apply_task_run(&execution.id, running_run("run-1"))
            .await
            .unwrap();

        executor.apply_kill(&execution.id).await.unwrap();
        let killing = storage.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(killing.state.current, StateType::Killing);

        executor
            .apply_task_run(&execution.id, running_run("run-1").with_state(StateType::Killed))
            .await
            .unwrap();
        let killed = storage.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(killed.state.current, StateType::Killed);
    }

    #[tokio::test]
    async fn kill_with_nothing_in_flight_is_immediate() {
        let storage = sqlite().await;
        let executor = executor(storage.clone());

        let execution = executor.submit(Execution::new(&flow())).await.unwrap();
        executor.apply_kill(&execution.id).await.unwrap();

        let stored = storage.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.state.current, StateType::Killed);
    }

    #[tokio::test]
    async fn resume_only_applies_to_paused_executions() {
        let storage = sqlite().await;
        let executor = executor(storage.clone());

        let execution = executor
            .submit(Execution::new(&flow()).with_state(StateType::Paused))
            .await
            .unwrap();
        executor.apply_resume(&execution.id).await.unwrap();

        let stored = storage.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.state.current, StateType::Running);

        // A second resume is a no-op.
        executor.apply_resume(&execution.id).await.unwrap();
        let again = storage.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(again.state.histories.len(), stored.state.histories.len());
    }

    #[tokio::test]
    async fn deferred_execution_is_admitted_after_release() {
        let storage = sqlite().await;

        let mut flows = HashMap::new();
        flows.insert(
            flow().uid(),
            Concurrency {
                limit: 1,
                behavior: ConcurrencyBehavior::Queue,
            },
        );
        let executor = Executor::new(storage.clone(), Arc::new(EmptyResolver), Arc::new(flows));

        let first = executor.submit(Execution::new(&flow())).await.unwrap();
        let second = executor.submit(Execution::new(&flow())).await.unwrap();
        assert_eq!(second.state.current, StateType::Queued);

        // First execution finishes, freeing its slot.
        executor
            .apply_task_run(&first.id, running_run("run-1").with_state(StateType::Success))
            .await
            .unwrap();

        // The queued execution is re-offered on the topic and admitted.
        executor
            .handle(ExecutionMessage::Execution {
                execution: second.clone(),
            })
            .await
            .unwrap();
        let stored = storage.get_execution(&second.id).await.unwrap().unwrap();
        assert_eq!(stored.state.current, StateType::Running);
    }

    #[tokio::test]
    async fn over_limit_cancel_policy_terminates_on_arrival() {
        let storage = sqlite().await;

        let mut flows = HashMap::new();
        flows.insert(
            flow().uid(),
            Concurrency {
                limit: 1,
                behavior: ConcurrencyBehavior::Cancel,
            },
        );
        let executor = Executor::new(storage.clone(), Arc::new(EmptyResolver), Arc::new(flows));

        executor.submit(Execution::new(&flow())).await.unwrap();
        let second = executor.submit(Execution::new(&flow())).await.unwrap();
        assert_eq!(second.state.current, StateType::Cancelled);
        assert!(second.state.is_terminated());
    }

    #[tokio::test]
    async fn failed_task_with_retry_goes_retrying_and_republishes_a_job() {
        let storage = sqlite().await;

        let mut tasks = HashMap::new();
        tasks.insert(
            "extract".to_string(),
            TaskDescriptor {
                retry: Some(Retry {
                    policy: RetryPolicy::Constant {
                        interval: StdDuration::from_secs(1),
                        max_attempts: Some(3),
                        max_duration: None,
                    },
                    behavior: RetryBehavior::RetryFailedTask,
                }),
                ..Default::default()
            },
        );
        let executor = Executor::new(storage.clone(), Arc::new(tasks), Arc::new(NoConcurrency));

        let execution = executor.submit(Execution::new(&flow())).await.unwrap();
        executor
            .apply_task_run(&execution.id, running_run("run-1").with_state(StateType::Failed))
            .await
            .unwrap();

        let stored = storage.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.task_run_list[0].state.current, StateType::Retrying);
        assert!(!stored.state.is_terminated());

        // A fresh job for the run is on the worker topic.
        let jobs: Queue<WorkerJob> = Queue::new(storage.clone(), message::WORKER_JOBS);
        let deliveries = jobs.poll_once("test").await.unwrap();
        assert_eq!(deliveries.len(), 1);
        let job = &deliveries[0].as_ref().unwrap().message;
        assert_eq!(job.job_id(), task_job_id(&execution.id, "run-1"));
    }

    #[tokio::test]
    async fn failed_task_without_retry_fails_the_execution() {
        let storage = sqlite().await;
        let executor = executor(storage.clone());

        let execution = executor.submit(Execution::new(&flow())).await.unwrap();
        executor
            .apply_task_run(&execution.id, running_run("run-1").with_state(StateType::Failed))
            .await
            .unwrap();

        let stored = storage.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.state.current, StateType::Failed);
    }

    #[tokio::test]
    async fn retry_as_new_execution_spawns_a_lineage_child() {
        let storage = sqlite().await;

        let mut tasks = HashMap::new();
        tasks.insert(
            "extract".to_string(),
            TaskDescriptor {
                retry: Some(Retry {
                    policy: RetryPolicy::Constant {
                        interval: StdDuration::from_secs(1),
                        max_attempts: Some(3),
                        max_duration: None,
                    },
                    behavior: RetryBehavior::CreateNewExecution,
                }),
                ..Default::default()
            },
        );
        let executor = Executor::new(storage.clone(), Arc::new(tasks), Arc::new(NoConcurrency));

        let execution = executor.submit(Execution::new(&flow())).await.unwrap();
        executor
            .apply_task_run(&execution.id, running_run("run-1").with_state(StateType::Failed))
            .await
            .unwrap();

        let executions: Queue<ExecutionMessage> = Queue::new(storage.clone(), message::EXECUTIONS);
        let deliveries = executions.poll_once("test").await.unwrap();
        let children: Vec<&Execution> = deliveries
            .iter()
            .filter_map(|d| match &d.as_ref().unwrap().message {
                ExecutionMessage::Execution { execution } => Some(execution),
                _ => None,
            })
            .collect();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].original_id(), execution.id);
        assert_ne!(children[0].id, execution.id);
        assert_eq!(children[0].state.current, StateType::Created);
    }

    #[tokio::test]
    async fn execution_survives_a_worker_crash_mid_task() {
        use crate::clock::FixedClock;
        use crate::tracker::{LivenessMonitor, WorkerInstance, WorkerJobQueue};

        let storage = sqlite().await;
        let executor = executor(storage.clone());
        let jobs = WorkerJobQueue::new(storage.clone());
        let t0 = chrono::Utc::now();

        let execution = executor.submit(Execution::new(&flow())).await.unwrap();
        executor
            .apply_task_run(&execution.id, running_run("run-1"))
            .await
            .unwrap();

        // First worker claims the job and dies without a heartbeat.
        let job = WorkerJob::Task {
            job_id: task_job_id(&execution.id, "run-1"),
            execution_id: execution.id.clone(),
            task_run: running_run("run-1"),
            attempt: 1,
        };
        jobs.publish(&job).await.unwrap();
        let dead = WorkerInstance::new("default");
        jobs.poll_and_claim(&dead, t0, 10).await.unwrap();

        let clock = Arc::new(FixedClock::new(t0 + chrono::Duration::seconds(60)));
        let monitor =
            LivenessMonitor::new(storage.clone(), clock, Duration::from_secs(30), 5);
        assert_eq!(monitor.sweep().await.unwrap(), 1);

        // A survivor picks the requeued job up and finishes the task.
        let survivor = WorkerInstance::new("default");
        let batch = jobs
            .poll_and_claim(&survivor, t0 + chrono::Duration::seconds(61), 10)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);

        executor
            .apply_task_run(&execution.id, running_run("run-1").with_state(StateType::Success))
            .await
            .unwrap();

        let stored = storage.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.state.current, StateType::Success);

        // The terminal result also dropped the claim.
        assert!(storage
            .stale_worker_jobs(t0 + chrono::Duration::seconds(600))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn change_broadcast_carries_snapshots() {
        let storage = sqlite().await;
        let executor = executor(storage.clone());
        let mut changes = executor.on_execution_changed();

        let execution = executor.submit(Execution::new(&flow())).await.unwrap();
        executor
            .apply_task_run(&execution.id, running_run("run-1"))
            .await
            .unwrap();

        let first = changes.recv().await.unwrap();
        assert_eq!(first.id, execution.id);
        let second = changes.recv().await.unwrap();
        assert_eq!(second.state.current, StateType::Running);
    }
}
