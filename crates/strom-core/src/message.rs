// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire messages exchanged over the durable queues.
//!
//! Payloads are JSON, tagged by a `type` field so topics can carry more than
//! one message kind without a schema registry.

use serde::{Deserialize, Serialize};
use strom_model::{Execution, FlowId, TaskRun, TimeWindow};

/// Topic carrying execution lifecycle messages, consumed by the executor.
pub const EXECUTIONS: &str = "executions";

/// Topic carrying jobs for workers, consumed in claim mode.
pub const WORKER_JOBS: &str = "worker_jobs";

/// Topic carrying per-source trigger results, consumed by the correlator.
pub const TRIGGER_RESULTS: &str = "trigger_results";

/// A message on the executions topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMessage {
    /// A full execution snapshot: a new submission or a state broadcast.
    Execution {
        /// The execution aggregate.
        execution: Execution,
    },
    /// A task-run outcome reported by a worker.
    TaskRunResult {
        /// Execution the task run belongs to.
        execution_id: String,
        /// Full task-run snapshot.
        task_run: TaskRun,
    },
    /// Request to kill an execution.
    Kill {
        /// Execution to kill.
        execution_id: String,
    },
    /// Request to resume a paused execution.
    Resume {
        /// Execution to resume.
        execution_id: String,
    },
}

/// A job on the worker topic, delivered at-least-once under a claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerJob {
    /// Run one task attempt.
    Task {
        /// Stable job id, also the claim key.
        job_id: String,
        /// Execution the task run belongs to.
        execution_id: String,
        /// The task run to execute.
        task_run: TaskRun,
        /// Delivery attempt, starting at 1.
        attempt: i32,
    },
    /// Evaluate one trigger source.
    Trigger {
        /// Stable job id, also the claim key.
        job_id: String,
        /// Flow owning the trigger.
        flow: FlowId,
        /// Condition being evaluated.
        condition_id: String,
        /// Delivery attempt, starting at 1.
        attempt: i32,
    },
}

impl WorkerJob {
    /// The claim key of this job.
    pub fn job_id(&self) -> &str {
        match self {
            Self::Task { job_id, .. } | Self::Trigger { job_id, .. } => job_id,
        }
    }

    /// The delivery attempt of this job.
    pub fn attempt(&self) -> i32 {
        match self {
            Self::Task { attempt, .. } | Self::Trigger { attempt, .. } => *attempt,
        }
    }

    /// This job re-stamped with a new delivery attempt.
    pub fn with_attempt(&self, attempt: i32) -> Self {
        let mut job = self.clone();
        match &mut job {
            Self::Task { attempt: a, .. } | Self::Trigger { attempt: a, .. } => *a = attempt,
        }
        job
    }
}

/// One source reporting into a correlation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerResult {
    /// Flow owning the multi-source condition.
    pub flow: FlowId,
    /// The condition the result belongs to.
    pub condition_id: String,
    /// The reporting sub-condition.
    pub sub_condition_id: String,
    /// Whether the sub-condition fired.
    pub satisfied: bool,
    /// Every sub-condition id that must fire for the condition to complete.
    pub expected: Vec<String>,
    /// Window definition; all reporters of a condition carry the same one.
    pub time_window: TimeWindow,
    /// Outputs to merge into the window record.
    #[serde(default)]
    pub outputs: serde_json::Map<String, serde_json::Value>,
}
