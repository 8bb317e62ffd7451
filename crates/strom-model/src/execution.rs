// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The execution aggregate: one run of a flow, and the reconciliation rules
//! that decide whether an incoming task-run update supersedes the held one.
//!
//! Updates may arrive duplicated, out of order, or from a crashed-and-
//! restarted worker; [`Execution::has_task_run_joinable`] is the single
//! place that decides newer-vs-stale. Restart lineage is tracked through
//! `original_id`, which stays constant across every restart-generated child.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::FlowId;
use crate::state::{State, StateType};
use crate::task::TaskResolver;
use crate::task_run::TaskRun;

/// One run of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Immutable id of this execution.
    pub id: String,
    /// Tenant scope.
    pub tenant_id: String,
    /// Namespace of the flow.
    pub namespace: String,
    /// Flow this execution runs.
    pub flow_id: String,
    /// Revision of the flow definition this execution was started against.
    #[serde(default)]
    pub flow_revision: u32,
    /// Parent execution id, set for sub-flow executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Id of the first execution in the restart lineage; `None` until the
    /// first restart. Read through [`Execution::original_id`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_id: Option<String>,
    /// Task runs in first-seen order.
    #[serde(default)]
    pub task_run_list: Vec<TaskRun>,
    /// Current state plus full history.
    pub state: State,
    /// Outputs carried over from a correlation-window fire, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_outputs: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Execution {
    /// A fresh execution of `flow` with a random id, in the Created state.
    pub fn new(flow: &FlowId) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: flow.tenant_id.clone(),
            namespace: flow.namespace.clone(),
            flow_id: flow.flow_id.clone(),
            flow_revision: 1,
            parent_id: None,
            original_id: None,
            task_run_list: Vec::new(),
            state: State::default(),
            trigger_outputs: None,
        }
    }

    /// The flow key this execution belongs to.
    pub fn flow(&self) -> FlowId {
        FlowId::new(
            self.tenant_id.clone(),
            self.namespace.clone(),
            self.flow_id.clone(),
        )
    }

    /// The id of the first execution in this restart lineage; equals `id`
    /// when the execution was never restarted.
    pub fn original_id(&self) -> &str {
        self.original_id.as_deref().unwrap_or(&self.id)
    }

    /// The held task run matching `task_run` by `(id, value)`, if any.
    pub fn find_task_run(&self, task_run: &TaskRun) -> Option<&TaskRun> {
        self.task_run_list.iter().find(|r| r.is_same(task_run))
    }

    /// Decide whether `incoming` should replace the task run currently held,
    /// or be ignored as a stale message or duplicate.
    ///
    /// Rules, in order:
    /// 1. unknown run: joinable (first sighting);
    /// 2. identical current state: duplicate, not joinable;
    /// 3. a terminal Failed/Killed whose history's second-to-last entry
    ///    equals the held run's current state, while the held run is already
    ///    terminal: a worker resending an outcome whose causal predecessor
    ///    is obsolete, not joinable;
    /// 4. a history shorter than the held one: an older snapshot (covers an
    ///    executor-side failure recorded before a late worker RUNNING, and a
    ///    restart reset superseding a late terminal), not joinable;
    /// 5. otherwise joinable: the incoming history extends the held one, or
    ///    is a legitimate restart of it.
    pub fn has_task_run_joinable(&self, incoming: &TaskRun) -> bool {
        let Some(current) = self.find_task_run(incoming) else {
            return true;
        };

        if current.state.current == incoming.state.current {
            return false;
        }

        if matches!(incoming.state.current, StateType::Failed | StateType::Killed)
            && current.state.is_terminated()
            && incoming
                .state
                .second_to_last()
                .is_some_and(|h| h.state == current.state.current)
        {
            return false;
        }

        if incoming.state.histories.len() < current.state.histories.len() {
            return false;
        }

        true
    }

    /// Replace the held task run with the same `(id, value)` wholesale, or
    /// append it when first seen. Insertion order is first-seen order.
    pub fn with_task_run(&self, task_run: TaskRun) -> Self {
        let mut task_run_list = self.task_run_list.clone();
        match task_run_list.iter_mut().find(|r| r.is_same(&task_run)) {
            Some(held) => *held = task_run,
            None => task_run_list.push(task_run),
        }
        Self {
            task_run_list,
            ..self.clone()
        }
    }

    /// This execution with a state transition appended.
    pub fn with_state(&self, state: StateType) -> Self {
        Self {
            state: self.state.with_state(state),
            ..self.clone()
        }
    }

    /// Spawn the next execution of a restart lineage.
    ///
    /// `original_id` is copied when already set, else seeded with the
    /// current execution's own id, so it stays constant across arbitrarily
    /// many restarts.
    pub fn child_execution(
        &self,
        new_id: impl Into<String>,
        task_run_list: Vec<TaskRun>,
        state: State,
    ) -> Self {
        Self {
            id: new_id.into(),
            original_id: Some(self.original_id().to_string()),
            task_run_list,
            state,
            ..self.clone()
        }
    }

    /// Whether any held task run is still running.
    pub fn has_running(&self) -> bool {
        self.task_run_list.iter().any(|r| r.state.is_running())
    }

    /// Whether every held task run reached a terminal type.
    pub fn all_terminated(&self) -> bool {
        !self.task_run_list.is_empty()
            && self.task_run_list.iter().all(|r| r.state.is_terminated())
    }

    /// Compute the terminal type of the execution once every task run is
    /// terminal: each failure is mapped through the task's allow flags, then
    /// the highest-severity type wins. An explicit kill request takes
    /// precedence over everything.
    pub fn guess_final_state(&self, resolver: &dyn TaskResolver, kill_requested: bool) -> StateType {
        if kill_requested {
            return StateType::Killed;
        }

        StateType::max_state(self.task_run_list.iter().map(|run| {
            if run.state.is_failed() {
                let descriptor = resolver.resolve(&run.task_id).unwrap_or_default();
                StateType::failed_for(&descriptor)
            } else {
                run.state.current
            }
        }))
    }
}
