// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One run of one task node within an execution.

use serde::{Deserialize, Serialize};

use crate::state::{State, StateType};

/// One retry attempt of a task run, with its own state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunAttempt {
    /// State history of this attempt.
    pub state: State,
}

impl TaskRunAttempt {
    /// A fresh attempt in the given state.
    pub fn new(state: State) -> Self {
        Self { state }
    }
}

/// One execution of one task node.
///
/// Updates to a task run are always full snapshots: the reconciler replaces
/// the held value wholesale, never merging fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    /// Unique id of this run within the execution.
    pub id: String,
    /// The task definition this run corresponds to.
    pub task_id: String,
    /// Iteration key distinguishing repeated runs of the same task, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Current state plus full history.
    pub state: State,
    /// Attempt records, oldest first.
    #[serde(default)]
    pub attempts: Vec<TaskRunAttempt>,
}

impl TaskRun {
    /// A fresh task run in the Created state.
    pub fn new(id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_id: task_id.into(),
            value: None,
            state: State::default(),
            attempts: Vec::new(),
        }
    }

    /// Whether `other` refers to the same run: same id and iteration value.
    pub fn is_same(&self, other: &TaskRun) -> bool {
        self.id == other.id && self.value == other.value
    }

    /// This run with a state transition appended.
    pub fn with_state(&self, state: StateType) -> Self {
        Self {
            state: self.state.with_state(state),
            ..self.clone()
        }
    }

    /// Number of attempts made so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_same_compares_id_and_value() {
        let a = TaskRun::new("run-1", "extract");
        let b = TaskRun::new("run-1", "extract");
        assert!(a.is_same(&b));

        let mut c = b.clone();
        c.value = Some("partition-3".to_string());
        assert!(!a.is_same(&c));

        let d = TaskRun::new("run-2", "extract");
        assert!(!a.is_same(&d));
    }

    #[test]
    fn with_state_keeps_identity() {
        let run = TaskRun::new("run-1", "extract").with_state(StateType::Running);
        assert_eq!(run.id, "run-1");
        assert_eq!(run.state.current, StateType::Running);
        assert_eq!(run.state.histories.len(), 2);
    }
}
