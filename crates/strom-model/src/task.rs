// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The narrow task-description seam the reconciler depends on.
//!
//! Task definitions, plugin loading and flow parsing live outside the core;
//! the reconciler only needs a few per-task flags, resolved through an
//! injected trait.

use std::collections::HashMap;

use crate::retry::Retry;

/// The per-task capabilities the reconciler needs when computing terminal
/// state and retries.
#[derive(Debug, Clone, Default)]
pub struct TaskDescriptor {
    /// A failure of this task does not fail the execution.
    pub allow_failure: bool,
    /// Together with `allow_failure`, a failure counts as plain success.
    pub allow_warning: bool,
    /// Whether the task spawns child task runs (sub-flows, loops).
    pub flowable: bool,
    /// Retry policy applied when this task fails, if any.
    pub retry: Option<Retry>,
}

/// Resolves task ids to their descriptors.
///
/// Implemented by the flow registry; injected into the reconciler so the
/// core never touches plugin machinery. An unresolvable task id is treated
/// as a strict task (no allow flags, no retry).
pub trait TaskResolver: Send + Sync {
    /// Look up the descriptor for a task definition id.
    fn resolve(&self, task_id: &str) -> Option<TaskDescriptor>;
}

impl TaskResolver for HashMap<String, TaskDescriptor> {
    fn resolve(&self, task_id: &str) -> Option<TaskDescriptor> {
        self.get(task_id).cloned()
    }
}

/// A resolver with no tasks; every task is strict.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyResolver;

impl TaskResolver for EmptyResolver {
    fn resolve(&self, _task_id: &str) -> Option<TaskDescriptor> {
        None
    }
}
