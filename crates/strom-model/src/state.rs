// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution and task-run state: an enumerated status plus its full
//! transition history.
//!
//! The history is append-only and never truncated; it is the source of truth
//! for ordering decisions when updates arrive duplicated or out of order.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::task::TaskDescriptor;

/// The enumerated status of an execution or task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    /// Initial state, nothing has run yet.
    Created,
    /// At least one task run is in progress.
    Running,
    /// Suspended, waiting for an external resume signal.
    Paused,
    /// Superseded by a restart; the lineage continues under a new id.
    Restarted,
    /// A kill was requested and is being propagated.
    Killing,
    /// Terminal: everything completed.
    Success,
    /// Terminal: completed, but a failure was downgraded to a warning.
    Warning,
    /// Terminal: at least one required task run failed.
    Failed,
    /// Terminal: killed on request.
    Killed,
    /// Terminal: cancelled before running (concurrency policy).
    Cancelled,
    /// Waiting for an admission slot under a concurrency limit.
    Queued,
    /// A failed task run is waiting for its next retry attempt.
    Retrying,
    /// Terminal for an attempt that was retried in a new attempt.
    Retried,
}

impl StateType {
    /// Whether this type ends an execution or task run.
    pub fn is_terminated(self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::Warning
                | Self::Failed
                | Self::Killed
                | Self::Cancelled
                | Self::Retried
        )
    }

    /// Whether this type is actively running (including a kill in flight).
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running | Self::Killing)
    }

    /// Whether this type is a fresh, not-yet-started state.
    pub fn is_created(self) -> bool {
        matches!(self, Self::Created | Self::Restarted)
    }

    /// Whether this type is a failure.
    pub fn is_failed(self) -> bool {
        self == Self::Failed
    }

    /// Whether this type is paused.
    pub fn is_paused(self) -> bool {
        self == Self::Paused
    }

    /// Whether this type is in the retry loop.
    pub fn is_retrying(self) -> bool {
        matches!(self, Self::Retrying | Self::Retried)
    }

    /// Map a task failure through the task's allow-failure/allow-warning
    /// flags: both set gives Success, allow-failure alone gives Warning,
    /// neither gives Failed.
    pub fn failed_for(descriptor: &TaskDescriptor) -> Self {
        if descriptor.allow_failure {
            if descriptor.allow_warning {
                Self::Success
            } else {
                Self::Warning
            }
        } else {
            Self::Failed
        }
    }

    /// Severity rank used when folding several terminal task-run states into
    /// one execution state. Higher wins.
    fn severity(self) -> u8 {
        match self {
            Self::Failed => 5,
            Self::Killed => 4,
            Self::Cancelled => 3,
            Self::Warning => 2,
            _ => 1,
        }
    }

    /// The highest-severity type among `types`, or `Success` when empty.
    pub fn max_state<I: IntoIterator<Item = StateType>>(types: I) -> Self {
        types
            .into_iter()
            .max_by_key(|t| t.severity())
            .unwrap_or(Self::Success)
    }
}

/// One recorded transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    /// The type entered by this transition.
    pub state: StateType,
    /// When the transition happened.
    pub date: DateTime<Utc>,
}

/// The current status plus its full, append-only transition history.
///
/// A `State` value is immutable: every transition produces a new value with
/// one more history entry. The invariant `current == histories.last().state`
/// always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// The current type.
    pub current: StateType,
    /// Every transition in order, never truncated.
    pub histories: Vec<History>,
}

impl Default for State {
    fn default() -> Self {
        Self::new(StateType::Created)
    }
}

impl State {
    /// A fresh state with a single history entry.
    pub fn new(current: StateType) -> Self {
        Self::at(current, Utc::now())
    }

    /// A fresh state with a single history entry at an explicit instant.
    pub fn at(current: StateType, date: DateTime<Utc>) -> Self {
        Self {
            current,
            histories: vec![History {
                state: current,
                date,
            }],
        }
    }

    /// Rebuild a state from an explicit history (the last entry wins).
    pub fn of(current: StateType, histories: Vec<History>) -> Self {
        Self { current, histories }
    }

    /// Transition to `state`, appending a history entry.
    ///
    /// A transition to the current type is a no-op (the duplicate is logged
    /// and dropped, never appended).
    pub fn with_state(&self, state: StateType) -> Self {
        self.with_state_at(state, Utc::now())
    }

    /// Transition to `state` at an explicit instant.
    pub fn with_state_at(&self, state: StateType, date: DateTime<Utc>) -> Self {
        if self.current == state {
            warn!(current = ?self.current, "can't change state, already there");
            return self.clone();
        }

        let mut histories = self.histories.clone();
        histories.push(History { state, date });
        Self {
            current: state,
            histories,
        }
    }

    /// Back to Created, keeping only the first history entry.
    pub fn reset(&self) -> Self {
        Self {
            current: StateType::Created,
            histories: self.histories.first().cloned().into_iter().collect(),
        }
    }

    /// When the first transition happened.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.histories.first().map(|h| h.date)
    }

    /// When the state reached a terminal or paused type, if it has.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        if !self.is_terminated() && !self.current.is_paused() {
            return None;
        }
        self.histories.last().map(|h| h.date)
    }

    /// Elapsed time between the first and last transitions.
    pub fn duration(&self) -> Duration {
        match (self.histories.first(), self.histories.last()) {
            (Some(first), Some(last)) if self.histories.len() > 1 => last.date - first.date,
            (Some(first), _) => Utc::now() - first.date,
            _ => Duration::zero(),
        }
    }

    /// Whether the current type is terminal.
    pub fn is_terminated(&self) -> bool {
        self.current.is_terminated()
    }

    /// Whether the current type is running.
    pub fn is_running(&self) -> bool {
        self.current.is_running()
    }

    /// Whether the current type is a fresh state.
    pub fn is_created(&self) -> bool {
        self.current.is_created()
    }

    /// Whether the current type is a failure.
    pub fn is_failed(&self) -> bool {
        self.current.is_failed()
    }

    /// Whether the current type is paused.
    pub fn is_paused(&self) -> bool {
        self.current.is_paused()
    }

    /// The history entry just before the last one, when there is one.
    /// Used by the stale-update heuristic on terminal results.
    pub fn second_to_last(&self) -> Option<&History> {
        self.histories.iter().rev().nth(1)
    }
}
