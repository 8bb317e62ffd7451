// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model for the strom execution engine.
//!
//! Pure data types and the reconciliation rules over them: execution and
//! task-run state machines, joinability of out-of-order updates, retry
//! policies, concurrency settings, and correlation windows. Everything here
//! is persistence-free and clock-explicit so that the rules can be tested
//! without a database or a running engine.

#![deny(missing_docs)]

pub mod execution;
pub mod flow;
pub mod retry;
pub mod state;
pub mod task;
pub mod task_run;
pub mod window;

pub use execution::Execution;
pub use flow::{Concurrency, ConcurrencyBehavior, FlowId};
pub use retry::{Retry, RetryBehavior, RetryPolicy};
pub use state::{History, State, StateType};
pub use task::{EmptyResolver, TaskDescriptor, TaskResolver};
pub use task_run::{TaskRun, TaskRunAttempt};
pub use window::{MultipleConditionWindow, TimeWindow};
