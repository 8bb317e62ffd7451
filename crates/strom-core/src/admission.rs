// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-flow concurrency admission.
//!
//! Counting the flow's admitted executions and recording the new one happen
//! inside one storage transaction, so the configured limit holds under
//! concurrent submissions across engine nodes.

use std::sync::Arc;

use strom_model::{Concurrency, ConcurrencyBehavior, Execution};
use tracing::debug;

use crate::error::CoreError;
use crate::storage::Storage;

/// What happened to an execution at the admission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// A slot was free (or no limit applies); the execution may run.
    Admitted,
    /// The flow is at its limit; the execution waits in the Queued state.
    Deferred,
    /// The flow is at its limit; policy says cancel the execution.
    Cancelled,
    /// The flow is at its limit; policy says fail the execution.
    Failed,
}

/// The admission gate in front of the executor.
#[derive(Clone)]
pub struct AdmissionController {
    storage: Arc<dyn Storage>,
}

impl AdmissionController {
    /// A controller over `storage`.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Try to admit `execution` under the flow's concurrency settings.
    ///
    /// Without configured concurrency the gate is a no-op: nothing is
    /// counted and nothing recorded. Admission is idempotent for an
    /// execution already holding a slot.
    pub async fn try_admit(
        &self,
        execution: &Execution,
        concurrency: Option<&Concurrency>,
    ) -> Result<AdmissionOutcome, CoreError> {
        let Some(concurrency) = concurrency else {
            return Ok(AdmissionOutcome::Admitted);
        };

        let flow = execution.flow();
        let (admitted, count) = self
            .storage
            .count_and_admit(&flow, &execution.id, concurrency.limit)
            .await?;

        if admitted {
            return Ok(AdmissionOutcome::Admitted);
        }

        debug!(
            flow = %flow,
            execution_id = %execution.id,
            running = count,
            limit = concurrency.limit,
            behavior = ?concurrency.behavior,
            "flow at concurrency limit"
        );

        Ok(match concurrency.behavior {
            ConcurrencyBehavior::Queue => AdmissionOutcome::Deferred,
            ConcurrencyBehavior::Cancel => AdmissionOutcome::Cancelled,
            ConcurrencyBehavior::Fail => AdmissionOutcome::Failed,
        })
    }

    /// Free the slot of a terminated execution, if it held one.
    pub async fn release(&self, execution: &Execution) -> Result<(), CoreError> {
        self.storage
            .release_running(&execution.flow(), &execution.id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use strom_model::FlowId;

    use crate::storage::SqliteStorage;

    async fn controller() -> (AdmissionController, Arc<dyn Storage>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::run_sqlite(&pool).await.unwrap();
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::new(pool));
        (AdmissionController::new(storage.clone()), storage)
    }

    fn execution() -> Execution {
        Execution::new(&FlowId::new("main", "company.team", "daily-report"))
    }

    fn limit(n: u32, behavior: ConcurrencyBehavior) -> Concurrency {
        Concurrency { limit: n, behavior }
    }

    #[tokio::test]
    async fn no_concurrency_means_no_gate() {
        let (controller, storage) = controller().await;
        let execution = execution();

        let outcome = controller.try_admit(&execution, None).await.unwrap();
        assert_eq!(outcome, AdmissionOutcome::Admitted);
        assert_eq!(storage.running_count(&execution.flow()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn behavior_maps_over_limit_outcomes() {
        let (controller, _) = controller().await;

        let first = execution();
        let gate = limit(1, ConcurrencyBehavior::Queue);
        assert_eq!(
            controller.try_admit(&first, Some(&gate)).await.unwrap(),
            AdmissionOutcome::Admitted
        );

        let second = execution();
        assert_eq!(
            controller.try_admit(&second, Some(&gate)).await.unwrap(),
            AdmissionOutcome::Deferred
        );
        assert_eq!(
            controller
                .try_admit(&second, Some(&limit(1, ConcurrencyBehavior::Cancel)))
                .await
                .unwrap(),
            AdmissionOutcome::Cancelled
        );
        assert_eq!(
            controller
                .try_admit(&second, Some(&limit(1, ConcurrencyBehavior::Fail)))
                .await
                .unwrap(),
            AdmissionOutcome::Failed
        );
    }

    #[tokio::test]
    async fn release_frees_the_slot() {
        let (controller, _) = controller().await;
        let gate = limit(1, ConcurrencyBehavior::Queue);

        let first = execution();
        let second = execution();

        assert_eq!(
            controller.try_admit(&first, Some(&gate)).await.unwrap(),
            AdmissionOutcome::Admitted
        );
        assert_eq!(
            controller.try_admit(&second, Some(&gate)).await.unwrap(),
            AdmissionOutcome::Deferred
        );

        controller.release(&first).await.unwrap();
        assert_eq!(
            controller.try_admit(&second, Some(&gate)).await.unwrap(),
            AdmissionOutcome::Admitted
        );
    }

    #[tokio::test]
    async fn admission_is_idempotent_for_a_holder() {
        let (controller, storage) = controller().await;
        let gate = limit(1, ConcurrencyBehavior::Queue);
        let first = execution();

        for _ in 0..3 {
            assert_eq!(
                controller.try_admit(&first, Some(&gate)).await.unwrap(),
                AdmissionOutcome::Admitted
            );
        }
        assert_eq!(storage.running_count(&first.flow()).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn limit_holds_under_concurrent_submissions() {
        let (controller, storage) = controller().await;
        let gate = limit(3, ConcurrencyBehavior::Queue);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let controller = controller.clone();
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                controller.try_admit(&execution(), Some(&gate)).await.unwrap()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() == AdmissionOutcome::Admitted {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 3);
        assert_eq!(
            storage
                .running_count(&FlowId::new("main", "company.team", "daily-report"))
                .await
                .unwrap(),
            3
        );
    }
}
