// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Multi-source correlation over shared time windows.
//!
//! Each flow condition that waits on several sources owns at most one open
//! window record. Results folding into the window are keyed purely by the
//! condition and the window boundaries computed from the wall clock, so
//! every node lands results in the same window. Once every expected source
//! has reported satisfied within the window, a synthetic execution is
//! published and the record dropped; windows that lapse without completing
//! are swept away.

use std::sync::Arc;
use std::time::Duration;

use strom_model::{Execution, MultipleConditionWindow};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::error::CoreError;
use crate::message::{self, ExecutionMessage, TriggerResult};
use crate::queue::{Delivery, Queue};
use crate::storage::Storage;

/// Consumer group of the correlator on the trigger-results topic.
const CORRELATOR_GROUP: &str = "correlator";

/// Folds trigger results into windows and fires completed conditions.
pub struct Correlator {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    executions: Queue<ExecutionMessage>,
    results: Queue<TriggerResult>,
}

impl Correlator {
    /// A correlator over `storage`, reading time through `clock`.
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            executions: Queue::new(storage.clone(), message::EXECUTIONS),
            results: Queue::new(storage.clone(), message::TRIGGER_RESULTS),
            storage,
            clock,
        }
    }

    /// Publish a trigger result for correlation.
    pub async fn publish(&self, result: &TriggerResult) -> Result<i64, CoreError> {
        self.results
            .publish(Some(&result.flow.uid()), result)
            .await
    }

    /// Fold one result into its condition's window; fire when complete.
    #[instrument(skip(self, result), fields(flow = %result.flow, condition_id = %result.condition_id))]
    pub async fn handle(&self, result: TriggerResult) -> Result<(), CoreError> {
        let now = self.clock.now();

        // Reuse the open window while its boundaries still contain now; a
        // lapsed window is abandoned and a fresh one started in its place.
        let window = match self
            .storage
            .get_window(&result.flow, &result.condition_id)
            .await?
        {
            Some(window) if window.is_valid(now) => window,
            _ => MultipleConditionWindow::new(
                &result.flow,
                result.condition_id.clone(),
                &result.time_window,
                serde_json::Map::new(),
                now,
            ),
        };

        let window = window.with_result(
            result.sub_condition_id.clone(),
            result.satisfied,
            result.outputs.clone(),
        );

        if window.is_complete(&result.expected) {
            self.storage
                .delete_window(&result.flow, &result.condition_id)
                .await?;
            self.fire(&window).await?;
        } else {
            debug!(
                reported = window.results.len(),
                expected = result.expected.len(),
                "window still waiting on sources"
            );
            self.storage.save_window(&window).await?;
        }

        Ok(())
    }

    /// Publish the execution a completed window triggers.
    async fn fire(&self, window: &MultipleConditionWindow) -> Result<(), CoreError> {
        let flow = strom_model::FlowId::new(
            window.tenant_id.clone(),
            window.namespace.clone(),
            window.flow_id.clone(),
        );
        let mut execution = Execution::new(&flow);
        execution.trigger_outputs = Some(window.outputs.clone());

        info!(
            flow = %flow,
            condition_id = %window.condition_id,
            execution_id = %execution.id,
            "window complete, firing execution"
        );

        let execution_id = execution.id.clone();
        self.executions
            .publish(
                Some(&execution_id),
                &ExecutionMessage::Execution { execution },
            )
            .await?;
        Ok(())
    }

    /// Drop every window of `tenant_id` whose end has passed. Returns how
    /// many were swept.
    pub async fn sweep_expired(&self, tenant_id: &str) -> Result<usize, CoreError> {
        let now = self.clock.now();
        let expired = self.storage.expired_windows(tenant_id, now).await?;
        let count = expired.len();

        for window in expired {
            debug!(
                flow_id = %window.flow_id,
                condition_id = %window.condition_id,
                end = %window.end,
                "sweeping expired window"
            );
            let flow = strom_model::FlowId::new(
                window.tenant_id.clone(),
                window.namespace.clone(),
                window.flow_id.clone(),
            );
            self.storage
                .delete_window(&flow, &window.condition_id)
                .await?;
        }

        Ok(count)
    }

    /// Consume the trigger-results topic until shutdown.
    pub async fn run(
        self: Arc<Self>,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) {
        let results = self.results.clone();
        results
            .subscribe(CORRELATOR_GROUP, poll_interval, shutdown, |delivery| {
                let correlator = self.clone();
                async move { correlator.deliver(delivery).await }
            })
            .await;
    }

    /// Sweep expired windows of `tenant_id` periodically until shutdown.
    pub async fn run_sweeper(
        self: Arc<Self>,
        tenant_id: String,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        info!("window sweeper started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("window sweeper stopping");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_expired(&tenant_id).await {
                        error!(error = %e, "window sweep failed");
                    }
                }
            }
        }
    }

    async fn deliver(&self, delivery: Delivery<TriggerResult>) -> Result<(), CoreError> {
        match delivery {
            Ok(envelope) => self.handle(envelope.message).await,
            Err(e) => {
                warn!(error = %e, "skipping malformed trigger result");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use sqlx::sqlite::SqlitePoolOptions;
    use strom_model::{FlowId, TimeWindow};

    use crate::clock::FixedClock;
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

    fn flow() -> FlowId {
        FlowId::new("main", "company.team", "aggregate")
    }

    fn result(sub: &str, satisfied: bool, window: TimeWindow) -> TriggerResult {
        TriggerResult {
            flow: flow(),
            condition_id: "all-sources".to_string(),
            sub_condition_id: sub.to_string(),
            satisfied,
            expected: vec!["orders".to_string(), "stock".to_string()],
            time_window: window,
            outputs: serde_json::Map::new(),
        }
    }

    async fn fired_executions(storage: &Arc<dyn Storage>) -> Vec<Execution> {
        let executions: Queue<ExecutionMessage> = Queue::new(storage.clone(), message::EXECUTIONS);
        executions
            .poll_once("test")
            .await
            .unwrap()
            .into_iter()
            .filter_map(|d| match d.unwrap().message {
                ExecutionMessage::Execution { execution } => Some(execution),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn fires_only_when_every_source_reported() {
        let storage = sqlite().await;
        let t0 = Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let correlator = Correlator::new(storage.clone(), clock);

        correlator
            .handle(result("orders", true, TimeWindow::default()))
            .await
            .unwrap();
        assert!(fired_executions(&storage).await.is_empty());
        assert!(storage.get_window(&flow(), "all-sources").await.unwrap().is_some());

        correlator
            .handle(result("stock", true, TimeWindow::default()))
            .await
            .unwrap();

        let fired = fired_executions(&storage).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].flow_id, "aggregate");
        assert!(storage.get_window(&flow(), "all-sources").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unsatisfied_source_does_not_complete_the_window() {
        let storage = sqlite().await;
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap(),
        ));
        let correlator = Correlator::new(storage.clone(), clock);

        correlator
            .handle(result("orders", true, TimeWindow::default()))
            .await
            .unwrap();
        correlator
            .handle(result("stock", false, TimeWindow::default()))
            .await
            .unwrap();

        assert!(fired_executions(&storage).await.is_empty());
        let window = storage
            .get_window(&flow(), "all-sources")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(window.results.get("stock"), Some(&false));
    }

    #[tokio::test]
    async fn results_outside_the_window_start_a_fresh_one() {
        let storage = sqlite().await;
        let t0 = Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let correlator = Correlator::new(storage.clone(), clock.clone());

        let sliding = TimeWindow::SlidingWindow {
            window: ChronoDuration::seconds(2),
        };

        correlator
            .handle(result("orders", true, sliding.clone()))
            .await
            .unwrap();

        // The second source reports after the window lapsed: the stale
        // window is replaced, not completed.
        clock.advance(ChronoDuration::seconds(3));
        correlator
            .handle(result("stock", true, sliding))
            .await
            .unwrap();

        assert!(fired_executions(&storage).await.is_empty());
        let window = storage
            .get_window(&flow(), "all-sources")
            .await
            .unwrap()
            .unwrap();
        assert!(!window.results.contains_key("orders"));
        assert_eq!(window.results.get("stock"), Some(&true));
    }

    #[tokio::test]
    async fn fired_execution_carries_merged_outputs() {
        let storage = sqlite().await;
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap(),
        ));
        let correlator = Correlator::new(storage.clone(), clock);

        let mut orders = result("orders", true, TimeWindow::default());
        orders
            .outputs
            .insert("orders".to_string(), serde_json::json!({"rows": 10}));
        let mut stock = result("stock", true, TimeWindow::default());
        stock
            .outputs
            .insert("stock".to_string(), serde_json::json!({"rows": 4}));

        correlator.handle(orders).await.unwrap();
        correlator.handle(stock).await.unwrap();

        let fired = fired_executions(&storage).await;
        let outputs = fired[0].trigger_outputs.as_ref().unwrap();
        assert_eq!(outputs["orders"]["rows"], 10);
        assert_eq!(outputs["stock"]["rows"], 4);
    }

    #[tokio::test]
    async fn sweeper_drops_lapsed_windows() {
        let storage = sqlite().await;
        let t0 = Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let correlator = Correlator::new(storage.clone(), clock.clone());

        correlator
            .handle(result(
                "orders",
                true,
                TimeWindow::SlidingWindow {
                    window: ChronoDuration::seconds(2),
                },
            ))
            .await
            .unwrap();

        assert_eq!(correlator.sweep_expired("main").await.unwrap(), 0);

        clock.advance(ChronoDuration::seconds(5));
        assert_eq!(correlator.sweep_expired("main").await.unwrap(), 1);
        assert!(storage.get_window(&flow(), "all-sources").await.unwrap().is_none());
    }
}
