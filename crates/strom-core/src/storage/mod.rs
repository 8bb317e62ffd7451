// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage interfaces and backends for strom-core.
//!
//! This module defines the storage abstraction and backend implementations.
//! Operations that must be atomic (claim-on-delivery, admission, stale-job
//! reclaim) are single trait methods so each backend can wrap them in one
//! transaction; the executor's read-modify-write cycle gets an explicit
//! transaction handle instead.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStorage;
pub use self::sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use strom_model::{Execution, FlowId, MultipleConditionWindow};

use crate::error::CoreError;

/// One row of the durable message log.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueItem {
    /// Position in the topic's total order.
    pub offset: i64,
    /// Topic the row belongs to.
    pub topic: String,
    /// Partition key, when the publisher set one.
    pub partition_key: Option<String>,
    /// JSON payload.
    pub payload: String,
}

/// One claimed worker job.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkerJobRow {
    /// The claim key.
    pub job_id: String,
    /// Worker currently holding the claim.
    pub worker_id: String,
    /// Worker group of the holder.
    pub worker_group: String,
    /// Delivery attempt recorded at claim time.
    pub attempt: i32,
    /// The job payload as delivered.
    pub payload: String,
    /// Last heartbeat of the holding worker.
    pub heartbeat_at: DateTime<Utc>,
}

/// Extracts the claim key and delivery attempt from a worker-job payload.
/// Returns `None` for payloads that cannot be claimed (malformed rows are
/// still delivered so the consumer can surface the decode error).
pub type ClaimMeta<'a> = &'a (dyn Fn(&str) -> Option<(String, i32)> + Send + Sync);

/// Storage interface used by the coordination services.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Append a payload to a topic. Returns the assigned offset.
    async fn publish(
        &self,
        topic: &str,
        partition_key: Option<&str>,
        payload: &str,
    ) -> Result<i64, CoreError>;

    /// Read up to `limit` rows past the group's cursor, without advancing it.
    async fn poll(
        &self,
        topic: &str,
        consumer_group: &str,
        limit: i64,
    ) -> Result<Vec<QueueItem>, CoreError>;

    /// Advance the group's cursor to `offset` (never backwards).
    async fn ack(&self, topic: &str, consumer_group: &str, offset: i64) -> Result<(), CoreError>;

    /// Claim-mode delivery: in one transaction, lock the group's cursor,
    /// read up to `limit` rows past it, record a claim row per job and
    /// advance the cursor past the batch.
    ///
    /// A crash after commit leaves the claim rows behind; the liveness
    /// monitor picks those up once their heartbeat goes stale.
    #[allow(clippy::too_many_arguments)]
    async fn poll_and_claim(
        &self,
        topic: &str,
        consumer_group: &str,
        worker_id: &str,
        worker_group: &str,
        now: DateTime<Utc>,
        limit: i64,
        claim_meta: ClaimMeta<'_>,
    ) -> Result<Vec<QueueItem>, CoreError>;

    /// Upsert the execution snapshot.
    async fn save_execution(&self, execution: &Execution) -> Result<(), CoreError>;

    /// Read an execution snapshot.
    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>, CoreError>;

    /// Open a transaction for a locked read-modify-write of one execution.
    async fn begin(&self) -> Result<Box<dyn StorageTx>, CoreError>;

    /// Count the flow's admitted executions and, when under `limit`, record
    /// `execution_id` as admitted, all in one transaction. Returns whether
    /// the execution was admitted, and the count observed before insertion.
    ///
    /// Concurrent calls for the same flow must serialize even when the flow
    /// has no admitted rows yet (row locks alone do not cover that case).
    async fn count_and_admit(
        &self,
        flow: &FlowId,
        execution_id: &str,
        limit: u32,
    ) -> Result<(bool, i64), CoreError>;

    /// Drop the admission row of a finished execution, if present.
    async fn release_running(&self, flow: &FlowId, execution_id: &str) -> Result<(), CoreError>;

    /// Number of currently admitted executions of the flow.
    async fn running_count(&self, flow: &FlowId) -> Result<i64, CoreError>;

    /// Drop a worker-job claim once its terminal result is reconciled.
    async fn delete_worker_job(&self, job_id: &str) -> Result<(), CoreError>;

    /// Refresh the heartbeat of every claim held by a worker.
    async fn heartbeat_worker(&self, worker_id: &str, at: DateTime<Utc>) -> Result<(), CoreError>;

    /// Claims whose heartbeat is at or before `older_than`.
    async fn stale_worker_jobs(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<WorkerJobRow>, CoreError>;

    /// Atomically remove a still-stale claim and republish its payload.
    /// Returns false when another monitor already reclaimed it (or the
    /// worker heartbeat recovered in the meantime).
    async fn requeue_stale_job(
        &self,
        job_id: &str,
        older_than: DateTime<Utc>,
        topic: &str,
        partition_key: Option<&str>,
        payload: &str,
    ) -> Result<bool, CoreError>;

    /// Read the open window of a condition, if any.
    async fn get_window(
        &self,
        flow: &FlowId,
        condition_id: &str,
    ) -> Result<Option<MultipleConditionWindow>, CoreError>;

    /// Upsert a window record.
    async fn save_window(&self, window: &MultipleConditionWindow) -> Result<(), CoreError>;

    /// Drop a window record (on completion or expiry).
    async fn delete_window(&self, flow: &FlowId, condition_id: &str) -> Result<(), CoreError>;

    /// Window records whose end passed before `now`.
    async fn expired_windows(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<MultipleConditionWindow>, CoreError>;
}

/// An open transaction scoping one locked execution read-modify-write.
///
/// Dropping the handle without calling [`StorageTx::commit`] rolls back.
#[async_trait]
pub trait StorageTx: Send {
    /// Read an execution under a row lock held until commit or rollback.
    async fn lock_execution(&mut self, execution_id: &str)
        -> Result<Option<Execution>, CoreError>;

    /// Upsert the execution snapshot within this transaction.
    async fn save_execution(&mut self, execution: &Execution) -> Result<(), CoreError>;

    /// Commit the transaction.
    async fn commit(self: Box<Self>) -> Result<(), CoreError>;

    /// Roll the transaction back explicitly.
    async fn rollback(self: Box<Self>) -> Result<(), CoreError>;
}

pub(crate) fn execution_to_row(
    execution: &Execution,
) -> Result<
    (
        String,
        Option<DateTime<Utc>>,
        Option<DateTime<Utc>>,
        String,
    ),
    CoreError,
> {
    let state = serde_json::to_string(&execution.state.current)?;
    // State types serialize as JSON strings; strip the quotes for the column.
    let state = state.trim_matches('"').to_string();
    let payload = serde_json::to_string(execution)?;
    Ok((
        state,
        execution.state.started_at(),
        execution.state.ended_at(),
        payload,
    ))
}

pub(crate) fn execution_from_payload(payload: &str) -> Result<Execution, CoreError> {
    Ok(serde_json::from_str(payload)?)
}

pub(crate) fn window_to_payload(window: &MultipleConditionWindow) -> Result<String, CoreError> {
    Ok(serde_json::to_string(window)?)
}

pub(crate) fn window_from_payload(payload: &str) -> Result<MultipleConditionWindow, CoreError> {
    Ok(serde_json::from_str(payload)?)
}
