// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed storage.
//!
//! The single-process backend: SQLite has no row locks, so atomicity comes
//! from transactions and the database-level write lock. Deploy with a small
//! pool; a single engine process is the supported topology.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use strom_model::{Execution, FlowId, MultipleConditionWindow};

use super::{
    ClaimMeta, QueueItem, Storage, StorageTx, WorkerJobRow, execution_from_payload,
    execution_to_row, window_from_payload, window_to_payload,
};
use crate::error::CoreError;

/// SQLite-backed storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite-backed storage implementation.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn publish(
        &self,
        topic: &str,
        partition_key: Option<&str>,
        payload: &str,
    ) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO queues (topic, partition_key, payload, published_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(topic)
        .bind(partition_key)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn poll(
        &self,
        topic: &str,
        consumer_group: &str,
        limit: i64,
    ) -> Result<Vec<QueueItem>, CoreError> {
        let items = sqlx::query_as::<_, QueueItem>(
            r#"
            SELECT "offset", topic, partition_key, payload
            FROM queues
            WHERE topic = ?1
              AND "offset" > COALESCE(
                  (SELECT last_offset FROM queue_offsets
                   WHERE topic = ?1 AND consumer_group = ?2), 0)
            ORDER BY "offset"
            LIMIT ?3
            "#,
        )
        .bind(topic)
        .bind(consumer_group)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    async fn ack(&self, topic: &str, consumer_group: &str, offset: i64) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO queue_offsets (topic, consumer_group, last_offset)
            VALUES (?, ?, ?)
            ON CONFLICT (topic, consumer_group)
            DO UPDATE SET last_offset = MAX(queue_offsets.last_offset, excluded.last_offset)
            "#,
        )
        .bind(topic)
        .bind(consumer_group)
        .bind(offset)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn poll_and_claim(
        &self,
        topic: &str,
        consumer_group: &str,
        worker_id: &str,
        worker_group: &str,
        now: DateTime<Utc>,
        limit: i64,
        claim_meta: ClaimMeta<'_>,
    ) -> Result<Vec<QueueItem>, CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO queue_offsets (topic, consumer_group, last_offset)
            VALUES (?, ?, 0)
            ON CONFLICT (topic, consumer_group) DO NOTHING
            "#,
        )
        .bind(topic)
        .bind(consumer_group)
        .execute(&mut *tx)
        .await?;

        let (last_offset,): (i64,) = sqlx::query_as(
            r#"
            SELECT last_offset FROM queue_offsets
            WHERE topic = ? AND consumer_group = ?
            "#,
        )
        .bind(topic)
        .bind(consumer_group)
        .fetch_one(&mut *tx)
        .await?;

        let items = sqlx::query_as::<_, QueueItem>(
            r#"
            SELECT "offset", topic, partition_key, payload
            FROM queues
            WHERE topic = ? AND "offset" > ?
            ORDER BY "offset"
            LIMIT ?
            "#,
        )
        .bind(topic)
        .bind(last_offset)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        for item in &items {
            if let Some((job_id, attempt)) = claim_meta(&item.payload) {
                sqlx::query(
                    r#"
                    INSERT INTO worker_job_running
                        (job_id, worker_id, worker_group, attempt, payload, heartbeat_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT (job_id) DO UPDATE SET
                        worker_id = excluded.worker_id,
                        worker_group = excluded.worker_group,
                        attempt = excluded.attempt,
                        payload = excluded.payload,
                        heartbeat_at = excluded.heartbeat_at
                    "#,
                )
                .bind(&job_id)
                .bind(worker_id)
                .bind(worker_group)
                .bind(attempt)
                .bind(&item.payload)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        if let Some(last) = items.last() {
            sqlx::query(
                r#"
                UPDATE queue_offsets SET last_offset = ?
                WHERE topic = ? AND consumer_group = ?
                "#,
            )
            .bind(last.offset)
            .bind(topic)
            .bind(consumer_group)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(items)
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), CoreError> {
        let (state, start_date, end_date, payload) = execution_to_row(execution)?;
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, tenant_id, namespace, flow_id, state, start_date, end_date, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                state = excluded.state,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                payload = excluded.payload
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.tenant_id)
        .bind(&execution.namespace)
        .bind(&execution.flow_id)
        .bind(&state)
        .bind(start_date)
        .bind(end_date)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>, CoreError> {
        let row: Option<(String,)> =
            sqlx::query_as(r#"SELECT payload FROM executions WHERE id = ?"#)
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(payload,)| execution_from_payload(&payload))
            .transpose()
    }

    async fn begin(&self) -> Result<Box<dyn StorageTx>, CoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTx { tx }))
    }

    async fn count_and_admit(
        &self,
        flow: &FlowId,
        execution_id: &str,
        limit: u32,
    ) -> Result<(bool, i64), CoreError> {
        let mut tx = self.pool.begin().await?;

        let admitted_ids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT execution_id FROM execution_running
            WHERE tenant_id = ? AND namespace = ? AND flow_id = ?
            "#,
        )
        .bind(&flow.tenant_id)
        .bind(&flow.namespace)
        .bind(&flow.flow_id)
        .fetch_all(&mut *tx)
        .await?;

        let count = admitted_ids.len() as i64;

        if admitted_ids.iter().any(|(id,)| id == execution_id) {
            tx.commit().await?;
            return Ok((true, count));
        }

        if count >= i64::from(limit) {
            tx.commit().await?;
            return Ok((false, count));
        }

        sqlx::query(
            r#"
            INSERT INTO execution_running (tenant_id, namespace, flow_id, execution_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&flow.tenant_id)
        .bind(&flow.namespace)
        .bind(&flow.flow_id)
        .bind(execution_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((true, count))
    }

    async fn release_running(&self, flow: &FlowId, execution_id: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            DELETE FROM execution_running
            WHERE tenant_id = ? AND namespace = ? AND flow_id = ? AND execution_id = ?
            "#,
        )
        .bind(&flow.tenant_id)
        .bind(&flow.namespace)
        .bind(&flow.flow_id)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn running_count(&self, flow: &FlowId) -> Result<i64, CoreError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM execution_running
            WHERE tenant_id = ? AND namespace = ? AND flow_id = ?
            "#,
        )
        .bind(&flow.tenant_id)
        .bind(&flow.namespace)
        .bind(&flow.flow_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn delete_worker_job(&self, job_id: &str) -> Result<(), CoreError> {
        sqlx::query(r#"DELETE FROM worker_job_running WHERE job_id = ?"#)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn heartbeat_worker(&self, worker_id: &str, at: DateTime<Utc>) -> Result<(), CoreError> {
        sqlx::query(r#"UPDATE worker_job_running SET heartbeat_at = ? WHERE worker_id = ?"#)
            .bind(at)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn stale_worker_jobs(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<WorkerJobRow>, CoreError> {
        let rows = sqlx::query_as::<_, WorkerJobRow>(
            r#"
            SELECT job_id, worker_id, worker_group, attempt, payload, heartbeat_at
            FROM worker_job_running
            WHERE heartbeat_at <= ?
            ORDER BY heartbeat_at
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn requeue_stale_job(
        &self,
        job_id: &str,
        older_than: DateTime<Utc>,
        topic: &str,
        partition_key: Option<&str>,
        payload: &str,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            r#"DELETE FROM worker_job_running WHERE job_id = ? AND heartbeat_at <= ?"#,
        )
        .bind(job_id)
        .bind(older_than)
        .execute(&mut *tx)
        .await?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"INSERT INTO queues (topic, partition_key, payload, published_at) VALUES (?, ?, ?, ?)"#,
        )
        .bind(topic)
        .bind(partition_key)
        .bind(payload)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_window(
        &self,
        flow: &FlowId,
        condition_id: &str,
    ) -> Result<Option<MultipleConditionWindow>, CoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT payload FROM multiple_condition_window
            WHERE tenant_id = ? AND namespace = ? AND flow_id = ? AND condition_id = ?
            "#,
        )
        .bind(&flow.tenant_id)
        .bind(&flow.namespace)
        .bind(&flow.flow_id)
        .bind(condition_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(payload,)| window_from_payload(&payload))
            .transpose()
    }

    async fn save_window(&self, window: &MultipleConditionWindow) -> Result<(), CoreError> {
        let payload = window_to_payload(window)?;
        sqlx::query(
            r#"
            INSERT INTO multiple_condition_window
                (tenant_id, namespace, flow_id, condition_id, start_date, end_date, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (tenant_id, namespace, flow_id, condition_id) DO UPDATE SET
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                payload = excluded.payload
            "#,
        )
        .bind(&window.tenant_id)
        .bind(&window.namespace)
        .bind(&window.flow_id)
        .bind(&window.condition_id)
        .bind(window.start)
        .bind(window.end)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_window(&self, flow: &FlowId, condition_id: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            DELETE FROM multiple_condition_window
            WHERE tenant_id = ? AND namespace = ? AND flow_id = ? AND condition_id = ?
            "#,
        )
        .bind(&flow.tenant_id)
        .bind(&flow.namespace)
        .bind(&flow.flow_id)
        .bind(condition_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn expired_windows(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<MultipleConditionWindow>, CoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT payload FROM multiple_condition_window
            WHERE tenant_id = ? AND end_date < ?
            "#,
        )
        .bind(tenant_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(payload,)| window_from_payload(&payload))
            .collect()
    }
}

/// An open SQLite transaction scoping one execution read-modify-write.
pub struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StorageTx for SqliteTx {
    async fn lock_execution(
        &mut self,
        execution_id: &str,
    ) -> Result<Option<Execution>, CoreError> {
        let row: Option<(String,)> =
            sqlx::query_as(r#"SELECT payload FROM executions WHERE id = ?"#)
                .bind(execution_id)
                .fetch_optional(&mut *self.tx)
                .await?;

        row.map(|(payload,)| execution_from_payload(&payload))
            .transpose()
    }

    async fn save_execution(&mut self, execution: &Execution) -> Result<(), CoreError> {
        let (state, start_date, end_date, payload) = execution_to_row(execution)?;
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, tenant_id, namespace, flow_id, state, start_date, end_date, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                state = excluded.state,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                payload = excluded.payload
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.tenant_id)
        .bind(&execution.namespace)
        .bind(&execution.flow_id)
        .bind(&state)
        .bind(start_date)
        .bind(end_date)
        .bind(&payload)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), CoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), CoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
