// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed storage.
//!
//! The multi-node backend: claim delivery, admission and stale-job reclaim
//! rely on `FOR UPDATE` row locks so concurrent engine nodes serialize on
//! the contended rows instead of double-delivering.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use strom_model::{Execution, FlowId, MultipleConditionWindow};

use super::{
    ClaimMeta, QueueItem, Storage, StorageTx, WorkerJobRow, execution_from_payload,
    execution_to_row, window_from_payload, window_to_payload,
};
use crate::error::CoreError;

/// PostgreSQL-backed storage implementation.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Create a new Postgres-backed storage implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn publish(
        &self,
        topic: &str,
        partition_key: Option<&str>,
        payload: &str,
    ) -> Result<i64, CoreError> {
        let (offset,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO queues (topic, partition_key, payload)
            VALUES ($1, $2, $3)
            RETURNING "offset"
            "#,
        )
        .bind(topic)
        .bind(partition_key)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(offset)
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
            WHERE topic = $1
              AND "offset" > COALESCE(
                  (SELECT last_offset FROM queue_offsets
                   WHERE topic = $1 AND consumer_group = $2), 0)
            ORDER BY "offset"
            LIMIT $3
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
            VALUES ($1, $2, $3)
            ON CONFLICT (topic, consumer_group)
            DO UPDATE SET last_offset = GREATEST(queue_offsets.last_offset, EXCLUDED.last_offset)
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
            VALUES ($1, $2, 0)
            ON CONFLICT (topic, consumer_group) DO NOTHING
            "#,
        )
        .bind(topic)
        .bind(consumer_group)
        .execute(&mut *tx)
        .await?;

        // Cursor lock serializes competing pollers of the same group.
        let (last_offset,): (i64,) = sqlx::query_as(
            r#"
            SELECT last_offset FROM queue_offsets
            WHERE topic = $1 AND consumer_group = $2
            FOR UPDATE
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
            WHERE topic = $1 AND "offset" > $2
            ORDER BY "offset"
            LIMIT $3
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
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (job_id) DO UPDATE SET
                        worker_id = EXCLUDED.worker_id,
                        worker_group = EXCLUDED.worker_group,
                        attempt = EXCLUDED.attempt,
                        payload = EXCLUDED.payload,
                        heartbeat_at = EXCLUDED.heartbeat_at
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
                UPDATE queue_offsets SET last_offset = $3
                WHERE topic = $1 AND consumer_group = $2
                "#,
            )
            .bind(topic)
            .bind(consumer_group)
            .bind(last.offset)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date,
                payload = EXCLUDED.payload
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
            sqlx::query_as(r#"SELECT payload FROM executions WHERE id = $1"#)
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(payload,)| execution_from_payload(&payload))
            .transpose()
    }

    async fn begin(&self) -> Result<Box<dyn StorageTx>, CoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTx { tx }))
    }

    async fn count_and_admit(
        &self,
        flow: &FlowId,
        execution_id: &str,
        limit: u32,
    ) -> Result<(bool, i64), CoreError> {
        let mut tx = self.pool.begin().await?;

        // FOR UPDATE only locks rows that exist: concurrent admissions into
        // a flow with no running executions would each count zero and all
        // insert. The advisory lock on the flow key serializes the whole
        // count-then-insert, released at commit or rollback.
        sqlx::query(r#"SELECT pg_advisory_xact_lock(hashtext($1))"#)
            .bind(flow.uid())
            .execute(&mut *tx)
            .await?;

        let admitted_ids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT execution_id FROM execution_running
            WHERE tenant_id = $1 AND namespace = $2 AND flow_id = $3
            FOR UPDATE
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
            INSERT INTO execution_running (tenant_id, namespace, flow_id, execution_id)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&flow.tenant_id)
        .bind(&flow.namespace)
        .bind(&flow.flow_id)
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((true, count))
    }

    async fn release_running(&self, flow: &FlowId, execution_id: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            DELETE FROM execution_running
            WHERE tenant_id = $1 AND namespace = $2 AND flow_id = $3 AND execution_id = $4
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
            WHERE tenant_id = $1 AND namespace = $2 AND flow_id = $3
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
        sqlx::query(r#"DELETE FROM worker_job_running WHERE job_id = $1"#)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn heartbeat_worker(&self, worker_id: &str, at: DateTime<Utc>) -> Result<(), CoreError> {
        sqlx::query(r#"UPDATE worker_job_running SET heartbeat_at = $2 WHERE worker_id = $1"#)
            .bind(worker_id)
            .bind(at)
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
            WHERE heartbeat_at <= $1
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

        // The staleness guard makes the delete race-safe: of several
        // monitors, only the one whose delete hits the row republishes.
        let deleted = sqlx::query(
            r#"DELETE FROM worker_job_running WHERE job_id = $1 AND heartbeat_at <= $2"#,
        )
        .bind(job_id)
        .bind(older_than)
        .execute(&mut *tx)
        .await?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(r#"INSERT INTO queues (topic, partition_key, payload) VALUES ($1, $2, $3)"#)
            .bind(topic)
            .bind(partition_key)
            .bind(payload)
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
            WHERE tenant_id = $1 AND namespace = $2 AND flow_id = $3 AND condition_id = $4
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
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, namespace, flow_id, condition_id) DO UPDATE SET
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date,
                payload = EXCLUDED.payload
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
            WHERE tenant_id = $1 AND namespace = $2 AND flow_id = $3 AND condition_id = $4
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
            WHERE tenant_id = $1 AND end_date < $2
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

/// An open PostgreSQL transaction holding an execution row lock.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StorageTx for PostgresTx {
    async fn lock_execution(
        &mut self,
        execution_id: &str,
    ) -> Result<Option<Execution>, CoreError> {
        let row: Option<(String,)> =
            sqlx::query_as(r#"SELECT payload FROM executions WHERE id = $1 FOR UPDATE"#)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date,
                payload = EXCLUDED.payload
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
