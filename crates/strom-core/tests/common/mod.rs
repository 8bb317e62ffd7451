// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for strom-core E2E tests.
//!
//! Provides a TestContext over a real PostgreSQL database, gated on
//! TEST_DATABASE_URL so the suite stays green without one.

#![allow(dead_code)]

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use strom_core::storage::{PostgresStorage, Storage};

/// Test context over a PostgreSQL database.
pub struct TestContext {
    pub pool: PgPool,
    pub storage: Arc<dyn Storage>,
    /// Unique suffix so concurrent test runs do not see each other's rows.
    pub run_id: String,
}

impl TestContext {
    /// Connect to TEST_DATABASE_URL and migrate. Returns None when the
    /// variable is unset or the database is unreachable.
    pub async fn new() -> Option<Self> {
        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&database_url).await.ok()?;
        strom_core::migrations::run_postgres(&pool).await.ok()?;

        let storage: Arc<dyn Storage> = Arc::new(PostgresStorage::new(pool.clone()));
        Some(Self {
            pool,
            storage,
            run_id: Uuid::new_v4().simple().to_string(),
        })
    }

    /// A namespace unique to this test run.
    pub fn namespace(&self, base: &str) -> String {
        format!("{base}.{}", self.run_id)
    }

    /// A topic name unique to this test run.
    pub fn topic(&self, base: &str) -> String {
        format!("{base}_{}", self.run_id)
    }
}

/// Helper macro to skip tests if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
