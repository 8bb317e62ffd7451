// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Strom Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Tenant identifier applied to all coordination rows
    pub tenant_id: String,
    /// Poll interval of the queue delivery loops
    pub poll_interval: Duration,
    /// How long a worker claim may go without a heartbeat before the job
    /// counts as orphaned
    pub heartbeat_timeout: Duration,
    /// Maximum delivery attempts for a worker job before it fails terminally
    pub max_job_attempts: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STROM_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `STROM_TENANT`: tenant identifier (default: main)
    /// - `STROM_POLL_INTERVAL_MS`: queue poll interval in milliseconds (default: 100)
    /// - `STROM_HEARTBEAT_TIMEOUT_S`: worker heartbeat timeout in seconds (default: 30)
    /// - `STROM_MAX_JOB_ATTEMPTS`: max worker job deliveries (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STROM_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("STROM_DATABASE_URL"))?;

        let tenant_id = std::env::var("STROM_TENANT").unwrap_or_else(|_| "main".to_string());

        let poll_interval_ms: u64 = std::env::var("STROM_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("STROM_POLL_INTERVAL_MS", "must be a positive integer")
            })?;

        let heartbeat_timeout_s: u64 = std::env::var("STROM_HEARTBEAT_TIMEOUT_S")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("STROM_HEARTBEAT_TIMEOUT_S", "must be a positive integer")
            })?;

        let max_job_attempts: u32 = std::env::var("STROM_MAX_JOB_ATTEMPTS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("STROM_MAX_JOB_ATTEMPTS", "must be a positive integer")
            })?;

        Ok(Self {
            database_url,
            tenant_id,
            poll_interval: Duration::from_millis(poll_interval_ms),
            heartbeat_timeout: Duration::from_secs(heartbeat_timeout_s),
            max_job_attempts,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
