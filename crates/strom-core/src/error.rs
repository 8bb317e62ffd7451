// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for strom-core.
//!
//! Provides a unified error type with stable error codes and a retryability
//! classification used by the delivery loops.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur during coordination.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Execution was not found in the database.
    ExecutionNotFound {
        /// The execution ID that was not found.
        execution_id: String,
    },

    /// A queue payload could not be decoded.
    Malformed {
        /// Topic the payload was read from.
        topic: String,
        /// Offset of the offending row.
        offset: i64,
        /// Decode error details.
        details: String,
    },

    /// A row lock could not be acquired in time. Retryable.
    LockTimeout {
        /// The operation that contended.
        operation: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ExecutionNotFound { .. } => "EXECUTION_NOT_FOUND",
            Self::Malformed { .. } => "MALFORMED_MESSAGE",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecutionNotFound { execution_id } => {
                write!(f, "Execution '{}' not found", execution_id)
            }
            Self::Malformed {
                topic,
                offset,
                details,
            } => {
                write!(
                    f,
                    "Malformed payload at offset {} on topic '{}': {}",
                    offset, topic, details
                )
            }
            Self::LockTimeout { operation } => {
                write!(f, "Lock timeout during '{}'", operation)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // Postgres lock_not_available / deadlock_detected, SQLite busy/locked.
            if let Some(code) = db.code() {
                if matches!(code.as_ref(), "55P03" | "40P01" | "5" | "6") {
                    return CoreError::LockTimeout {
                        operation: "query".to_string(),
                    };
                }
            }
        }
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
