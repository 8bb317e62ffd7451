// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strom Core - Durable Coordination Engine
//!
//! This crate provides the coordination backbone for flow executions: a
//! database-backed message log, crash-safe worker-job tracking, per-flow
//! concurrency admission, execution state reconciliation and multi-source
//! window correlation. Everything durable lives in PostgreSQL or SQLite;
//! no broker, no in-memory state that a crash can lose.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Embedding Product                        │
//! │               (schedulers, workers, APIs, UIs)                   │
//! └──────────────────────────────────────────────────────────────────┘
//!        │ submit / kill / resume          │ claim / heartbeat / result
//!        ▼                                 ▼
//! ┌───────────────────┐          ┌──────────────────────┐
//! │     Executor      │          │    WorkerJobQueue    │
//! │  (reconciliation, │          │  + LivenessMonitor   │
//! │   admission gate) │          │  (claims, recovery)  │
//! └───────────────────┘          └──────────────────────┘
//!        │                                 │
//!        │        ┌───────────────┐        │
//!        └───────▶│  Correlator   │◀───────┘
//!                 │ (windows)     │
//!                 └───────────────┘
//!                         │
//!                         ▼
//!              ┌─────────────────────┐
//!              │ PostgreSQL / SQLite │
//!              │  (queues, claims,   │
//!              │   state, windows)   │
//!              └─────────────────────┘
//! ```
//!
//! # Topics
//!
//! | Topic | Producer | Consumer | Mode |
//! |-------|----------|----------|------|
//! | `executions` | submitters, workers, monitor, correlator | [`executor::Executor`] | peek then ack |
//! | `worker_jobs` | executor, monitor | workers via [`tracker::WorkerJobQueue`] | claim on delivery |
//! | `trigger_results` | trigger evaluators | [`correlator::Correlator`] | peek then ack |
//!
//! # Delivery Semantics
//!
//! Delivery is at-least-once everywhere. Peek-then-ack consumers advance
//! their cursor only after handling succeeds; claim-mode consumers advance
//! it in the same transaction that records their claim, and the liveness
//! monitor republishes claims whose heartbeat lapsed. Consumers are
//! expected to be idempotent; the executor's joinability rules make
//! redelivered task-run results harmless.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STROM_DATABASE_URL` | Yes | - | PostgreSQL or SQLite connection string |
//! | `STROM_TENANT` | No | `main` | Tenant identifier |
//! | `STROM_POLL_INTERVAL_MS` | No | `100` | Queue poll interval |
//! | `STROM_HEARTBEAT_TIMEOUT_S` | No | `30` | Worker heartbeat timeout |
//! | `STROM_MAX_JOB_ATTEMPTS` | No | `5` | Max worker job deliveries |

#![deny(missing_docs)]

/// Per-flow concurrency admission.
pub mod admission;

/// Injectable wall clock.
pub mod clock;

/// Server configuration loaded from environment variables.
pub mod config;

/// Multi-source correlation windows.
pub mod correlator;

/// Error types for core operations with stable error codes.
pub mod error;

/// Execution state reconciliation.
pub mod executor;

/// Embedded database migrations.
pub mod migrations;

/// Wire messages and topic names.
pub mod message;

/// Typed queue facade over the durable message log.
pub mod queue;

/// Storage interfaces and the PostgreSQL/SQLite backends.
pub mod storage;

/// Crash-safe worker-job claims and the liveness monitor.
pub mod tracker;
