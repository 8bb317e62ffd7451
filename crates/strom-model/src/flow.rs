// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow identity and concurrency settings.

use serde::{Deserialize, Serialize};

/// The scoping key of a flow: tenant, namespace and flow id together.
///
/// Every coordination structure (admission rows, correlation windows, queue
/// partition keys) is scoped by this key, so flows never contend with each
/// other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId {
    /// Tenant the flow belongs to. Single fixed value in the open edition.
    pub tenant_id: String,
    /// Namespace of the flow.
    pub namespace: String,
    /// Flow identifier, unique within the namespace.
    pub flow_id: String,
}

impl FlowId {
    /// Build a flow key.
    pub fn new(
        tenant_id: impl Into<String>,
        namespace: impl Into<String>,
        flow_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            namespace: namespace.into(),
            flow_id: flow_id.into(),
        }
    }

    /// Stable single-string form of the key, `|`-separated.
    pub fn uid(&self) -> String {
        format!("{}|{}|{}", self.tenant_id, self.namespace, self.flow_id)
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uid())
    }
}

/// What to do with a new execution when the flow is at its concurrency limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConcurrencyBehavior {
    /// Defer the start; the execution is re-queued until a slot frees up.
    #[default]
    Queue,
    /// Cancel the new execution outright.
    Cancel,
    /// Fail the new execution.
    Fail,
}

/// Per-flow concurrency settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concurrency {
    /// Maximum number of simultaneously running executions of the flow.
    pub limit: u32,
    /// Policy applied when the limit is reached.
    #[serde(default)]
    pub behavior: ConcurrencyBehavior,
}
