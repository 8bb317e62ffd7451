// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry policies for failed task runs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a retry is materialized once the policy grants another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryBehavior {
    /// Retry the failed task run in place, within the same execution.
    #[default]
    RetryFailedTask,
    /// Spawn a fresh execution in the same restart lineage.
    CreateNewExecution,
}

/// Delay schedule for successive attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RetryPolicy {
    /// A fixed delay between attempts.
    Constant {
        /// Delay before each retry.
        #[serde(with = "duration_ms")]
        interval: Duration,
        /// Hard cap on attempts, when set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_attempts: Option<u32>,
        /// Hard cap on cumulative configured delay, when set.
        #[serde(
            default,
            with = "duration_ms_opt",
            skip_serializing_if = "Option::is_none"
        )]
        max_duration: Option<Duration>,
    },
    /// A geometrically growing delay, capped per attempt.
    Exponential {
        /// Delay before the first retry.
        #[serde(with = "duration_ms")]
        interval: Duration,
        /// Per-attempt ceiling on the computed delay.
        #[serde(with = "duration_ms")]
        max_interval: Duration,
        /// Growth factor between consecutive attempts.
        #[serde(default = "default_delay_factor")]
        delay_factor: f64,
        /// Hard cap on attempts, when set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_attempts: Option<u32>,
        /// Hard cap on cumulative configured delay, when set.
        #[serde(
            default,
            with = "duration_ms_opt",
            skip_serializing_if = "Option::is_none"
        )]
        max_duration: Option<Duration>,
    },
}

fn default_delay_factor() -> f64 {
    2.0
}

impl RetryPolicy {
    /// The configured delay before attempt number `attempt` (1-based: the
    /// first retry is attempt 1).
    fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant { interval, .. } => *interval,
            Self::Exponential {
                interval,
                max_interval,
                delay_factor,
                ..
            } => {
                let scaled =
                    interval.as_secs_f64() * delay_factor.powi(attempt.saturating_sub(1) as i32);
                Duration::from_secs_f64(scaled.min(max_interval.as_secs_f64()))
            }
        }
    }

    fn max_attempts(&self) -> Option<u32> {
        match self {
            Self::Constant { max_attempts, .. } | Self::Exponential { max_attempts, .. } => {
                *max_attempts
            }
        }
    }

    fn max_duration(&self) -> Option<Duration> {
        match self {
            Self::Constant { max_duration, .. } | Self::Exponential { max_duration, .. } => {
                *max_duration
            }
        }
    }

    /// When the next attempt should run, given how many attempts already
    /// happened and when the last one finished. `None` once the policy is
    /// exhausted, either by attempt count or by cumulative configured delay.
    pub fn next_retry_at(
        &self,
        attempt_count: u32,
        last_attempt: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let next_attempt = attempt_count + 1;

        if let Some(max) = self.max_attempts() {
            if next_attempt > max {
                return None;
            }
        }

        if let Some(max) = self.max_duration() {
            let cumulative: Duration = (1..=next_attempt).map(|a| self.delay_for(a)).sum();
            if cumulative > max {
                return None;
            }
        }

        let delay = self.delay_for(next_attempt);
        Some(last_attempt + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX))
    }
}

/// A complete retry configuration on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retry {
    /// Delay schedule.
    #[serde(flatten)]
    pub policy: RetryPolicy,
    /// How a granted retry is materialized.
    #[serde(default)]
    pub behavior: RetryBehavior,
}

pub(crate) mod duration_ms {
    //! std Durations serialized as integer milliseconds.
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

pub(crate) mod duration_ms_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
