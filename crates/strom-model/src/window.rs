// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Time windows and the per-window correlation record.
//!
//! A window's boundaries are a pure function of the wall clock and the
//! window definition, so every node computes identical boundaries for the
//! same instant and the window key stays stable for its whole duration.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::flow::FlowId;

/// A recurring window definition attached to a multi-source condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeWindow {
    /// Calendar-aligned window of a fixed duration, optionally shifted.
    DurationWindow {
        /// Window length.
        #[serde(with = "chrono_duration_ms")]
        window: Duration,
        /// Shift applied to the aligned start, may be negative.
        #[serde(
            default,
            with = "chrono_duration_ms_opt",
            skip_serializing_if = "Option::is_none"
        )]
        window_advance: Option<Duration>,
    },
    /// Window starting at the instant the first result arrives.
    SlidingWindow {
        /// Window length.
        #[serde(with = "chrono_duration_ms")]
        window: Duration,
    },
    /// A fixed daily interval.
    DailyTimeWindow {
        /// Start of the interval, each day.
        start_time: NaiveTime,
        /// End of the interval, each day.
        end_time: NaiveTime,
    },
    /// From midnight until a daily deadline.
    DailyTimeDeadline {
        /// The daily deadline.
        deadline: NaiveTime,
    },
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self::DurationWindow {
            window: Duration::days(1),
            window_advance: None,
        }
    }
}

impl TimeWindow {
    /// The `[start, end]` boundaries of the window containing `now`.
    ///
    /// Duration windows are aligned to the calendar so that the same instant
    /// always lands in the same window regardless of which node computes it:
    /// `now` is truncated to the window's granularity before the length is
    /// applied, and the end is inclusive (one millisecond before the next
    /// window starts).
    pub fn boundaries(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        match self {
            Self::DurationWindow {
                window,
                window_advance,
            } => {
                let mut start = truncate_to_seconds(now);
                if window.num_days() > 0 {
                    start = with_hour(start, 0);
                }
                if window.num_hours() > 0 {
                    start = with_minute(start, 0);
                }
                if window.num_minutes() > 0 {
                    let window_minutes = window.num_minutes();
                    start = with_minute(with_second(start, 0), 0)
                        + Duration::minutes(window_minutes * (now.minute() as i64 / window_minutes));
                }
                if let Some(advance) = window_advance {
                    start += *advance;
                }
                (start, start + *window - Duration::milliseconds(1))
            }
            Self::SlidingWindow { window } => {
                let start = truncate_to_millis(now);
                (start, start + *window)
            }
            Self::DailyTimeWindow {
                start_time,
                end_time,
            } => {
                let day = now.date_naive();
                (
                    day.and_time(*start_time).and_utc(),
                    day.and_time(*end_time).and_utc(),
                )
            }
            Self::DailyTimeDeadline { deadline } => {
                let day = now.date_naive();
                (
                    day.and_time(NaiveTime::MIN).and_utc(),
                    day.and_time(*deadline).and_utc(),
                )
            }
        }
    }
}

fn truncate_to_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    t - Duration::nanoseconds(t.timestamp_subsec_nanos() as i64)
}

fn truncate_to_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    let sub_millis = t.timestamp_subsec_nanos() as i64 % 1_000_000;
    t - Duration::nanoseconds(sub_millis)
}

fn with_hour(t: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    t.with_hour(hour).unwrap_or(t)
}

fn with_minute(t: DateTime<Utc>, minute: u32) -> DateTime<Utc> {
    t.with_minute(minute).unwrap_or(t)
}

fn with_second(t: DateTime<Utc>, second: u32) -> DateTime<Utc> {
    t.with_second(second).unwrap_or(t)
}

/// The durable record of one correlation window instance: which
/// sub-conditions fired within `[start, end]`, and the outputs they carried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultipleConditionWindow {
    /// Tenant scope.
    pub tenant_id: String,
    /// Namespace of the owning flow.
    pub namespace: String,
    /// Owning flow id.
    pub flow_id: String,
    /// The condition this window instance belongs to.
    pub condition_id: String,
    /// Inclusive window start.
    pub start: DateTime<Utc>,
    /// Inclusive window end.
    pub end: DateTime<Utc>,
    /// Satisfaction flag per sub-condition id.
    #[serde(default)]
    pub results: BTreeMap<String, bool>,
    /// Outputs merged from the results seen so far.
    #[serde(default)]
    pub outputs: serde_json::Map<String, serde_json::Value>,
}

impl MultipleConditionWindow {
    /// A fresh window instance for `flow`/`condition_id`, with boundaries
    /// computed from `window` at `now`.
    pub fn new(
        flow: &FlowId,
        condition_id: impl Into<String>,
        window: &TimeWindow,
        outputs: serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let (start, end) = window.boundaries(now);
        Self {
            tenant_id: flow.tenant_id.clone(),
            namespace: flow.namespace.clone(),
            flow_id: flow.flow_id.clone(),
            condition_id: condition_id.into(),
            start,
            end,
            results: BTreeMap::new(),
            outputs,
        }
    }

    /// Whether `now` falls inside the window boundaries.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now <= self.end
    }

    /// Whether the window has passed without completing.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.end
    }

    /// This window with one sub-condition result folded in, outputs merged.
    pub fn with_result(
        &self,
        sub_condition_id: impl Into<String>,
        satisfied: bool,
        outputs: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let mut next = self.clone();
        next.results.insert(sub_condition_id.into(), satisfied);
        next.outputs.extend(outputs);
        next
    }

    /// Whether every expected sub-condition has reported satisfied.
    pub fn is_complete(&self, expected: &[String]) -> bool {
        !expected.is_empty()
            && expected
                .iter()
                .all(|id| self.results.get(id).copied().unwrap_or(false))
    }
}

pub(crate) mod chrono_duration_ms {
    //! chrono Durations serialized as signed integer milliseconds.
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::milliseconds(i64::deserialize(deserializer)?))
    }
}

pub(crate) mod chrono_duration_ms_opt {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.num_milliseconds()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<i64>::deserialize(deserializer)?.map(Duration::milliseconds))
    }
}
