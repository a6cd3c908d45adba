//! Core model and maintenance algorithms for the database log sink.
//!
//! Storage backends implement [`RecordStore`]; everything else in this crate
//! (the writer, deduplication, retention, alerting and search helpers) is
//! written against that trait so it can run over any relational backend.

use std::time::{Duration as StdDuration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

pub mod alert;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod retention;
pub mod search;
pub mod store;
pub mod writer;

pub use alert::{AlertEvent, AlertListener, AlertNotifier, ListenerRegistry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{parse_max_length, validate_table_name, SinkConfig, DEFAULT_TABLE};
pub use dedup::{remove_duplicates, DedupReport};
pub use retention::{garbage_collect, RetentionPolicy, RetentionReport, DEFAULT_ROW_LIMIT};
pub use search::{format_record, text_search, TYPE_QUERY_PREFIX};
pub use store::{FoldOutcome, RecordFilter, RecordMutation, RecordStore};
pub use writer::{LogWriter, NewLogRecord, Origin, RequestContext};

const STORAGE_TIMESTAMP: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
const DISPLAY_TIMESTAMP: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DbLogError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("notification error: {0}")]
    Notification(String),
    #[error("{operation} exceeded its deadline after {completed} completed step(s)")]
    DeadlineExceeded {
        operation: &'static str,
        completed: u64,
    },
}

impl DbLogError {
    /// Wraps a backend failure, keeping the full error chain in the message.
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(format!("{err:#}"))
    }
}

/// One stored log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogRecord {
    pub id: i64,
    #[serde(rename = "type")]
    pub log_type: String,
    pub message: String,
    pub context: String,
    pub count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    pub ip: String,
    pub hostname: String,
    pub uri: String,
    pub refer: String,
    pub user_agent: String,
}

/// Rows sharing one exact `(type, message)` pair.
///
/// `member_ids` is ordered newest first: `created` descending, ties broken by
/// `id` descending.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateGroup {
    #[serde(rename = "type")]
    pub log_type: String,
    pub message: String,
    pub count: u64,
    pub member_ids: Vec<i64>,
}

/// Upper bound on how long a maintenance run may keep working.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceBudget {
    deadline: Option<Instant>,
}

impl MaintenanceBudget {
    #[must_use]
    pub fn unbounded() -> Self {
        Self { deadline: None }
    }

    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    #[must_use]
    pub fn with_timeout(timeout: StdDuration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
        }
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fails once the deadline has passed.
    ///
    /// # Errors
    /// Returns [`DbLogError::DeadlineExceeded`] carrying `completed` when the
    /// current instant is at or beyond the deadline.
    pub fn check(&self, operation: &'static str, completed: u64) -> Result<(), DbLogError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(DbLogError::DeadlineExceeded {
                operation,
                completed,
            }),
            _ => Ok(()),
        }
    }
}

/// Renders a caller-supplied value into stored text.
///
/// Strings are stored as-is; anything else becomes pretty-printed JSON with
/// keys in insertion order. The result is always trimmed.
#[must_use]
pub fn render_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_string(),
        other => serde_json::to_string_pretty(other)
            .unwrap_or_else(|_| other.to_string())
            .trim()
            .to_string(),
    }
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Normalizes to UTC and drops sub-second precision, the resolution the
/// store keeps for `created`.
#[must_use]
pub fn truncate_to_second(value: OffsetDateTime) -> OffsetDateTime {
    let utc = value.to_offset(UtcOffset::UTC);
    utc.replace_nanosecond(0).unwrap_or(utc)
}

/// Rounds up to the next whole second unless already on one, so that
/// `created < ceil_to_second(cutoff)` matches `created < cutoff` for stored
/// second-precision timestamps.
#[must_use]
pub fn ceil_to_second(value: OffsetDateTime) -> OffsetDateTime {
    let floor = truncate_to_second(value);
    if value.nanosecond() > 0 {
        floor + time::Duration::SECOND
    } else {
        floor
    }
}

/// Formats a timestamp in the fixed-width storage form `YYYY-MM-DDTHH:MM:SSZ`.
///
/// # Errors
/// Returns [`DbLogError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, DbLogError> {
    truncate_to_second(value)
        .format(STORAGE_TIMESTAMP)
        .map_err(|err| DbLogError::Validation(format!("failed to format timestamp: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`DbLogError::Validation`] when parsing fails or the offset is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, DbLogError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DbLogError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(DbLogError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

#[must_use]
pub fn display_timestamp(value: OffsetDateTime) -> String {
    let utc = truncate_to_second(value);
    utc.format(DISPLAY_TIMESTAMP)
        .unwrap_or_else(|_| utc.unix_timestamp().to_string())
}
