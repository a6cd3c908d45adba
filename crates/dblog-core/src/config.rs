use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::Duration;

use crate::retention::RetentionPolicy;
use crate::DbLogError;

pub const DEFAULT_TABLE: &str = "database_logs";

/// Sink options, keyed the way host applications already configure them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SinkConfig {
    /// Replaces the level of every log line.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub log_type: Option<String>,
    /// Legacy spelling of `type`; ignored when `type` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Backing table name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Age expression such as `30 days`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<String>,
    /// Row cap enforced by garbage collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Name of the alert listener to register at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_callback: Option<String>,
}

impl SinkConfig {
    /// Decodes and validates a config document.
    ///
    /// # Errors
    /// Returns [`DbLogError::Configuration`] when decoding fails or a value
    /// is out of bounds.
    pub fn from_json(value: &Value) -> Result<Self, DbLogError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            DbLogError::Configuration(format!("invalid sink config payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`DbLogError::Configuration`] when the text is not valid JSON
    /// or fails [`SinkConfig::from_json`].
    pub fn from_json_str(raw: &str) -> Result<Self, DbLogError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| DbLogError::Configuration(format!("invalid sink config JSON: {err}")))?;
        Self::from_json(&value)
    }

    /// `max_length` is not checked here: retention degrades to "no age
    /// pruning" when it does not parse.
    ///
    /// # Errors
    /// Returns [`DbLogError::Configuration`] for a zero `limit` or a
    /// malformed `model` table name.
    pub fn validate(&self) -> Result<(), DbLogError> {
        if self.limit == Some(0) {
            return Err(DbLogError::Configuration(
                "limit MUST be >= 1".to_string(),
            ));
        }

        if let Some(model) = &self.model {
            validate_table_name(model)?;
        }

        Ok(())
    }

    #[must_use]
    pub fn level_override(&self) -> Option<&str> {
        self.log_type
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.file.as_deref().filter(|value| !value.trim().is_empty()))
    }

    #[must_use]
    pub fn table_name(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_TABLE)
    }

    #[must_use]
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_length: self.max_length.clone(),
            limit: self.limit,
        }
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
///
/// # Errors
/// Returns [`DbLogError::Configuration`] unless `name` matches
/// `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_table_name(name: &str) -> Result<(), DbLogError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|head| head.is_ascii_alphabetic() || head == '_');
    let valid_tail = chars.all(|item| item.is_ascii_alphanumeric() || item == '_');

    if valid_head && valid_tail {
        Ok(())
    } else {
        Err(DbLogError::Configuration(format!(
            "invalid table name: {name:?}"
        )))
    }
}

/// Parses an age expression into a positive duration.
///
/// Accepts one or more `<integer> <unit>` pairs (`30 days`, `1 day 12 hours`,
/// `2weeks`), an optional sign on each amount and an optional trailing `ago`.
/// The sign is ignored: the result is always an age into the past. Months
/// count as 30 days and years as 365.
///
/// # Errors
/// Returns [`DbLogError::Configuration`] for unknown units, missing amounts,
/// overflow, or a zero total.
pub fn parse_max_length(expr: &str) -> Result<Duration, DbLogError> {
    let invalid = || DbLogError::Configuration(format!("invalid maxLength expression: {expr:?}"));

    let normalized = expr.trim().to_ascii_lowercase();
    let body = normalized
        .strip_suffix("ago")
        .map_or(normalized.as_str(), str::trim_end);

    let mut tokens = body.split_whitespace();
    let mut total = Duration::ZERO;
    let mut pairs = 0_usize;

    while let Some(token) = tokens.next() {
        let unsigned = token.trim_start_matches(['+', '-']);
        let split_at = unsigned
            .find(|item: char| !item.is_ascii_digit())
            .unwrap_or(unsigned.len());
        let (digits, attached_unit) = unsigned.split_at(split_at);
        if digits.is_empty() {
            return Err(invalid());
        }

        let amount: i64 = digits.parse().map_err(|_| invalid())?;
        let unit = if attached_unit.is_empty() {
            tokens.next().ok_or_else(invalid)?
        } else {
            attached_unit
        };
        let unit_seconds = unit_seconds(unit).ok_or_else(invalid)?;
        let seconds = amount.checked_mul(unit_seconds).ok_or_else(invalid)?;
        total = total
            .checked_add(Duration::seconds(seconds))
            .ok_or_else(invalid)?;
        pairs += 1;
    }

    if pairs == 0 || total.is_zero() {
        return Err(invalid());
    }

    Ok(total)
}

fn unit_seconds(unit: &str) -> Option<i64> {
    const MINUTE: i64 = 60;
    const HOUR: i64 = 60 * MINUTE;
    const DAY: i64 = 24 * HOUR;

    let seconds = match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "min" | "mins" | "minute" | "minutes" => MINUTE,
        "h" | "hour" | "hours" => HOUR,
        "d" | "day" | "days" => DAY,
        "week" | "weeks" => 7 * DAY,
        "fortnight" | "fortnights" => 14 * DAY,
        "month" | "months" => 30 * DAY,
        "year" | "years" => 365 * DAY,
        _ => return None,
    };
    Some(seconds)
}
