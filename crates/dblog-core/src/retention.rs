//! Age- and count-based pruning of the log table.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::parse_max_length;
use crate::store::{RecordFilter, RecordStore};
use crate::{DbLogError, MaintenanceBudget};

/// Row cap used when none is configured.
pub const DEFAULT_ROW_LIMIT: u64 = 999_999;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_length: Option<String>,
    pub limit: Option<u64>,
}

impl RetentionPolicy {
    /// The configured cap, or [`DEFAULT_ROW_LIMIT`] when unset or zero.
    #[must_use]
    pub fn effective_limit(&self) -> u64 {
        self.limit
            .filter(|limit| *limit > 0)
            .unwrap_or(DEFAULT_ROW_LIMIT)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionReport {
    pub by_age: u64,
    pub by_count: u64,
}

impl RetentionReport {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.by_age + self.by_count
    }
}

/// Deletes rows older than `max_length`, then trims the table down to the
/// newest `limit` rows by insertion order.
///
/// Each step commits on its own; if the count step fails the age step stays
/// applied. An unparseable `max_length` disables the age step with a warning.
///
/// # Errors
/// Returns [`DbLogError::Persistence`] when a delete or count fails and
/// [`DbLogError::DeadlineExceeded`] when the budget runs out between steps.
pub fn garbage_collect<S: RecordStore + ?Sized>(
    store: &mut S,
    policy: &RetentionPolicy,
    now: OffsetDateTime,
    budget: &MaintenanceBudget,
) -> Result<RetentionReport, DbLogError> {
    budget.check("garbage_collect", 0)?;
    let by_age = clean_by_age(store, policy, now)?;

    budget.check("garbage_collect", 1)?;
    let by_count = clean_by_count(store, policy)?;

    let report = RetentionReport { by_age, by_count };
    tracing::info!(
        by_age = report.by_age,
        by_count = report.by_count,
        total = report.total(),
        "garbage collection finished"
    );
    Ok(report)
}

fn clean_by_age<S: RecordStore + ?Sized>(
    store: &mut S,
    policy: &RetentionPolicy,
    now: OffsetDateTime,
) -> Result<u64, DbLogError> {
    let Some(expr) = policy.max_length.as_deref() else {
        return Ok(0);
    };

    let age = match parse_max_length(expr) {
        Ok(age) => age,
        Err(err) => {
            tracing::warn!(error = %err, "skipping age-based retention");
            return Ok(0);
        }
    };

    // Ages beyond the representable range cannot match any row.
    let Some(cutoff) = now.checked_sub(age) else {
        return Ok(0);
    };

    store.delete_where(&RecordFilter::CreatedBefore(cutoff))
}

fn clean_by_count<S: RecordStore + ?Sized>(
    store: &mut S,
    policy: &RetentionPolicy,
) -> Result<u64, DbLogError> {
    let remaining = store.count_all()?;
    let limit = policy.effective_limit();
    if remaining <= limit {
        return Ok(0);
    }

    match store.row_at_offset(remaining - limit)? {
        Some(boundary) => store.delete_where(&RecordFilter::IdBefore(boundary.id)),
        None => Ok(0),
    }
}
