//! Duplicate coalescing: one surviving row per `(type, message)` pair.

use serde::{Deserialize, Serialize};

use crate::store::RecordStore;
use crate::{DbLogError, MaintenanceBudget};

/// Outcome of a deduplication run.
///
/// `updated` counts count-update operations, one per folded group, and is
/// the figure host applications historically received from this task. Rows
/// removed are reported separately in `deleted`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DedupReport {
    pub updated: u64,
    pub deleted: u64,
}

/// Keeps the newest row of every duplicate group and folds the others'
/// counts into it.
///
/// Groups are processed one transaction at a time, so rows inserted while
/// the run is in progress are picked up by the next run.
///
/// # Errors
/// Returns [`DbLogError::Persistence`] when a query or fold fails and
/// [`DbLogError::DeadlineExceeded`] when the budget runs out between groups.
/// Groups folded before the error stay folded.
pub fn remove_duplicates<S: RecordStore + ?Sized>(
    store: &mut S,
    budget: &MaintenanceBudget,
) -> Result<DedupReport, DbLogError> {
    let groups = store.find_grouped_duplicates()?;
    let mut report = DedupReport::default();

    for group in groups {
        budget.check("remove_duplicates", report.updated)?;

        if group.count <= 1 {
            continue;
        }
        let Some((keep_id, removed_ids)) = group.member_ids.split_first() else {
            continue;
        };
        if removed_ids.is_empty() {
            continue;
        }

        let outcome = store.fold_group(*keep_id, removed_ids)?;
        tracing::debug!(
            log_type = %group.log_type,
            keep_id = *keep_id,
            deleted = outcome.deleted,
            folded_count = outcome.folded_count,
            "folded duplicate group"
        );
        report.updated += outcome.updated;
        report.deleted += outcome.deleted;
    }

    tracing::info!(
        updated = report.updated,
        deleted = report.deleted,
        "duplicate removal finished"
    );
    Ok(report)
}
