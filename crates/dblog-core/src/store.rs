use time::OffsetDateTime;

use crate::writer::NewLogRecord;
use crate::{ceil_to_second, DbLogError, DuplicateGroup, LogRecord};

/// Row predicate understood by every [`RecordStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    All,
    IdEq(i64),
    IdIn(Vec<i64>),
    IdBefore(i64),
    CreatedBefore(OffsetDateTime),
    TypeEq(String),
    /// Substring match against `message`.
    MessageMatch(String),
    And(Vec<RecordFilter>),
}

impl RecordFilter {
    /// Evaluates the predicate against an already loaded record.
    ///
    /// `CreatedBefore` compares at the store's whole-second resolution.
    #[must_use]
    pub fn matches(&self, record: &LogRecord) -> bool {
        match self {
            Self::All => true,
            Self::IdEq(id) => record.id == *id,
            Self::IdIn(ids) => ids.contains(&record.id),
            Self::IdBefore(id) => record.id < *id,
            Self::CreatedBefore(cutoff) => record.created < ceil_to_second(*cutoff),
            Self::TypeEq(log_type) => record.log_type == *log_type,
            Self::MessageMatch(needle) => record.message.contains(needle.as_str()),
            Self::And(filters) => filters.iter().all(|filter| filter.matches(record)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMutation {
    /// `count = count + delta`, applied by the backend in one statement.
    IncrementCount(i64),
}

/// Result of collapsing one duplicate group into its surviving row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldOutcome {
    pub deleted: u64,
    pub updated: u64,
    pub folded_count: i64,
}

/// Persistence capability behind the log table.
///
/// Implementations must make `insert` safe under concurrent writers and run
/// `fold_group` as a single atomic unit.
pub trait RecordStore {
    /// Persists a record, assigning `id`, `created` and `count = 1`.
    ///
    /// # Errors
    /// Returns [`DbLogError::Validation`] for malformed input and
    /// [`DbLogError::Persistence`] when the backend rejects the row.
    fn insert(&mut self, record: &NewLogRecord) -> Result<LogRecord, DbLogError>;

    /// # Errors
    /// Returns [`DbLogError::Persistence`] when the delete fails.
    fn delete_where(&mut self, filter: &RecordFilter) -> Result<u64, DbLogError>;

    /// # Errors
    /// Returns [`DbLogError::Persistence`] when the update fails.
    fn update_where(
        &mut self,
        filter: &RecordFilter,
        mutation: &RecordMutation,
    ) -> Result<u64, DbLogError>;

    /// Deletes `removed_ids` and adds their summed `count` to `keep_id`,
    /// atomically.
    ///
    /// # Errors
    /// Returns [`DbLogError::Persistence`] when the unit fails; nothing is
    /// applied in that case.
    fn fold_group(&mut self, keep_id: i64, removed_ids: &[i64]) -> Result<FoldOutcome, DbLogError>;

    /// # Errors
    /// Returns [`DbLogError::Persistence`] when the aggregate query fails.
    fn find_grouped_duplicates(&self) -> Result<Vec<DuplicateGroup>, DbLogError>;

    /// Matching records, newest first.
    ///
    /// # Errors
    /// Returns [`DbLogError::Persistence`] when the query fails.
    fn find_where(
        &self,
        filter: &RecordFilter,
        limit: Option<usize>,
    ) -> Result<Vec<LogRecord>, DbLogError>;

    /// # Errors
    /// Returns [`DbLogError::Persistence`] when the query fails.
    fn distinct_types(&self) -> Result<Vec<String>, DbLogError>;

    /// # Errors
    /// Returns [`DbLogError::Persistence`] when the query fails.
    fn count_all(&self) -> Result<u64, DbLogError>;

    /// Row at `offset` when ordered oldest first by `id`.
    ///
    /// # Errors
    /// Returns [`DbLogError::Persistence`] when the query fails.
    fn row_at_offset(&self, offset: u64) -> Result<Option<LogRecord>, DbLogError>;

    /// # Errors
    /// Returns [`DbLogError::Persistence`] when the table cannot be emptied.
    fn truncate_all(&mut self) -> Result<u64, DbLogError>;
}

impl<S: RecordStore + ?Sized> RecordStore for &mut S {
    fn insert(&mut self, record: &NewLogRecord) -> Result<LogRecord, DbLogError> {
        (**self).insert(record)
    }

    fn delete_where(&mut self, filter: &RecordFilter) -> Result<u64, DbLogError> {
        (**self).delete_where(filter)
    }

    fn update_where(
        &mut self,
        filter: &RecordFilter,
        mutation: &RecordMutation,
    ) -> Result<u64, DbLogError> {
        (**self).update_where(filter, mutation)
    }

    fn fold_group(&mut self, keep_id: i64, removed_ids: &[i64]) -> Result<FoldOutcome, DbLogError> {
        (**self).fold_group(keep_id, removed_ids)
    }

    fn find_grouped_duplicates(&self) -> Result<Vec<DuplicateGroup>, DbLogError> {
        (**self).find_grouped_duplicates()
    }

    fn find_where(
        &self,
        filter: &RecordFilter,
        limit: Option<usize>,
    ) -> Result<Vec<LogRecord>, DbLogError> {
        (**self).find_where(filter, limit)
    }

    fn distinct_types(&self) -> Result<Vec<String>, DbLogError> {
        (**self).distinct_types()
    }

    fn count_all(&self) -> Result<u64, DbLogError> {
        (**self).count_all()
    }

    fn row_at_offset(&self, offset: u64) -> Result<Option<LogRecord>, DbLogError> {
        (**self).row_at_offset(offset)
    }

    fn truncate_all(&mut self) -> Result<u64, DbLogError> {
        (**self).truncate_all()
    }
}
