#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dblog_core::{
    ceil_to_second, format_rfc3339, parse_rfc3339_utc, truncate_to_second, validate_table_name, Clock,
    DbLogError, DuplicateGroup, FoldOutcome, LogRecord, NewLogRecord, RecordFilter,
    RecordMutation, RecordStore, SystemClock, DEFAULT_TABLE,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, TransactionBehavior,
};
use time::OffsetDateTime;

const LOG_MIGRATION_VERSION: i64 = 1;
const FOLD_CHUNK_SIZE: usize = 500;
const RECORD_COLUMNS: &str =
    "id, type, message, context, count, created, ip, hostname, uri, refer, user_agent";
const REQUIRED_COLUMNS: &[&str] = &[
    "id",
    "type",
    "message",
    "context",
    "count",
    "created",
    "ip",
    "hostname",
    "uri",
    "refer",
    "user_agent",
];

fn schema_sql(table: &str) -> String {
    format!(
        r"
CREATE TABLE IF NOT EXISTS {table} (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  type TEXT NOT NULL CHECK (length(trim(type)) > 0),
  message TEXT NOT NULL,
  context TEXT NOT NULL DEFAULT '',
  count INTEGER NOT NULL DEFAULT 1 CHECK (count >= 1),
  created TEXT NOT NULL,
  ip TEXT NOT NULL DEFAULT '',
  hostname TEXT NOT NULL DEFAULT '',
  uri TEXT NOT NULL DEFAULT '',
  refer TEXT NOT NULL DEFAULT '',
  user_agent TEXT NOT NULL DEFAULT ''
);

CREATE TRIGGER IF NOT EXISTS trg_{table}_only_count_mutable
BEFORE UPDATE ON {table}
WHEN NEW.id IS NOT OLD.id
  OR NEW.type IS NOT OLD.type
  OR NEW.message IS NOT OLD.message
  OR NEW.context IS NOT OLD.context
  OR NEW.created IS NOT OLD.created
  OR NEW.ip IS NOT OLD.ip
  OR NEW.hostname IS NOT OLD.hostname
  OR NEW.uri IS NOT OLD.uri
  OR NEW.refer IS NOT OLD.refer
  OR NEW.user_agent IS NOT OLD.user_agent
BEGIN
  SELECT RAISE(FAIL, '{table}: only count may change after insert');
END;

CREATE INDEX IF NOT EXISTS idx_{table}_type_message
  ON {table}(type, message);
CREATE INDEX IF NOT EXISTS idx_{table}_created
  ON {table}(created, id);
"
    )
}

/// SQLite-backed [`RecordStore`].
///
/// Open one store per writer thread or process; WAL mode and the busy
/// timeout let their inserts interleave with maintenance runs.
pub struct SqliteLogStore {
    conn: Connection,
    table: String,
    clock: Arc<dyn Clock>,
}

impl SqliteLogStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_table(path, DEFAULT_TABLE)
    }

    pub fn open_with_table(path: &Path, table: &str) -> Result<Self> {
        validate_table_name(table).map_err(|err| anyhow!(err.to_string()))?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            table: table.to_string(),
            clock: Arc::new(SystemClock),
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    table_name TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    applied_at TEXT NOT NULL,
                    PRIMARY KEY (table_name, version)
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        let adopted = table_exists(&self.conn, &self.table)?;
        self.conn
            .execute_batch(&schema_sql(&self.table))
            .with_context(|| format!("failed to apply log schema to {}", self.table))?;

        ensure_table_has_columns(&self.conn, &self.table, REQUIRED_COLUMNS)?;

        let now = format_rfc3339(self.clock.now()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(table_name, version, applied_at)
                 VALUES (?1, ?2, ?3)",
                params![self.table, LOG_MIGRATION_VERSION, now],
            )
            .context("failed to register log schema migration")?;

        tracing::debug!(table = %self.table, adopted, "log table migrated");
        Ok(())
    }

    /// Stores `record` with its text fields trimmed.
    pub fn append(&mut self, record: &NewLogRecord) -> Result<LogRecord> {
        let log_type = record.log_type.trim();
        let message = record.message.trim();
        let context = record.context.trim();
        let created = truncate_to_second(self.clock.now());
        let created_raw = format_rfc3339(created).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                &format!(
                    "INSERT INTO {}(
                        type, message, context, count, created,
                        ip, hostname, uri, refer, user_agent
                     ) VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, ?8, ?9)",
                    self.table
                ),
                params![
                    log_type,
                    message,
                    context,
                    created_raw,
                    record.origin.ip,
                    record.origin.hostname,
                    record.origin.uri,
                    record.origin.refer,
                    record.origin.user_agent,
                ],
            )
            .context("failed to insert log record")?;

        Ok(LogRecord {
            id: self.conn.last_insert_rowid(),
            log_type: log_type.to_string(),
            message: message.to_string(),
            context: context.to_string(),
            count: 1,
            created,
            ip: record.origin.ip.clone(),
            hostname: record.origin.hostname.clone(),
            uri: record.origin.uri.clone(),
            refer: record.origin.refer.clone(),
            user_agent: record.origin.user_agent.clone(),
        })
    }

    pub fn fold(&mut self, keep_id: i64, removed_ids: &[i64]) -> Result<FoldOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start fold transaction")?;

        let mut folded_count = 0_i64;
        let mut deleted = 0_u64;
        for chunk in removed_ids.chunks(FOLD_CHUNK_SIZE) {
            let ids: Vec<i64> = chunk.iter().copied().filter(|id| *id != keep_id).collect();
            let filter = RecordFilter::IdIn(ids);
            folded_count += sum_counts(&tx, &self.table, &filter)?;
            deleted += delete_matching(&tx, &self.table, &filter)?;
        }

        if deleted == 0 {
            return Ok(FoldOutcome::default());
        }

        let updated = update_matching(
            &tx,
            &self.table,
            &RecordFilter::IdEq(keep_id),
            &RecordMutation::IncrementCount(folded_count),
        )?;

        // The surviving row vanished underneath us; keep the group intact
        // rather than dropping the folded counts.
        if updated == 0 {
            tracing::warn!(keep_id, "duplicate group changed during fold, skipping");
            return Ok(FoldOutcome::default());
        }

        tx.commit().context("failed to commit fold transaction")?;

        Ok(FoldOutcome {
            deleted,
            updated,
            folded_count,
        })
    }

    pub fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT type, message, COUNT(*)
             FROM {}
             GROUP BY type, message
             HAVING COUNT(*) > 1
             ORDER BY MIN(id) ASC",
            self.table
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let heads = collect_rows(rows)?;

        let mut members_stmt = self.conn.prepare(&format!(
            "SELECT id FROM {}
             WHERE type = ?1 AND message = ?2
             ORDER BY created DESC, id DESC",
            self.table
        ))?;

        let mut groups = Vec::with_capacity(heads.len());
        for (log_type, message, count) in heads {
            let member_rows =
                members_stmt.query_map(params![log_type, message], |row| row.get::<_, i64>(0))?;
            let member_ids = collect_rows(member_rows)?;
            groups.push(DuplicateGroup {
                log_type,
                message,
                count: u64::try_from(count)
                    .with_context(|| format!("invalid group count: {count}"))?,
                member_ids,
            });
        }

        Ok(groups)
    }

    pub fn list(&self, filter: &RecordFilter, limit: Option<usize>) -> Result<Vec<LogRecord>> {
        let mut values = Vec::new();
        let clause = filter_sql(filter, &mut values)?;
        let mut query = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE {clause} ORDER BY id DESC",
            self.table
        );

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), parse_record_row)?;
        collect_rows(rows)
    }

    pub fn types(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT type FROM {} ORDER BY type ASC",
            self.table
        ))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect_rows(rows)
    }

    pub fn count_rows(&self) -> Result<u64> {
        let count = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
                row.get::<_, i64>(0)
            })
            .with_context(|| format!("failed to count {} rows", self.table))?;
        u64::try_from(count).with_context(|| format!("invalid row count: {count}"))
    }

    pub fn row_at(&self, offset: u64) -> Result<Option<LogRecord>> {
        let offset = i64::try_from(offset).with_context(|| format!("offset too large: {offset}"))?;
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM {} ORDER BY id ASC LIMIT 1 OFFSET ?1",
                    self.table
                ),
                params![offset],
                parse_record_row,
            )
            .optional()
            .context("failed to read row at offset")?;
        Ok(row)
    }

    pub fn truncate(&mut self) -> Result<u64> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start truncate transaction")?;
        let deleted = delete_matching(&tx, &self.table, &RecordFilter::All)?;
        tx.execute(
            "DELETE FROM sqlite_sequence WHERE name = ?1",
            params![self.table],
        )
        .context("failed to reset id sequence")?;
        tx.commit().context("failed to commit truncate")?;
        Ok(deleted)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl RecordStore for SqliteLogStore {
    fn insert(&mut self, record: &NewLogRecord) -> Result<LogRecord, DbLogError> {
        record.validate()?;
        self.append(record).map_err(DbLogError::persistence)
    }

    fn delete_where(&mut self, filter: &RecordFilter) -> Result<u64, DbLogError> {
        delete_matching(&self.conn, &self.table, filter).map_err(DbLogError::persistence)
    }

    fn update_where(
        &mut self,
        filter: &RecordFilter,
        mutation: &RecordMutation,
    ) -> Result<u64, DbLogError> {
        update_matching(&self.conn, &self.table, filter, mutation).map_err(DbLogError::persistence)
    }

    fn fold_group(&mut self, keep_id: i64, removed_ids: &[i64]) -> Result<FoldOutcome, DbLogError> {
        self.fold(keep_id, removed_ids)
            .map_err(DbLogError::persistence)
    }

    fn find_grouped_duplicates(&self) -> Result<Vec<DuplicateGroup>, DbLogError> {
        self.duplicate_groups().map_err(DbLogError::persistence)
    }

    fn find_where(
        &self,
        filter: &RecordFilter,
        limit: Option<usize>,
    ) -> Result<Vec<LogRecord>, DbLogError> {
        self.list(filter, limit).map_err(DbLogError::persistence)
    }

    fn distinct_types(&self) -> Result<Vec<String>, DbLogError> {
        self.types().map_err(DbLogError::persistence)
    }

    fn count_all(&self) -> Result<u64, DbLogError> {
        self.count_rows().map_err(DbLogError::persistence)
    }

    fn row_at_offset(&self, offset: u64) -> Result<Option<LogRecord>, DbLogError> {
        self.row_at(offset).map_err(DbLogError::persistence)
    }

    fn truncate_all(&mut self) -> Result<u64, DbLogError> {
        self.truncate().map_err(DbLogError::persistence)
    }
}

fn filter_sql(filter: &RecordFilter, values: &mut Vec<SqlValue>) -> Result<String> {
    let clause = match filter {
        RecordFilter::All => "1".to_string(),
        RecordFilter::IdEq(id) => {
            values.push(SqlValue::Integer(*id));
            "id = ?".to_string()
        }
        RecordFilter::IdIn(ids) if ids.is_empty() => "0".to_string(),
        RecordFilter::IdIn(ids) => {
            values.extend(ids.iter().map(|id| SqlValue::Integer(*id)));
            format!("id IN ({})", vec!["?"; ids.len()].join(", "))
        }
        RecordFilter::IdBefore(id) => {
            values.push(SqlValue::Integer(*id));
            "id < ?".to_string()
        }
        RecordFilter::CreatedBefore(cutoff) => {
            let raw = format_rfc3339(ceil_to_second(*cutoff))
                .map_err(|err| anyhow!(err.to_string()))?;
            values.push(SqlValue::Text(raw));
            "created < ?".to_string()
        }
        RecordFilter::TypeEq(log_type) => {
            values.push(SqlValue::Text(log_type.clone()));
            "type = ?".to_string()
        }
        RecordFilter::MessageMatch(needle) => {
            values.push(SqlValue::Text(needle.clone()));
            "instr(message, ?) > 0".to_string()
        }
        RecordFilter::And(filters) if filters.is_empty() => "1".to_string(),
        RecordFilter::And(filters) => {
            let mut parts = Vec::with_capacity(filters.len());
            for inner in filters {
                parts.push(format!("({})", filter_sql(inner, values)?));
            }
            parts.join(" AND ")
        }
    };
    Ok(clause)
}

fn delete_matching(conn: &Connection, table: &str, filter: &RecordFilter) -> Result<u64> {
    let mut values = Vec::new();
    let clause = filter_sql(filter, &mut values)?;
    let deleted = conn
        .execute(
            &format!("DELETE FROM {table} WHERE {clause}"),
            params_from_iter(values.iter()),
        )
        .with_context(|| format!("failed to delete rows from {table}"))?;
    Ok(u64::try_from(deleted)?)
}

fn update_matching(
    conn: &Connection,
    table: &str,
    filter: &RecordFilter,
    mutation: &RecordMutation,
) -> Result<u64> {
    let RecordMutation::IncrementCount(delta) = mutation;
    let mut values = vec![SqlValue::Integer(*delta)];
    let clause = filter_sql(filter, &mut values)?;
    let updated = conn
        .execute(
            &format!("UPDATE {table} SET count = count + ? WHERE {clause}"),
            params_from_iter(values.iter()),
        )
        .with_context(|| format!("failed to update rows in {table}"))?;
    Ok(u64::try_from(updated)?)
}

fn sum_counts(conn: &Connection, table: &str, filter: &RecordFilter) -> Result<i64> {
    let mut values = Vec::new();
    let clause = filter_sql(filter, &mut values)?;
    conn.query_row(
        &format!("SELECT COALESCE(SUM(count), 0) FROM {table} WHERE {clause}"),
        params_from_iter(values.iter()),
        |row| row.get::<_, i64>(0),
    )
    .with_context(|| format!("failed to sum counts in {table}"))
}

fn parse_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogRecord> {
    let created_raw: String = row.get(5)?;
    let created = parse_rfc3339_utc(&created_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        )
    })?;

    Ok(LogRecord {
        id: row.get(0)?,
        log_type: row.get(1)?,
        message: row.get(2)?,
        context: row.get(3)?,
        count: row.get(4)?,
        created,
        ip: row.get(6)?,
        hostname: row.get(7)?,
        uri: row.get(8)?,
        refer: row.get(9)?,
        user_agent: row.get(10)?,
    })
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "log table check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
