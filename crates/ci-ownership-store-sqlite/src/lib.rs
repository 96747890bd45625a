#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! Mapping table synchronization against the analytical SQLite store.
//!
//! Tables managed here are append-only: every push writes a new
//! generation keyed by `created_at`, a `<table>_latest` view projects
//! the newest generation per identity, and pruning deletes generations
//! strictly older than the table-wide maximum. Writes assume a single
//! writer per run; there is no cross-run transaction or lease.

use std::marker::PhantomData;
use std::ops::Range;
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use ci_ownership_core::{TestDescriptor, TestOwnership, VariantMapping};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const BATCH_SIZE: usize = 500;
const SCHEMA_META_TABLE: &str = "mapping_schemas";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    Bool,
    Timestamp,
    StringArray,
}

impl ColumnKind {
    #[must_use]
    fn sql_type(self) -> &'static str {
        match self {
            Self::Text | Self::StringArray => "TEXT",
            Self::Integer | Self::Bool | Self::Timestamp => "INTEGER",
            Self::Real => "REAL",
        }
    }
}

/// One column of a mapping table schema. Equality of whole schemas is
/// order- and count-sensitive and compares name, kind, repeated and
/// required per field.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub required: bool,
    pub repeated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
struct StoredColumn {
    name: String,
    kind: ColumnKind,
    required: bool,
    repeated: bool,
}

fn schemas_equal(stored: &[StoredColumn], declared: &[ColumnSpec]) -> bool {
    if stored.len() != declared.len() {
        return false;
    }
    stored.iter().zip(declared).all(|(lhs, rhs)| {
        lhs.name == rhs.name
            && lhs.kind == rhs.kind
            && lhs.required == rhs.required
            && lhs.repeated == rhs.repeated
    })
}

/// Schema-driven codec for one ownership record kind. Implementations
/// declare their column layout once; the table manager derives DDL,
/// inserts and row decoding from it. No reflection involved.
pub trait MappingRecord: Sized {
    const KIND: &'static str;

    fn columns() -> &'static [ColumnSpec];

    /// Identity used by the latest view to group generations.
    fn identity(&self) -> String;

    fn created_at(&self) -> Option<OffsetDateTime>;

    /// Row values in `columns()` order.
    ///
    /// # Errors
    /// Fails when a required field (notably `created_at`) is unset or
    /// not encodable.
    fn to_row(&self) -> Result<Vec<Value>>;

    /// Decodes a row selected in `columns()` order.
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MigrateOutcome {
    Created,
    Updated,
    UpToDate,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PushReport {
    pub rows: usize,
    pub batches: usize,
}

/// Manages one append-only mapping table for a record type `T`.
pub struct MappingTableManager<T> {
    conn: Connection,
    table: String,
    _record: PhantomData<T>,
}

impl<T: MappingRecord> MappingTableManager<T> {
    pub fn open(path: &Path, table: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::with_connection(conn, table)
    }

    pub fn open_in_memory(table: &str) -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::with_connection(conn, table)
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self> {
        validate_identifier(table)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            table: table.to_string(),
            _record: PhantomData,
        })
    }

    /// Creates the table, its latest view and its schema record when
    /// missing, or rebuilds the table in place when the recorded schema
    /// differs from the declared one. Safe to call on every run.
    pub fn migrate(&self) -> Result<MigrateOutcome> {
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {SCHEMA_META_TABLE} (
                    table_name TEXT PRIMARY KEY,
                    schema_json TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                 );"
            ))
            .context("failed to ensure mapping_schemas exists")?;

        let declared = T::columns();
        let Some(stored) = self.stored_schema()? else {
            info!(table = %self.table, "table doesn't exist, creating table");
            self.create_table(declared)?;
            self.record_schema(declared)?;
            info!(table = %self.table, "table created");
            return Ok(MigrateOutcome::Created);
        };

        if schemas_equal(&stored, declared) {
            info!(table = %self.table, "table schema is up-to-date");
            return Ok(MigrateOutcome::UpToDate);
        }

        self.rebuild_table(&stored, declared)
            .with_context(|| format!("failed to update table schema for {}", self.table))?;
        self.record_schema(declared)?;
        info!(table = %self.table, "table schema updated");
        Ok(MigrateOutcome::Updated)
    }

    /// Returns all rows of the latest view: per identity, the rows
    /// carrying the maximum `created_at` in that identity's history.
    pub fn list_mappings(&self) -> Result<Vec<T>> {
        let started = Instant::now();
        info!(table = %self.table, "fetching mappings from the store");

        let column_list = column_names(T::columns()).join(", ");
        let sql = format!(
            "SELECT {column_list} FROM {}_latest ORDER BY identity",
            self.table
        );
        debug!(%sql, "list query");

        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare latest view query for {}", self.table))?;
        let rows = stmt.query_map([], |row| T::from_row(row))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.with_context(|| format!("failed to decode {} row", T::KIND))?);
        }

        info!(
            table = %self.table,
            count = results.len(),
            elapsed = ?started.elapsed(),
            "fetched mappings from the store"
        );
        Ok(results)
    }

    /// Inserts records in batches of at most 500 rows. A batch failure
    /// aborts the remaining batches; rows from earlier batches stay
    /// (at-least-once, duplicates resolved by the latest view).
    pub fn push_mappings(&mut self, records: &[T]) -> Result<PushReport> {
        let column_list = column_names(T::columns());
        let placeholders: Vec<String> = (1..=column_list.len() + 1)
            .map(|index| format!("?{index}"))
            .collect();
        let sql = format!(
            "INSERT INTO {} (identity, {}) VALUES ({})",
            self.table,
            column_list.join(", "),
            placeholders.join(", ")
        );

        let mut batches = 0_usize;
        for span in batch_spans(records.len(), BATCH_SIZE) {
            let batch = &records[span.clone()];
            let tx = self
                .conn
                .transaction()
                .context("failed to start insert transaction")?;
            {
                let mut stmt = tx
                    .prepare(&sql)
                    .with_context(|| format!("failed to prepare insert for {}", self.table))?;
                for record in batch {
                    let mut values = vec![Value::Text(record.identity())];
                    values.extend(record.to_row()?);
                    stmt.execute(rusqlite::params_from_iter(values))
                        .with_context(|| {
                            format!("failed to insert {} row into {}", T::KIND, self.table)
                        })?;
                }
            }
            tx.commit()
                .with_context(|| format!("failed to commit insert batch into {}", self.table))?;
            batches += 1;
            info!(table = %self.table, rows = batch.len(), "added rows to mapping table");
        }

        Ok(PushReport {
            rows: records.len(),
            batches,
        })
    }

    /// Deletes rows strictly older than the maximum `created_at` in the
    /// whole table, returning the number of rows removed. A busy store
    /// is downgraded to a warning; retry the prune later.
    pub fn prune_mappings(&self) -> Result<u64> {
        let started = Instant::now();
        info!(table = %self.table, "pruning mapping table generations");

        let sql = format!(
            "DELETE FROM {table} WHERE created_at < (SELECT MAX(created_at) FROM {table})",
            table = self.table
        );
        debug!(%sql, "prune query");

        match self.conn.execute(&sql, []) {
            Ok(deleted) => {
                info!(
                    table = %self.table,
                    deleted,
                    elapsed = ?started.elapsed(),
                    "pruned mapping table"
                );
                Ok(deleted as u64)
            }
            Err(err) if is_busy(&err) => {
                warn!(
                    table = %self.table,
                    %err,
                    "store busy while pruning; please retry later"
                );
                Ok(0)
            }
            Err(err) => {
                Err(anyhow!(err).context(format!("failed to prune table {}", self.table)))
            }
        }
    }

    /// Maximum generation timestamp currently in the table, if any.
    pub fn latest_generation(&self) -> Result<Option<OffsetDateTime>> {
        let nanos: Option<i64> = self
            .conn
            .query_row(
                &format!("SELECT MAX(created_at) FROM {}", self.table),
                [],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to query max created_at for {}", self.table))?;

        nanos
            .map(|value| decode_timestamp(value).map_err(|err| anyhow!(err.to_string())))
            .transpose()
    }

    pub fn count_rows(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
                row.get(0)
            })
            .with_context(|| format!("failed to count rows in {}", self.table))?;
        u64::try_from(count).with_context(|| format!("invalid row count: {count}"))
    }

    fn stored_schema(&self) -> Result<Option<Vec<StoredColumn>>> {
        let json: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT schema_json FROM {SCHEMA_META_TABLE} WHERE table_name = ?1"),
                params![self.table],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query mapping_schemas")?;

        json.map(|raw| {
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid stored schema for {}", self.table))
        })
        .transpose()
    }

    fn record_schema(&self, declared: &[ColumnSpec]) -> Result<()> {
        let json = serde_json::to_string(declared).context("failed to serialize schema")?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {SCHEMA_META_TABLE} (table_name, schema_json, updated_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(table_name) DO UPDATE SET
                       schema_json = excluded.schema_json,
                       updated_at = excluded.updated_at"
                ),
                params![self.table, json, now_nanos()?],
            )
            .context("failed to record table schema")?;
        Ok(())
    }

    fn create_table(&self, declared: &[ColumnSpec]) -> Result<()> {
        let mut ddl_columns = vec!["identity TEXT NOT NULL".to_string()];
        for spec in declared {
            let not_null = if spec.required { " NOT NULL" } else { "" };
            ddl_columns.push(format!("{} {}{not_null}", spec.name, spec.kind.sql_type()));
        }

        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} ({columns});
                 CREATE INDEX IF NOT EXISTS idx_{table}_identity_created
                   ON {table}(identity, created_at);
                 {view}",
                table = self.table,
                columns = ddl_columns.join(", "),
                view = self.latest_view_ddl(),
            ))
            .with_context(|| format!("failed to create table {}", self.table))?;
        Ok(())
    }

    fn latest_view_ddl(&self) -> String {
        format!(
            "CREATE VIEW IF NOT EXISTS {table}_latest AS
             SELECT current.*
             FROM {table} current
             JOIN (
                SELECT identity, MAX(created_at) AS max_created_at
                FROM {table}
                GROUP BY identity
             ) latest
               ON current.identity = latest.identity
              AND current.created_at = latest.max_created_at;",
            table = self.table
        )
    }

    fn rebuild_table(&self, stored: &[StoredColumn], declared: &[ColumnSpec]) -> Result<()> {
        let shared: Vec<&str> = declared
            .iter()
            .map(|spec| spec.name)
            .filter(|name| stored.iter().any(|column| column.name == *name))
            .collect();

        let staging = format!("{}_migration", self.table);
        let mut ddl_columns = vec!["identity TEXT NOT NULL".to_string()];
        for spec in declared {
            let not_null = if spec.required { " NOT NULL" } else { "" };
            ddl_columns.push(format!("{} {}{not_null}", spec.name, spec.kind.sql_type()));
        }

        let copy_columns = if shared.is_empty() {
            "identity".to_string()
        } else {
            format!("identity, {}", shared.join(", "))
        };

        self.conn
            .execute_batch(&format!(
                "BEGIN;
                 CREATE TABLE {staging} ({columns});
                 INSERT INTO {staging} ({copy_columns})
                   SELECT {copy_columns} FROM {table};
                 DROP VIEW IF EXISTS {table}_latest;
                 DROP INDEX IF EXISTS idx_{table}_identity_created;
                 DROP TABLE {table};
                 ALTER TABLE {staging} RENAME TO {table};
                 CREATE INDEX idx_{table}_identity_created
                   ON {table}(identity, created_at);
                 {view}
                 COMMIT;",
                columns = ddl_columns.join(", "),
                table = self.table,
                view = self.latest_view_ddl(),
            ))
            .with_context(|| format!("failed to rebuild table {}", self.table))?;
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Half-open batch ranges covering `total` rows, `size` rows at most
/// per batch.
#[must_use]
pub fn batch_spans(total: usize, size: usize) -> Vec<Range<usize>> {
    if size == 0 {
        return Vec::new();
    }

    let mut spans = Vec::new();
    let mut start = 0;
    while start < total {
        let end = (start + size).min(total);
        spans.push(start..end);
        start = end;
    }
    spans
}

fn column_names(columns: &[ColumnSpec]) -> Vec<&'static str> {
    columns.iter().map(|spec| spec.name).collect()
}

fn is_busy(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            failure.code == rusqlite::ErrorCode::DatabaseBusy
                || failure.code == rusqlite::ErrorCode::DatabaseLocked
                || message
                    .as_deref()
                    .is_some_and(|text| text.contains("locked"))
        }
        _ => false,
    }
}

fn validate_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(anyhow!("invalid table name: {name:?}"));
    }
    Ok(())
}

fn now_nanos() -> Result<i64> {
    encode_timestamp(OffsetDateTime::now_utc())
}

fn encode_timestamp(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("timestamp out of range: {value}"))
}

fn decode_timestamp(nanos: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid created_at value {nanos}: {err}"),
            )),
        )
    })
}

fn required_created_at(created_at: Option<OffsetDateTime>, kind: &str) -> Result<i64> {
    let value =
        created_at.ok_or_else(|| anyhow!("{kind} record is missing created_at before push"))?;
    encode_timestamp(value)
}

fn decode_string_array(column: usize, raw: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid string array: {err}"),
            )),
        )
    })
}

const TEST_OWNERSHIP_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec { name: "id", kind: ColumnKind::Text, required: true, repeated: false },
    ColumnSpec { name: "name", kind: ColumnKind::Text, required: true, repeated: false },
    ColumnSpec { name: "suite", kind: ColumnKind::Text, required: true, repeated: false },
    ColumnSpec { name: "component", kind: ColumnKind::Text, required: true, repeated: false },
    ColumnSpec { name: "jira_component", kind: ColumnKind::Text, required: true, repeated: false },
    ColumnSpec { name: "jira_component_id", kind: ColumnKind::Integer, required: false, repeated: false },
    ColumnSpec { name: "capabilities", kind: ColumnKind::StringArray, required: true, repeated: true },
    ColumnSpec { name: "priority", kind: ColumnKind::Integer, required: true, repeated: false },
    ColumnSpec { name: "product", kind: ColumnKind::Text, required: true, repeated: false },
    ColumnSpec { name: "kind", kind: ColumnKind::Text, required: true, repeated: false },
    ColumnSpec { name: "api_version", kind: ColumnKind::Text, required: true, repeated: false },
    ColumnSpec { name: "created_at", kind: ColumnKind::Timestamp, required: true, repeated: false },
    ColumnSpec { name: "staff_approved_obsolete", kind: ColumnKind::Bool, required: true, repeated: false },
];

impl MappingRecord for TestOwnership {
    const KIND: &'static str = "TestOwnership";

    fn columns() -> &'static [ColumnSpec] {
        TEST_OWNERSHIP_COLUMNS
    }

    fn identity(&self) -> String {
        self.id.clone()
    }

    fn created_at(&self) -> Option<OffsetDateTime> {
        self.created_at
    }

    fn to_row(&self) -> Result<Vec<Value>> {
        let capabilities =
            serde_json::to_string(&self.capabilities).context("failed to encode capabilities")?;

        Ok(vec![
            Value::Text(self.id.clone()),
            Value::Text(self.name.clone()),
            Value::Text(self.suite.clone()),
            Value::Text(self.component.clone()),
            Value::Text(self.jira_component.clone()),
            self.jira_component_id.map_or(Value::Null, Value::Integer),
            Value::Text(capabilities),
            Value::Integer(self.priority),
            Value::Text(self.product.clone()),
            Value::Text(self.kind.clone()),
            Value::Text(self.api_version.clone()),
            Value::Integer(required_created_at(self.created_at, Self::KIND)?),
            Value::Integer(i64::from(self.staff_approved_obsolete)),
        ])
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let capabilities_raw: String = row.get(6)?;
        let created_at_nanos: i64 = row.get(11)?;

        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            suite: row.get(2)?,
            component: row.get(3)?,
            jira_component: row.get(4)?,
            jira_component_id: row.get(5)?,
            capabilities: decode_string_array(6, &capabilities_raw)?,
            priority: row.get(7)?,
            product: row.get(8)?,
            kind: row.get(9)?,
            api_version: row.get(10)?,
            created_at: Some(decode_timestamp(created_at_nanos)?),
            staff_approved_obsolete: row.get::<_, i64>(12)? == 1,
        })
    }
}

const VARIANT_MAPPING_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec { name: "variant_category", kind: ColumnKind::Text, required: true, repeated: false },
    ColumnSpec { name: "variant_value", kind: ColumnKind::Text, required: true, repeated: false },
    ColumnSpec { name: "jira_project", kind: ColumnKind::Text, required: true, repeated: false },
    ColumnSpec { name: "jira_component", kind: ColumnKind::Text, required: true, repeated: false },
    ColumnSpec { name: "product", kind: ColumnKind::Text, required: true, repeated: false },
    ColumnSpec { name: "kind", kind: ColumnKind::Text, required: true, repeated: false },
    ColumnSpec { name: "api_version", kind: ColumnKind::Text, required: true, repeated: false },
    ColumnSpec { name: "created_at", kind: ColumnKind::Timestamp, required: true, repeated: false },
];

impl MappingRecord for VariantMapping {
    const KIND: &'static str = "VariantMapping";

    fn columns() -> &'static [ColumnSpec] {
        VARIANT_MAPPING_COLUMNS
    }

    fn identity(&self) -> String {
        self.variant()
    }

    fn created_at(&self) -> Option<OffsetDateTime> {
        self.created_at
    }

    fn to_row(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Text(self.variant_category.clone()),
            Value::Text(self.variant_value.clone()),
            Value::Text(self.jira_project.clone()),
            Value::Text(self.jira_component.clone()),
            Value::Text(self.product.clone()),
            Value::Text(self.kind.clone()),
            Value::Text(self.api_version.clone()),
            Value::Integer(required_created_at(self.created_at, Self::KIND)?),
        ])
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let created_at_nanos: i64 = row.get(7)?;

        Ok(Self {
            variant_category: row.get(0)?,
            variant_value: row.get(1)?,
            jira_project: row.get(2)?,
            jira_component: row.get(3)?,
            product: row.get(4)?,
            kind: row.get(5)?,
            api_version: row.get(6)?,
            created_at: Some(decode_timestamp(created_at_nanos)?),
        })
    }
}

/// Reads the test corpus from a junit results table. This is the
/// warehouse-backed corpus provider; local runs read a JSON snapshot
/// instead.
pub fn list_test_corpus(path: &Path, junit_table: &str) -> Result<Vec<TestDescriptor>> {
    validate_identifier(junit_table)?;
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    let started = Instant::now();
    info!(table = %junit_table, "fetching test corpus");

    let mut stmt = conn
        .prepare(&format!(
            "SELECT DISTINCT test_name, testsuite
             FROM {junit_table}
             ORDER BY test_name, testsuite"
        ))
        .with_context(|| format!("failed to prepare corpus query for {junit_table}"))?;

    let rows = stmt.query_map([], |row| {
        Ok(TestDescriptor {
            name: row.get(0)?,
            suite: row.get(1)?,
        })
    })?;

    let mut tests = Vec::new();
    for row in rows {
        tests.push(row.context("failed to decode test corpus row")?);
    }

    info!(
        count = tests.len(),
        elapsed = ?started.elapsed(),
        "fetched test corpus"
    );
    Ok(tests)
}
