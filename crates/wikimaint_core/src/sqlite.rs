use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, ErrorCode, OpenFlags, ToSql, params, params_from_iter};
use tracing::debug;

use crate::applier::WriteSink;
use crate::cursor::Window;
use crate::error::FetchError;
use crate::fetcher::{KeyBounds, RowSource};
use crate::row::{FieldMap, FieldValue, Key, Row};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Integer(value) => ToSqlOutput::Owned(Value::Integer(*value)),
            Self::Real(value) => ToSqlOutput::Owned(Value::Real(*value)),
            Self::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
            Self::Blob(value) => ToSqlOutput::Borrowed(ValueRef::Blob(value.as_slice())),
        })
    }
}

impl From<ValueRef<'_>> for FieldValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(value) => Self::Integer(value),
            ValueRef::Real(value) => Self::Real(value),
            ValueRef::Text(bytes) => Self::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Self::Blob(bytes.to_vec()),
        }
    }
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Lock contention clears on its own; everything else needs an operator.
fn classify(context: &str, error: rusqlite::Error) -> FetchError {
    let message = format!("{context}: {error}");
    match error.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => FetchError::Transient(message),
        _ => FetchError::Fatal(message),
    }
}

/// Read-only view of one table, opened against a replica file when one is
/// configured.
pub struct SqliteRowSource {
    connection: Connection,
    select_sql: String,
    bounds_sql: String,
    columns: Vec<String>,
}

impl SqliteRowSource {
    pub fn open(path: &Path, table: &str, key_column: &str, columns: Vec<String>) -> Result<Self> {
        let connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open {} read-only", path.display()))?;
        connection
            .busy_timeout(BUSY_TIMEOUT)
            .context("failed to set sqlite busy timeout")?;
        Ok(Self::from_connection(connection, table, key_column, columns))
    }

    pub fn from_connection(
        connection: Connection,
        table: &str,
        key_column: &str,
        columns: Vec<String>,
    ) -> Self {
        let table = quote_identifier(table);
        let key = quote_identifier(key_column);
        let mut projection = vec![key.clone()];
        projection.extend(columns.iter().map(|column| quote_identifier(column)));
        let select_sql = format!(
            "SELECT {} FROM {table} WHERE {key} >= ?1 AND {key} < ?2 ORDER BY {key} ASC",
            projection.join(", ")
        );
        let bounds_sql = format!("SELECT MIN({key}), MAX({key}) FROM {table}");
        Self {
            connection,
            select_sql,
            bounds_sql,
            columns,
        }
    }
}

impl RowSource for SqliteRowSource {
    fn select(&mut self, window: Window) -> Result<Vec<Row>, FetchError> {
        let mut statement = self
            .connection
            .prepare_cached(&self.select_sql)
            .map_err(|error| classify("failed to prepare window query", error))?;
        let mut cursor = statement
            .query(params![window.low, window.high])
            .map_err(|error| classify("failed to run window query", error))?;

        let mut rows = Vec::new();
        while let Some(record) = cursor
            .next()
            .map_err(|error| classify("failed to read window row", error))?
        {
            let key: Key = record
                .get(0)
                .map_err(|error| classify("key column is not an integer", error))?;
            let mut row = Row::new(key);
            for (index, column) in self.columns.iter().enumerate() {
                let value = record
                    .get_ref(index + 1)
                    .map_err(|error| classify("failed to read column", error))?;
                row.fields.insert(column.clone(), FieldValue::from(value));
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn key_bounds(&mut self) -> Result<Option<KeyBounds>, FetchError> {
        let (min, max): (Option<Key>, Option<Key>) = self
            .connection
            .query_row(&self.bounds_sql, [], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|error| classify("failed to read key bounds", error))?;
        Ok(match (min, max) {
            (Some(min), Some(max)) => Some(KeyBounds { min, max }),
            _ => None,
        })
    }
}

/// Primary connection. Each window is one `BEGIN IMMEDIATE` transaction; a
/// failing statement is undone on its own and leaves the rest of the window
/// intact.
pub struct SqliteWriteSink {
    connection: Connection,
}

impl SqliteWriteSink {
    pub fn open(path: &Path) -> Result<Self> {
        let connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open {}", path.display()))?;
        connection
            .busy_timeout(BUSY_TIMEOUT)
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign_keys pragma")?;
        Ok(Self { connection })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl WriteSink for SqliteWriteSink {
    fn begin_window(&mut self, window: Window) -> Result<()> {
        self.connection
            .execute_batch("BEGIN IMMEDIATE")
            .with_context(|| format!("failed to begin transaction for window {window}"))?;
        debug!("began transaction for window {window}");
        Ok(())
    }

    fn update(
        &mut self,
        table: &str,
        key_column: &str,
        key: Key,
        values: &FieldMap,
    ) -> Result<usize> {
        if values.is_empty() {
            bail!("update of {table} row {key} names no columns");
        }
        let assignments = values
            .keys()
            .enumerate()
            .map(|(index, column)| format!("{} = ?{}", quote_identifier(column), index + 1))
            .collect::<Vec<_>>();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            quote_identifier(table),
            assignments.join(", "),
            quote_identifier(key_column),
            values.len() + 1
        );
        let key_value = FieldValue::Integer(key);
        let bound = values.values().chain(std::iter::once(&key_value));
        self.connection
            .execute(&sql, params_from_iter(bound))
            .with_context(|| format!("failed to update {table} row {key}"))
    }

    fn delete(&mut self, table: &str, key_column: &str, key: Key) -> Result<usize> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_identifier(table),
            quote_identifier(key_column)
        );
        self.connection
            .execute(&sql, params![key])
            .with_context(|| format!("failed to delete {table} row {key}"))
    }

    fn insert(&mut self, table: &str, values: &FieldMap) -> Result<()> {
        if values.is_empty() {
            bail!("insert into {table} names no columns");
        }
        let columns = values
            .keys()
            .map(|column| quote_identifier(column))
            .collect::<Vec<_>>();
        let placeholders = (1..=values.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(table),
            columns.join(", "),
            placeholders.join(", ")
        );
        self.connection
            .execute(&sql, params_from_iter(values.values()))
            .with_context(|| format!("failed to insert into {table}"))?;
        Ok(())
    }

    fn commit_window(&mut self) -> Result<()> {
        self.connection
            .execute_batch("COMMIT")
            .context("failed to commit window transaction")
    }

    fn rollback_window(&mut self) -> Result<()> {
        if self.connection.is_autocommit() {
            return Ok(());
        }
        self.connection
            .execute_batch("ROLLBACK")
            .context("failed to roll back window transaction")
    }
}
