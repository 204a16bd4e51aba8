//! Database access capability.
//!
//! The exporter only needs four things from a database: which tables exist,
//! how to recreate one, a page of its rows, and how to escape a value.

use super::{TableClass, TableClassifier};
use crate::Result;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;

/// A table discovered in the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub class: TableClass,
}

/// One column value as read from the database
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Null,
    Text(String),
    Blob(Vec<u8>),
}

/// A page of rows with their column names
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPage {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<RowValue>>,
}

pub trait RowSource {
    /// Database server version, recorded in the manifest
    fn server_version(&self) -> Result<String>;

    /// All tables, classified relative to the tenant being backed up
    fn tables(&self) -> Result<Vec<TableInfo>>;

    /// Statement recreating `table`, `None` when the database has none
    fn create_statement(&self, table: &str) -> Result<Option<String>>;

    /// At most `limit` rows of `table`, skipping the first `offset`
    fn page(&self, table: &str, offset: u64, limit: u64) -> Result<RowPage>;

    /// Escape a value for use inside a single-quoted SQL literal
    fn escape(&self, value: &str) -> String;
}

/// Row source backed by a SQLite database file
pub struct SqliteRowSource {
    conn: Connection,
    classifier: TableClassifier,
}

impl SqliteRowSource {
    /// Open `path` read-only
    pub fn open(path: &Path, classifier: TableClassifier) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn, classifier })
    }

    /// Wrap an existing connection
    pub fn from_connection(conn: Connection, classifier: TableClassifier) -> Self {
        Self { conn, classifier }
    }

    /// Primary-key columns, or `rowid` for tables without one, so that
    /// offsets mean the same rows from one invocation to the next
    fn page_order(&self, table: &str) -> Result<String> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))?;
        let mut keys = stmt
            .query_map([], |row| Ok((row.get::<_, i64>("pk")?, row.get::<_, String>("name")?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        keys.retain(|(pk, _)| *pk > 0);
        keys.sort();

        if keys.is_empty() {
            return Ok("rowid".to_string());
        }
        Ok(keys.iter().map(|(_, name)| quote_identifier(name)).collect::<Vec<_>>().join(", "))
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl RowSource for SqliteRowSource {
    fn server_version(&self) -> Result<String> {
        let version: String = self.conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
        Ok(format!("SQLite {version}"))
    }

    fn tables(&self) -> Result<Vec<TableInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(names
            .into_iter()
            .map(|name| TableInfo {
                class: self.classifier.classify(&name),
                name,
            })
            .collect())
    }

    fn create_statement(&self, table: &str) -> Result<Option<String>> {
        let sql = self
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(sql.flatten())
    }

    fn page(&self, table: &str, offset: u64, limit: u64) -> Result<RowPage> {
        let query = format!(
            "SELECT * FROM {} ORDER BY {} LIMIT ?1 OFFSET ?2",
            quote_identifier(table),
            self.page_order(table)?
        );
        let mut stmt = self.conn.prepare(&query)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();

        let mut rows = Vec::new();
        let mut cursor = stmt.query(params![limit as i64, offset as i64])?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(match row.get_ref(idx)? {
                    ValueRef::Null => RowValue::Null,
                    ValueRef::Integer(i) => RowValue::Text(i.to_string()),
                    ValueRef::Real(f) => RowValue::Text(f.to_string()),
                    ValueRef::Text(t) => RowValue::Text(String::from_utf8_lossy(t).into_owned()),
                    ValueRef::Blob(b) => RowValue::Blob(b.to_vec()),
                });
            }
            rows.push(values);
        }

        Ok(RowPage { columns, rows })
    }

    fn escape(&self, value: &str) -> String {
        value.replace('\'', "''")
    }
}
