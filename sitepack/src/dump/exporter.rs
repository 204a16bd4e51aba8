//! Paged SQL table export.
//!
//! Each call dumps one page of one table into the running SQL file, so a
//! large table is spread over as many batches as it needs.

use super::row_source::{RowPage, RowSource, RowValue};
use super::TableClass;
use crate::fs::append_locked;
use crate::job::manifest::Manifest;
use crate::Result;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default number of rows per INSERT statement
pub const DEFAULT_PAGE_SIZE: u64 = 100;

/// What to do with a table after a page was exported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// Resume from this row offset
    Next(u64),
    /// The table is finished (or was skipped)
    Done,
}

pub struct TableDumpExporter<'a> {
    rows: &'a dyn RowSource,
    dump_path: PathBuf,
    page_size: u64,
}

impl<'a> TableDumpExporter<'a> {
    pub fn new(rows: &'a dyn RowSource, dump_path: impl Into<PathBuf>, page_size: u64) -> Self {
        Self {
            rows,
            dump_path: dump_path.into(),
            page_size: page_size.max(1),
        }
    }

    pub fn dump_path(&self) -> &Path {
        &self.dump_path
    }

    /// Export the page of `table` starting at `offset`.
    ///
    /// The first page (offset 0) is preceded by the table's schema.
    pub fn export_page(&self, manifest: &Manifest, table: &str, offset: u64) -> Result<PageOutcome> {
        if let Some(reason) = skip_reason(manifest, table) {
            info!("Skipping table {}: {}", table, reason);
            return Ok(PageOutcome::Done);
        }

        let schema = if offset == 0 {
            match self.rows.create_statement(table)? {
                Some(create) => Some(create),
                None => {
                    warn!("Could not get CREATE statement for {}", table);
                    return Ok(PageOutcome::Done);
                }
            }
        } else {
            None
        };

        let page = self.rows.page(table, offset, self.page_size)?;

        let mut sql = String::new();
        if let Some(create) = schema {
            // the importer re-prefixes tables through the marker line
            let prefix = manifest.table_prefix();
            let _ = write!(
                sql,
                "-- Table {table}\n-- CAMBRIAN[[/{unprefixed}/{table}/]]\nDROP TABLE IF EXISTS {quoted};\n{create};\n\n",
                unprefixed = table.strip_prefix(prefix.as_str()).unwrap_or(table),
                quoted = quote(table),
                create = create.trim_end().trim_end_matches(';'),
            );
        }
        if !page.rows.is_empty() {
            sql.push_str(&self.insert_statement(table, &page));
        }
        if !sql.is_empty() {
            append_locked(&self.dump_path, sql.as_bytes())?;
        }

        if page.rows.is_empty() {
            debug!("Table {} finished at offset {}", table, offset);
            Ok(PageOutcome::Done)
        } else {
            debug!("Dumped {} rows of {} from offset {}", page.rows.len(), table, offset);
            Ok(PageOutcome::Next(offset + self.page_size))
        }
    }

    fn insert_statement(&self, table: &str, page: &RowPage) -> String {
        let columns = page.columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
        let tuples = page
            .rows
            .iter()
            .map(|row| {
                let values = row.iter().map(|v| self.literal(v)).collect::<Vec<_>>().join(", ");
                format!("({values})")
            })
            .collect::<Vec<_>>()
            .join(",\n  ");

        format!("INSERT INTO {}\n  ({columns})\nVALUES\n  {tuples};\n\n", quote(table))
    }

    fn literal(&self, value: &RowValue) -> String {
        match value {
            RowValue::Null => "NULL".to_string(),
            RowValue::Text(text) => format!("'{}'", self.rows.escape(text)),
            RowValue::Blob(bytes) => {
                let mut hex = String::with_capacity(bytes.len() * 2 + 3);
                hex.push_str("X'");
                for b in bytes {
                    let _ = write!(hex, "{b:02x}");
                }
                hex.push('\'');
                hex
            }
        }
    }
}

/// Tables that belong to another tenant or are shared between tenants are
/// never queried.
fn skip_reason(manifest: &Manifest, table: &str) -> Option<&'static str> {
    match manifest.table_class(table) {
        Some(TableClass::Global) => return Some("shared global table"),
        Some(TableClass::OtherTenant) => return Some("belongs to another tenant"),
        Some(TableClass::Tenant) | None => {}
    }
    if !table.starts_with(&manifest.table_prefix()) {
        return Some("belongs to another tenant");
    }
    None
}

fn quote(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::row_source::TableInfo;
    use crate::BackupError;
    use serde_json::json;
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// In-memory tables that record which ones were queried
    struct FakeRows {
        tables: Vec<(String, Vec<String>, Vec<Vec<RowValue>>)>,
        queried: RefCell<Vec<String>>,
    }

    impl FakeRows {
        fn new() -> Self {
            let users = (0..5)
                .map(|i| vec![RowValue::Text(i.to_string()), RowValue::Text(format!("user{i}"))])
                .collect();
            Self {
                tables: vec![
                    ("wp_users".to_string(), vec!["id".to_string(), "login".to_string()], users),
                    ("wp_sitemeta".to_string(), vec!["k".to_string()], vec![]),
                    ("other_posts".to_string(), vec!["id".to_string()], vec![]),
                ],
                queried: RefCell::new(Vec::new()),
            }
        }

        fn find(&self, table: &str) -> Result<&(String, Vec<String>, Vec<Vec<RowValue>>)> {
            self.queried.borrow_mut().push(table.to_string());
            self.tables
                .iter()
                .find(|t| t.0 == table)
                .ok_or_else(|| BackupError::JobNotFound(table.to_string()))
        }
    }

    impl RowSource for FakeRows {
        fn server_version(&self) -> Result<String> {
            Ok("fake 1.0".to_string())
        }

        fn tables(&self) -> Result<Vec<TableInfo>> {
            Ok(Vec::new())
        }

        fn create_statement(&self, table: &str) -> Result<Option<String>> {
            let t = self.find(table)?;
            Ok(Some(format!("CREATE TABLE {} ({})", t.0, t.1.join(", "))))
        }

        fn page(&self, table: &str, offset: u64, limit: u64) -> Result<RowPage> {
            let t = self.find(table)?;
            Ok(RowPage {
                columns: t.1.clone(),
                rows: t.2.iter().skip(offset as usize).take(limit as usize).cloned().collect(),
            })
        }

        fn escape(&self, value: &str) -> String {
            value.replace('\'', "\\'")
        }
    }

    fn manifest() -> Manifest {
        let mut manifest = Manifest::new();
        manifest
            .merge(&json!({
                "table_prefix": "wp_",
                "tables": { "wp_users": "tenant", "wp_sitemeta": "global" }
            }))
            .unwrap();
        manifest
    }

    #[test]
    fn test_skip_rules() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let rows = FakeRows::new();
        let exporter = TableDumpExporter::new(&rows, temp_dir.path().join("dump.sql"), 100);
        let manifest = manifest();

        assert_eq!(exporter.export_page(&manifest, "wp_sitemeta", 0)?, PageOutcome::Done);
        assert_eq!(exporter.export_page(&manifest, "other_posts", 0)?, PageOutcome::Done);
        assert!(rows.queried.borrow().is_empty());

        assert_eq!(exporter.export_page(&manifest, "wp_users", 0)?, PageOutcome::Next(100));
        assert!(rows.queried.borrow().iter().all(|t| t == "wp_users"));
        Ok(())
    }

    #[test]
    fn test_pages_until_done() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let rows = FakeRows::new();
        let exporter = TableDumpExporter::new(&rows, temp_dir.path().join("dump.sql"), 2);
        let manifest = manifest();

        let mut offset = 0;
        let mut pages = 0;
        while let PageOutcome::Next(next) = exporter.export_page(&manifest, "wp_users", offset)? {
            offset = next;
            pages += 1;
        }
        assert_eq!(pages, 3);
        assert_eq!(offset, 6);

        let sql = std::fs::read_to_string(exporter.dump_path())?;
        assert_eq!(sql.matches("DROP TABLE IF EXISTS `wp_users`;").count(), 1);
        assert_eq!(sql.matches("INSERT INTO `wp_users`").count(), 3);
        assert!(sql.starts_with("-- Table wp_users\n-- CAMBRIAN[[/users/wp_users/]]\nDROP TABLE IF EXISTS `wp_users`;\n"));
        assert!(sql.contains("CREATE TABLE wp_users (id, login);\n"));
        assert!(sql.contains("INSERT INTO `wp_users`\n  (`id`, `login`)\nVALUES\n  ('0', 'user0'),\n  ('1', 'user1');\n"));
        assert!(sql.contains("('4', 'user4');"));
        Ok(())
    }

    #[test]
    fn test_literals_use_source_escaping() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let rows = FakeRows::new();
        let exporter = TableDumpExporter::new(&rows, temp_dir.path().join("dump.sql"), 2);

        assert_eq!(exporter.literal(&RowValue::Null), "NULL");
        assert_eq!(exporter.literal(&RowValue::Text("it's".to_string())), "'it\\'s'");
        assert_eq!(exporter.literal(&RowValue::Blob(vec![0xde, 0xad])), "X'dead'");
        Ok(())
    }
}
