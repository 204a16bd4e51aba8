//! Database dump: table classification, the row source capability and the
//! paged SQL exporter.

pub mod exporter;
pub mod row_source;

pub use exporter::{PageOutcome, TableDumpExporter, DEFAULT_PAGE_SIZE};
pub use row_source::{RowPage, RowSource, RowValue, SqliteRowSource, TableInfo};

use serde::{Deserialize, Serialize};

/// Ownership of a table relative to the tenant being backed up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableClass {
    /// Belongs to this tenant
    Tenant,
    /// Shared by every tenant of the installation
    Global,
    /// Belongs to a different tenant
    OtherTenant,
}

#[derive(Debug, Clone, Default)]
pub struct TableClassifier {
    prefix: String,
    global_tables: Vec<String>,
}

impl TableClassifier {
    pub fn new(prefix: &str, global_tables: Vec<String>) -> Self {
        Self {
            prefix: prefix.to_string(),
            global_tables,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn classify(&self, table: &str) -> TableClass {
        if self.global_tables.iter().any(|g| g == table) {
            TableClass::Global
        } else if table.starts_with(&self.prefix) {
            TableClass::Tenant
        } else {
            TableClass::OtherTenant
        }
    }
}
