//! Job-scoped manifest.
//!
//! A JSON object describing the environment a job was started in. Writes
//! are additive: new keys merge into the stored document (recursively for
//! nested objects) instead of replacing it.

use crate::dump::TableClass;
use crate::fs::ChrootMap;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const SOURCE_ROOT: &str = "source_root";
pub const CHROOT: &str = "chroot";
pub const TABLE_PREFIX: &str = "table_prefix";
pub const TABLES: &str = "tables";
pub const INACTIVE: &str = "inactive";
pub const TIMESTAMPS: &str = "timestamps";

/// Facts captured once when a job starts
#[derive(Debug, Clone, Serialize)]
pub struct JobFacts {
    pub job_id: String,
    pub tool_version: String,
    pub host: String,
    pub db_version: String,
    pub source_root: PathBuf,
    pub chroot: ChrootMap,
    pub table_prefix: String,
    pub tables: BTreeMap<String, TableClass>,
    pub inactive: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    doc: Map<String, Value>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a manifest file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        let doc: Map<String, Value> = serde_json::from_slice(&content)?;
        Ok(Self { doc })
    }

    /// Merge `patch` into the stored manifest at `path` (created if absent)
    pub fn update(path: &Path, patch: &impl Serialize) -> Result<Self> {
        let mut manifest = if path.exists() { Self::load(path)? } else { Self::new() };
        manifest.merge(patch)?;
        manifest.save(path)?;
        Ok(manifest)
    }

    /// Merge the keys of `patch`, which must serialize to a JSON object
    pub fn merge(&mut self, patch: &impl Serialize) -> Result<()> {
        match serde_json::to_value(patch)? {
            Value::Object(map) => {
                merge_objects(&mut self.doc, map);
                Ok(())
            }
            other => Err(crate::BackupError::Config(format!(
                "manifest patch must be an object, got {other}"
            ))),
        }
    }

    /// Write atomically (temporary file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.doc)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn as_json(&self) -> &Map<String, Value> {
        &self.doc
    }

    /// Typed view of one key; `None` when absent or of another shape
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.doc
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn source_root(&self) -> Option<PathBuf> {
        self.get(SOURCE_ROOT)
    }

    pub fn chroot(&self) -> Option<ChrootMap> {
        self.get(CHROOT)
    }

    pub fn table_prefix(&self) -> String {
        self.get(TABLE_PREFIX).unwrap_or_default()
    }

    pub fn table_class(&self, table: &str) -> Option<TableClass> {
        self.doc
            .get(TABLES)
            .and_then(|tables| tables.get(table))
            .and_then(|class| serde_json::from_value(class.clone()).ok())
    }

    /// Working-tree relative paths of trees that are not archived
    pub fn inactive(&self) -> Vec<String> {
        self.get(INACTIVE).unwrap_or_default()
    }
}

fn merge_objects(dst: &mut Map<String, Value>, src: Map<String, Value>) {
    for (key, value) in src {
        match value {
            Value::Object(incoming) => {
                if let Some(Value::Object(existing)) = dst.get_mut(&key) {
                    merge_objects(existing, incoming);
                } else {
                    dst.insert(key, Value::Object(incoming));
                }
            }
            value => {
                dst.insert(key, value);
            }
        }
    }
}
