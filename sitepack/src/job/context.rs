//! Job identity and the files a job owns.

use crate::{BackupError, Result};
use std::fmt;
use std::path::{Path, PathBuf};

/// Opaque job identifier. Used verbatim in file names, so it is restricted
/// to ASCII letters, digits, `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn parse(raw: &str) -> Result<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= 128
            && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(BackupError::InvalidJobId(raw.to_string()))
        }
    }

    /// A fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Locations of every file owned by one job
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub work_dir: PathBuf,
    pub checkpoint: PathBuf,
    pub manifest: PathBuf,
    pub log: PathBuf,
    pub archive_part: PathBuf,
    pub archive: PathBuf,
    pub central_sidecar: PathBuf,
}

impl JobPaths {
    pub fn new(data_dir: &Path, id: &JobId) -> Self {
        let file = |suffix: &str| data_dir.join(format!("{id}.{suffix}"));
        Self {
            work_dir: data_dir.join(id.as_str()),
            checkpoint: file("checkpoint.json"),
            manifest: file("manifest.json"),
            log: file("log"),
            archive_part: file("zip.part"),
            archive: file("zip"),
            central_sidecar: file("zip.cdir"),
        }
    }

    /// SQL dump inside the working tree
    pub fn dump(&self) -> PathBuf {
        self.work_dir.join(DUMP_FILE_NAME)
    }

    /// Manifest snapshot shipped inside the archive
    pub fn manifest_snapshot(&self) -> PathBuf {
        self.work_dir.join(MANIFEST_SNAPSHOT_NAME)
    }

    /// Job-scoped files, excluding the working tree
    pub fn files(&self) -> [&Path; 6] {
        [
            &self.checkpoint,
            &self.manifest,
            &self.log,
            &self.archive_part,
            &self.archive,
            &self.central_sidecar,
        ]
    }
}

pub const DUMP_FILE_NAME: &str = "database.sql";
pub const MANIFEST_SNAPSHOT_NAME: &str = "backup-manifest.json";

/// Everything an operation needs to know about the job it acts on
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    pub paths: JobPaths,
}

impl JobContext {
    pub fn new(data_dir: &Path, id: JobId) -> Self {
        let paths = JobPaths::new(data_dir, &id);
        Self { id, paths }
    }
}
