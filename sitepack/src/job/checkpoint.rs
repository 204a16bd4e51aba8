//! Persisted job progress.
//!
//! The checkpoint is the only state carried from one invocation to the next.
//! It is rewritten (atomically) after every batch, so a resumed job picks up
//! exactly where the last persisted batch left off.

use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_VERSION: u32 = 1;

/// Job phases, in the only order they can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Files,
    Tables,
    Archive,
    Complete,
}

impl Phase {
    pub fn next(self) -> Self {
        match self {
            Phase::Files => Phase::Tables,
            Phase::Tables => Phase::Archive,
            Phase::Archive | Phase::Complete => Phase::Complete,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Files => "files",
            Phase::Tables => "tables",
            Phase::Archive => "archive",
            Phase::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// How far the in-progress archive has been durably written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveCursor {
    /// Length of the archive file covered by committed entries
    pub offset: u64,
    /// Length of the central-directory sidecar covered by committed entries
    pub central_len: u64,
    /// Committed entry count
    pub entries: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupState {
    pub version: u32,
    pub phase: Phase,
    /// Absolute source paths still to copy
    pub pending_files: VecDeque<PathBuf>,
    /// Table name to next row offset
    pub pending_tables: BTreeMap<String, u64>,
    /// Length of the SQL dump covered by committed table pages
    #[serde(default)]
    pub dump_len: u64,
    /// Working-tree paths still to archive; `None` until the archive phase
    /// has scanned the working tree
    pub pending_archive_items: Option<VecDeque<PathBuf>>,
    pub archive: ArchiveCursor,
}

impl BackupState {
    pub fn new(files: impl IntoIterator<Item = PathBuf>, tables: impl IntoIterator<Item = String>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            phase: Phase::Files,
            pending_files: files.into_iter().collect(),
            pending_tables: tables.into_iter().map(|t| (t, 0)).collect(),
            dump_len: 0,
            pending_archive_items: None,
            archive: ArchiveCursor::default(),
        }
    }

    /// Load the checkpoint at `path`; `Ok(None)` if there is none.
    ///
    /// A checkpoint that exists but cannot be decoded, or that decodes to an
    /// impossible state, is reported as [`BackupError::UnrecoverableCheckpoint`].
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let unrecoverable = |reason: String| BackupError::UnrecoverableCheckpoint {
            path: path.to_path_buf(),
            reason,
        };

        let state: BackupState = serde_json::from_slice(&content).map_err(|e| unrecoverable(e.to_string()))?;
        state.validate().map_err(unrecoverable)?;
        Ok(Some(state))
    }

    /// Write atomically (temporary file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.version != CHECKPOINT_VERSION {
            return Err(format!("unsupported checkpoint version {}", self.version));
        }
        match self.phase {
            Phase::Files => {}
            Phase::Tables if !self.pending_files.is_empty() => {
                return Err("files still pending after the files phase".to_string());
            }
            Phase::Archive if !self.pending_files.is_empty() || !self.pending_tables.is_empty() => {
                return Err("files or tables still pending in the archive phase".to_string());
            }
            Phase::Complete if !self.is_drained() => {
                return Err("work still pending in a completed job".to_string());
            }
            _ => {}
        }
        if self.phase == Phase::Files && self.dump_len != 0 {
            return Err("table dump recorded during the files phase".to_string());
        }
        if self.phase < Phase::Archive && (self.pending_archive_items.is_some() || self.archive != ArchiveCursor::default()) {
            return Err(format!("archive progress recorded during the {} phase", self.phase));
        }
        Ok(())
    }

    fn is_drained(&self) -> bool {
        self.pending_files.is_empty()
            && self.pending_tables.is_empty()
            && self.pending_archive_items.as_ref().map_or(true, VecDeque::is_empty)
    }

    /// Items left in the current phase's queue
    pub fn remaining(&self) -> usize {
        match self.phase {
            Phase::Files => self.pending_files.len(),
            Phase::Tables => self.pending_tables.len(),
            Phase::Archive => self.pending_archive_items.as_ref().map_or(0, VecDeque::len),
            Phase::Complete => 0,
        }
    }
}
