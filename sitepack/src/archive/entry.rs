//! Archive entry metadata.
//!
//! Paths are stored normalized: forward slashes, no leading slash, and
//! `.`/`..` segments resolved away.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default permission bits for regular files.
pub const DEFAULT_FILE_MODE: u32 = 0o664;

/// Default permission bits for directories.
pub const DEFAULT_DIR_MODE: u32 = 0o775;

/// One file or directory as it is (or will be) recorded in an archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    path: String,

    /// Uncompressed size in bytes
    pub size: u64,

    /// Size as stored in the archive
    pub compressed_size: u64,

    /// Last modification time (2 second resolution once archived)
    pub modified: DateTime<Utc>,

    /// Unix permission bits
    pub mode: u32,

    pub owner: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,

    is_dir: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

impl ArchiveEntry {
    /// Create a file entry for `path`, modified now
    pub fn new(path: &str) -> Self {
        Self {
            path: normalize_path(path),
            size: 0,
            compressed_size: 0,
            modified: Utc::now(),
            mode: DEFAULT_FILE_MODE,
            owner: String::new(),
            group: String::new(),
            uid: 0,
            gid: 0,
            is_dir: false,
            comment: String::new(),
        }
    }

    /// Create a directory entry for `path`
    pub fn directory(path: &str) -> Self {
        let mut entry = Self::new(path);
        entry.set_dir(true);
        entry
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: &str) {
        self.path = normalize_path(path);
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Mark the entry as a directory. A directory still carrying the file
    /// default mode switches to the directory default.
    pub fn set_dir(&mut self, is_dir: bool) {
        if is_dir && self.mode == DEFAULT_FILE_MODE {
            self.mode = DEFAULT_DIR_MODE;
        }
        self.is_dir = is_dir;
    }

    /// Apply a strip rule to the entry path
    pub fn strip(&mut self, rule: &Strip) {
        match rule {
            Strip::None => {}
            Strip::Components(count) => {
                let mut parts: Vec<&str> = self.path.split('/').collect();
                // the file name itself always survives
                let base = if self.is_dir { None } else { parts.pop() };
                let mut stripped = parts
                    .iter()
                    .skip(*count)
                    .copied()
                    .collect::<Vec<_>>()
                    .join("/");
                if let Some(base) = base {
                    stripped.push('/');
                    stripped.push_str(base);
                }
                self.set_path(&stripped);
            }
            Strip::Prefix(prefix) => {
                if let Some(rest) = self.path.strip_prefix(prefix.as_str()) {
                    let rest = rest.to_string();
                    self.set_path(&rest);
                }
            }
        }
    }

    /// Does the entry path pass the include/exclude filters?
    ///
    /// Exclusion wins over inclusion.
    pub fn matches(&self, include: Option<&Regex>, exclude: Option<&Regex>) -> bool {
        if let Some(include) = include {
            if !include.is_match(&self.path) {
                return false;
            }
        }
        if let Some(exclude) = exclude {
            if exclude.is_match(&self.path) {
                return false;
            }
        }
        true
    }
}

/// How to shorten entry paths during extraction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Strip {
    #[default]
    None,

    /// Drop this many leading path segments, keeping the file name
    Components(usize),

    /// Remove a literal prefix when present
    Prefix(String),
}

/// Normalize a path for storage in an archive
pub fn normalize_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}
