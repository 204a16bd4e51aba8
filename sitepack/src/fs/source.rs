//! Filesystem access capability.
//!
//! The phase driver never touches the site's files directly: it enumerates,
//! reads and writes through a [`FileSource`]. Hosts that need credentials or
//! a chrooted view provide their own implementation; [`LocalFileSource`]
//! covers plain local access.

use super::walker::{walk_directory, WalkOptions};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub trait FileSource: Send + Sync {
    /// Every file and directory below `root`, parents before children
    fn enumerate(&self, root: &Path) -> Result<Vec<PathBuf>>;

    fn is_dir(&self, path: &Path) -> Result<bool>;

    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Create `dest` and any missing parents
    fn create_dir(&self, dest: &Path) -> Result<()>;

    /// Write `contents` to `dest`, creating parents as needed
    fn write(&self, dest: &Path, contents: &[u8]) -> Result<()>;
}

/// Direct access to the local filesystem
#[derive(Debug, Clone, Default)]
pub struct LocalFileSource {
    walk: WalkOptions,
}

impl LocalFileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_walk_options(walk: WalkOptions) -> Self {
        Self { walk }
    }
}

impl FileSource for LocalFileSource {
    fn enumerate(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let found = walk_directory(root, self.walk.clone())?;
        Ok(found.into_iter().map(|f| f.path).collect())
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        Ok(fs::metadata(path)?.is_dir())
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    fn create_dir(&self, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)?;
        Ok(())
    }

    fn write(&self, dest: &Path, contents: &[u8]) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, contents)?;
        Ok(())
    }
}

/// Mapping from the site's own view of its base directory to the base
/// directory the file source actually exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChrootMap {
    pub base_dir: PathBuf,
    pub chroot_base_dir: PathBuf,
}

impl ChrootMap {
    pub fn new(base_dir: impl Into<PathBuf>, chroot_base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            chroot_base_dir: chroot_base_dir.into(),
        }
    }

    /// A mapping that leaves every path untouched
    pub fn identity(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            chroot_base_dir: base_dir.clone(),
            base_dir,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.base_dir == self.chroot_base_dir
    }

    /// Translate a site path into the file source's view
    pub fn apply(&self, path: &Path) -> PathBuf {
        if self.is_identity() {
            return path.to_path_buf();
        }
        match path.strip_prefix(&self.base_dir) {
            Ok(rest) => self.chroot_base_dir.join(rest),
            Err(_) => path.to_path_buf(),
        }
    }
}
