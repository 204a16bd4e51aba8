//! Directory traversal.
//!
//! Produces every file and directory below a root, parents before their
//! children, siblings in file-name order so repeated walks of the same tree
//! agree.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// Report directories as well as files
    pub include_dirs: bool,

    /// Entries whose file name contains one of these are skipped with their subtree
    pub exclude_patterns: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
            include_dirs: true,
            exclude_patterns: Vec::new(),
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Is this a directory?
    pub is_dir: bool,

    /// Is this a symlink?
    pub is_symlink: bool,

    /// File depth from root
    pub depth: usize,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// For symlinks, resolves to the target to get the real file size.
    /// Returns None if the symlink target is a directory or cannot be resolved.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let raw_metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root)
            .unwrap_or(&path)
            .to_path_buf();
        let is_symlink = raw_metadata.is_symlink();

        let (size, is_dir) = if is_symlink {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_dir() => return Ok(None),
                Ok(resolved) => (resolved.len(), false),
                // broken symlink
                Err(_) => return Ok(None),
            }
        } else {
            (raw_metadata.len(), raw_metadata.is_dir())
        };

        Ok(Some(Self {
            path,
            relative_path,
            size,
            is_dir,
            is_symlink,
            depth: entry.depth(),
        }))
    }
}

/// Walk a directory tree and collect everything below `root` (not `root` itself)
///
/// # Example
/// ```no_run
/// use sitepack::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let files = walk_directory(Path::new("/var/www/wp-content"), WalkOptions::default()).unwrap();
/// println!("Found {} entries", files.len());
/// ```
pub fn walk_directory(root: &Path, options: WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .min_depth(1)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let patterns = options.exclude_patterns;
    for entry in walker.into_iter().filter_entry(|e| !should_exclude(e, &patterns)) {
        let entry = entry?;

        if entry.file_type().is_dir() && !options.include_dirs {
            continue;
        }

        if let Some(file_info) = FileInfo::from_entry(&entry, root)? {
            files.push(file_info);
        }
    }

    Ok(files)
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}
