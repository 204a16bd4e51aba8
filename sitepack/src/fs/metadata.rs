//! File metadata capture for archive entries.
//!
//! Ownership and permissions are best-effort: anything the platform cannot
//! report keeps the entry defaults.

use crate::archive::ArchiveEntry;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;

/// Build an archive entry named `name` from the file or directory at `path`
pub fn entry_from_path(path: &Path, name: &str) -> std::io::Result<ArchiveEntry> {
    let metadata = fs::metadata(path)?;

    let mut entry = ArchiveEntry::new(name);
    entry.size = if metadata.is_dir() { 0 } else { metadata.len() };
    entry.modified = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        entry.mode = metadata.mode() & 0o7777;
        entry.uid = metadata.uid();
        entry.gid = metadata.gid();
        entry.owner = owner_name(entry.uid).unwrap_or_default();
        entry.group = group_name(entry.gid).unwrap_or_default();
    }

    entry.set_dir(metadata.is_dir());
    Ok(entry)
}

#[cfg(unix)]
fn owner_name(uid: u32) -> Option<String> {
    use nix::unistd::{Uid, User};
    User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|u| u.name)
}

#[cfg(unix)]
fn group_name(gid: u32) -> Option<String> {
    use nix::unistd::{Gid, Group};
    Group::from_gid(Gid::from_raw(gid)).ok().flatten().map(|g| g.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_entry_from_file() -> std::io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let entry = entry_from_path(temp_file.path(), "./docs/../notes.txt")?;

        assert_eq!(entry.path(), "notes.txt");
        assert_eq!(entry.size, 12);
        assert!(!entry.is_dir());
        assert!(entry.modified.timestamp() > 0);

        Ok(())
    }

    #[test]
    fn test_entry_from_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let entry = entry_from_path(temp_dir.path(), "uploads")?;
        assert!(entry.is_dir());
        assert_eq!(entry.size, 0);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_permissions_preservation() -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp_file = NamedTempFile::new()?;
        fs::set_permissions(temp_file.path(), fs::Permissions::from_mode(0o640))?;

        let entry = entry_from_path(temp_file.path(), "secret.txt")?;
        assert_eq!(entry.mode, 0o640);

        Ok(())
    }
}
