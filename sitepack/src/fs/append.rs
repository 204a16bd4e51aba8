//! Exclusive appends for files that several writers may extend.

use fs2::FileExt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Append `bytes` to `path` while holding an exclusive lock on it
pub fn append_locked(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;
    let written = file.write_all(bytes).and_then(|_| file.flush());
    let unlocked = FileExt::unlock(&file);
    written?;
    unlocked
}
