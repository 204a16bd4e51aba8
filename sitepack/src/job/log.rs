//! Human-readable job progress log.

use crate::fs::append_locked;
use crate::Result;
use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};

/// Append-only log, one timestamped line per event
#[derive(Debug, Clone)]
pub struct JobLog {
    path: PathBuf,
}

impl JobLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &str) -> Result<()> {
        let line = format!(
            "{} {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            message.replace('\n', " ")
        );
        append_locked(&self.path, line.as_bytes())?;
        Ok(())
    }

    /// Logged messages without their timestamps
    pub fn messages(&self) -> Result<Vec<String>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .map(|line| line.split_once(' ').map_or(line, |(_, msg)| msg).to_string())
            .collect())
    }
}
