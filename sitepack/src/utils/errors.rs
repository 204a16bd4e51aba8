//! Error types for the backup engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// The archive is structurally unreadable (no EOCD, truncated record, ...)
    /// or would exceed what a ZIP32 archive can describe.
    #[error("Archive format error: {0}")]
    ArchiveFormat(String),

    #[error("Archive has been closed, entries can no longer be added")]
    ArchiveClosed,

    #[error("Archive is not open for reading")]
    ArchiveNotOpen,

    #[error("Unrecoverable checkpoint {}: {reason}", path.display())]
    UnrecoverableCheckpoint { path: PathBuf, reason: String },

    #[error("Invalid job ID: {0}")]
    InvalidJobId(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {0} has not completed yet")]
    NotComplete(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl From<config::ConfigError> for BackupError {
    fn from(err: config::ConfigError) -> Self {
        BackupError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for BackupError {
    fn from(err: toml::de::Error) -> Self {
        BackupError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
