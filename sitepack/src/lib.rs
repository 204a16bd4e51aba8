//! sitepack
//!
//! Resumable site and database backup into a single ZIP archive. Work is
//! split into short batches and checkpointed, so a job can be driven by many
//! short-lived invocations.

pub mod api;
pub mod archive;
pub mod config;
pub mod dump;
pub mod fs;
pub mod job;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{BackupError, Result};
