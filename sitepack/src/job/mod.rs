//! Backup jobs: identity, persisted state and the phase driver.

pub mod checkpoint;
pub mod context;
pub mod log;
pub mod machine;
pub mod manifest;

pub use checkpoint::{ArchiveCursor, BackupState, Phase};
pub use context::{JobContext, JobId, JobPaths};
pub use log::JobLog;
pub use machine::{BackupMachine, BatchLimits, MachineSettings, TickReport};
pub use manifest::Manifest;
