//! ZIP archive codec.
//!
//! A self-contained reader/writer: the writer builds the backup archive one
//! batch at a time, the reader lists and extracts third-party archives.

pub mod dos_time;
pub mod entry;
pub mod format;
pub mod reader;
pub mod writer;

pub use entry::{normalize_path, ArchiveEntry, Strip};
pub use reader::{ExtractOptions, ZipReader};
pub use writer::ZipWriter;
