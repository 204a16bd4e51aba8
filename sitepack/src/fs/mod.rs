//! File system access: traversal, metadata capture and the file source seam.

pub mod append;
pub mod metadata;
pub mod source;
pub mod walker;

pub use append::append_locked;
pub use source::{ChrootMap, FileSource, LocalFileSource};
