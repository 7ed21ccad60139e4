//! Content-addressed artifact storage and snapshot persistence
//!
//! Each cache owns one directory containing a `snapshot.json` metadata file
//! and zero or more content-addressed artifact files. Metadata is written via
//! create-temp-then-atomic-rename, so a crash between an artifact write and
//! the metadata write always leaves the previous good snapshot intact.

pub mod artifact;
pub mod snapshot;

pub use artifact::{hash_file, Artifact};
pub use snapshot::Snapshot;
