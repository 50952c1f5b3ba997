//! Durable checkpoint stores.
//!
//! - `file` -- all of an execution's records in one JSON file
//! - `dir` -- one JSON file per checkpoint label, in a resolvable directory

pub mod dir;
pub mod file;

pub use dir::DirCheckpointStore;
pub use file::FileCheckpointStore;
