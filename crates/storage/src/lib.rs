//! Storage layer for graphproc
//!
//! This crate holds everything the procedure subsystem persists:
//! - KvEngine / KvTransaction: the transactional byte-table interface the
//!   registry runs on (single writer, many snapshot readers)
//! - MemoryEngine: reference engine, in-memory with optional file image
//! - CodeRegistry: procedure metadata and code artifacts under a fixed key scheme
//! - merge: the multi-file source bundle format

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod kv;
pub mod memory;
pub mod merge;
pub mod registry;

pub use error::{StorageError, StorageResult};
pub use kv::{KvEngine, KvTransaction};
pub use memory::MemoryEngine;
pub use merge::{merge_files, split_files, validate_file_name, SourceFile, FILE_DELIMITER};
pub use registry::{ArtifactKind, CodeRegistry};
