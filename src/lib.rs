//! graphproc - stored procedures for graph databases
//!
//! Users register procedures as compiled libraries, sources, or archives;
//! graphproc builds them, records them in a registry table, and serves calls
//! either in-process (native) or through interpreter worker processes.
//!
//! # Quick Start
//!
//! ```ignore
//! use graphproc::{CallContext, CallOptions, CodeKind, Language, LoadRequest, ProcedureManager};
//!
//! let procs = ProcedureManager::open_dir("./my-db")?;
//! procs.load_from_code(
//!     "admin",
//!     Language::Interpreted,
//!     LoadRequest::new("degree", CodeKind::Py, source),
//! )?;
//! let out = procs.call(
//!     &CallContext::new("admin"),
//!     Language::Interpreted,
//!     "degree",
//!     b"42",
//!     &CallOptions::default(),
//! )?;
//! ```
//!
//! # Architecture
//!
//! - `graphproc-core`: names, metadata, signatures, errors
//! - `graphproc-storage`: key-value engine and the code registry
//! - `graphproc-wire`: framed queues between host and workers
//! - `graphproc-engine`: managers, toolchain, backends, worker pool
//!
//! Everything a host needs is re-exported here.

pub use graphproc_core::*;
pub use graphproc_engine::{
    InterpretedConfig, LanguageConfig, LoadRequest, PoolStats, ProcedureConfig, ProcedureManager,
    SingleLanguageManager, TaskGuard, TaskId, TaskInfo, TaskTracker, ToolchainConfig,
    CONFIG_FILE_NAME,
};
pub use graphproc_storage::{KvEngine, MemoryEngine};
