//! Procedure engine for graphproc
//!
//! This crate orchestrates the lower layers:
//! - ProcedureManager: facade dispatching on language
//! - SingleLanguageManager: name map, two-phase loads, startup recovery
//! - Builder + toolchain: turning supplied code into loadable artifacts
//! - Backends: in-process shared libraries (native) and interpreter worker
//!   processes (interpreted)
//! - TaskTracker: cross-thread cancellation of running calls
//!
//! The engine is the only component that knows about:
//! - Artifact files on disk and their staging
//! - Which backend serves which registry table
//! - Worker process lifecycles

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod compile;
pub mod config;
pub mod facade;
pub mod manager;
pub mod native;
pub mod toolchain;
pub mod tracker;
pub mod worker;

pub use backend::{BackendCall, LoadedProcedure, ProcedureBackend};
pub use compile::{BuiltArtifact, Builder};
pub use config::{
    InterpretedConfig, LanguageConfig, ProcedureConfig, ToolchainConfig, CONFIG_FILE_NAME,
};
pub use facade::{ProcedureManager, REGISTRY_IMAGE_FILE, TASK_RUNNER_PROGRAM};
pub use manager::{LoadRequest, SingleLanguageManager, COMPILED_CODE_TYPE};
pub use native::NativeBackend;
pub use toolchain::{ToolOutput, ToolchainError};
pub use tracker::{TaskGuard, TaskId, TaskInfo, TaskTracker};
pub use worker::{InterpretedBackend, PoolConfig, PoolStats, WorkerPool};
