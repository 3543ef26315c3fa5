//! Out-of-process execution of interpreted procedures
//!
//! - [`process`]: one worker child process and its task protocol
//! - [`pool`]: checkout, reuse, and retirement of workers
//! - [`backend`]: the [`crate::backend::ProcedureBackend`] built on the pool

pub mod backend;
pub mod pool;
pub mod process;

pub use backend::InterpretedBackend;
pub use pool::{PoolConfig, PoolStats, WorkerPool};
pub use process::{Worker, WorkerState, NO_DEADLINE};
