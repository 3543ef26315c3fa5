//! Worker IPC protocol for graphproc
//!
//! Interpreted procedures run in worker processes. Each worker is driven
//! through two one-directional message queues:
//!
//! - **request queue** (host → worker): [`TaskInput`] messages
//! - **response queue** (worker → host): [`TaskOutput`] messages
//!
//! Every message is framed by [`frame`] and carries a MessagePack payload.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod queue;
pub mod task;

pub use error::{WireError, WireResult};
pub use frame::{read_message, write_message, write_message_chunked, MAX_MESSAGE_SIZE};
pub use queue::{QueueReader, QueueWriter};
pub use task::{TaskInput, TaskOutput, TaskStatus, LOAD_MODULE_FUNCTION};
