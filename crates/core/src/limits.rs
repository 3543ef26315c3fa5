//! Size limits shared across crates

/// Procedure names must be strictly shorter than this many bytes.
pub const MAX_PROCEDURE_NAME_LENGTH: usize = 64;

/// Largest chunk written to a worker queue in one piece.
///
/// Messages larger than this are split into several chunks, each carrying
/// its own length prefix.
pub const MAX_WIRE_CHUNK: usize = 1 << 20;

/// Cap on the output a worker returns for one task.
///
/// Output beyond this many bytes is truncated by the task runner, which logs
/// the truncation. Callers of interpreted procedures must not rely on
/// receiving more than this.
pub const MAX_TASK_OUTPUT: usize = 64 << 20;
