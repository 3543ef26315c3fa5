//! Error types for procedure management
//!
//! Every public operation of the subsystem returns either a typed success
//! value or a [`ProcedureError`]. Diagnostics (compiler output, worker stderr,
//! procedure output) are carried verbatim in the message.
//!
//! ## Error kinds
//!
//! | Variant | Meaning |
//! |---------|---------|
//! | `InvalidName` | name fails the character policy |
//! | `InvalidVersion` | unknown calling-convention version |
//! | `Input` | staging/compilation failure, or the procedure returned `false` |
//! | `Load` | native entry points could not be resolved |
//! | `Timeout` | toolchain or worker exceeded its deadline (process killed) |
//! | `Cancelled` | the calling task was asked to stop (worker killed) |
//! | `Internal` | crash, storage failure, or fatal startup condition |
//! | `NotFound` | lookup of a name that does not exist |
//!
//! A missed lookup in `call` is *not* an error; it is reported as `Ok(None)`.

use thiserror::Error;

/// Result type alias for procedure operations
pub type ProcedureResult<T> = std::result::Result<T, ProcedureError>;

/// Error taxonomy for the stored-procedure subsystem
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcedureError {
    /// Name fails the character policy
    #[error("Invalid procedure name [{0}].")]
    InvalidName(String),

    /// Unrecognized calling-convention version
    #[error("Invalid procedure version [{0}].")]
    InvalidVersion(String),

    /// Bad input, failed compilation, or a procedure signaling failure
    #[error("{0}")]
    Input(String),

    /// Entry-point resolution failure
    #[error("{0}")]
    Load(String),

    /// Deadline exceeded; the underlying process has been killed
    #[error("{0}")]
    Timeout(String),

    /// Task was cancelled; the underlying process has been killed
    #[error("{0}")]
    Cancelled(String),

    /// Unexpected failure
    #[error("{0}")]
    Internal(String),

    /// Name does not exist
    #[error("Procedure [{0}] does not exist.")]
    NotFound(String),
}

/// Coarse error category, for callers that only branch on the kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`ProcedureError::InvalidName`]
    InvalidName,
    /// See [`ProcedureError::InvalidVersion`]
    InvalidVersion,
    /// See [`ProcedureError::Input`]
    Input,
    /// See [`ProcedureError::Load`]
    Load,
    /// See [`ProcedureError::Timeout`]
    Timeout,
    /// See [`ProcedureError::Cancelled`]
    Cancelled,
    /// See [`ProcedureError::Internal`]
    Internal,
    /// See [`ProcedureError::NotFound`]
    NotFound,
}

impl ProcedureError {
    /// Create an input error
    pub fn input(msg: impl Into<String>) -> Self {
        ProcedureError::Input(msg.into())
    }

    /// Create a load error
    pub fn load(msg: impl Into<String>) -> Self {
        ProcedureError::Load(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        ProcedureError::Internal(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        ProcedureError::Timeout(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        ProcedureError::Cancelled(msg.into())
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcedureError::InvalidName(_) => ErrorKind::InvalidName,
            ProcedureError::InvalidVersion(_) => ErrorKind::InvalidVersion,
            ProcedureError::Input(_) => ErrorKind::Input,
            ProcedureError::Load(_) => ErrorKind::Load,
            ProcedureError::Timeout(_) => ErrorKind::Timeout,
            ProcedureError::Cancelled(_) => ErrorKind::Cancelled,
            ProcedureError::Internal(_) => ErrorKind::Internal,
            ProcedureError::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// Attach captured process output to a message.
    ///
    /// Produces the layout used for every toolchain and worker diagnostic:
    /// the message, then the stdout block, then the stderr block.
    pub fn with_output(msg: &str, stdout: &str, stderr: &str) -> String {
        format!(
            "{} \nStdout:----\n{}\nStderr:----\n{}",
            msg, stdout, stderr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(
            ProcedureError::InvalidName("x".into()).kind(),
            ErrorKind::InvalidName
        );
        assert_eq!(ProcedureError::input("x").kind(), ErrorKind::Input);
        assert_eq!(ProcedureError::load("x").kind(), ErrorKind::Load);
        assert_eq!(ProcedureError::timeout("x").kind(), ErrorKind::Timeout);
        assert_eq!(ProcedureError::cancelled("x").kind(), ErrorKind::Cancelled);
        assert_eq!(ProcedureError::internal("x").kind(), ErrorKind::Internal);
        assert_eq!(
            ProcedureError::NotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_display_carries_message_verbatim() {
        let err = ProcedureError::input("compile failed: missing ;");
        assert_eq!(err.to_string(), "compile failed: missing ;");
    }

    #[test]
    fn test_display_names() {
        let err = ProcedureError::InvalidName("bad name".into());
        assert!(err.to_string().contains("[bad name]"));

        let err = ProcedureError::NotFound("echo".into());
        assert!(err.to_string().contains("[echo]"));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_with_output_layout() {
        let msg = ProcedureError::with_output("Failed to compile", "out text", "err text");
        assert!(msg.starts_with("Failed to compile"));
        let stdout_at = msg.find("Stdout:----").unwrap();
        let stderr_at = msg.find("Stderr:----").unwrap();
        assert!(stdout_at < stderr_at);
        assert!(msg.contains("out text"));
        assert!(msg.ends_with("err text"));
    }
}
