//! Procedure name type
//!
//! Procedures are addressed by a user-facing name. In the registry each name
//! is namespaced with [`INTERNAL_NAME_PREFIX`] so that user names can never
//! collide with the artifact keys (which all begin with `@`).
//!
//! ## Validation
//!
//! Procedure names must:
//! - Be non-empty
//! - Be shorter than 64 bytes
//! - Use only ASCII letters, digits and `_` among their ASCII characters
//!
//! Non-ASCII characters are accepted as-is, so names in any script work.

use crate::error::ProcedureError;
use crate::limits::MAX_PROCEDURE_NAME_LENGTH;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix applied to every name stored in the registry
pub const INTERNAL_NAME_PREFIX: &str = "_proc_";

/// Validated, user-facing procedure name
///
/// Valid names:
/// - "echo"
/// - "page_rank_v2"
/// - "最短路径"
///
/// Invalid names:
/// - "" (empty)
/// - "has space"
/// - "dash-ed"
/// - "@so_echo"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcedureName(String);

/// Error when validating a procedure name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcedureNameError {
    /// Name is empty
    Empty,
    /// Name reaches or exceeds the maximum length
    TooLong {
        /// Length of the name in bytes
        length: usize,
    },
    /// Name contains a disallowed ASCII character
    InvalidChar {
        /// The invalid character
        char: char,
        /// Byte position of the invalid character
        position: usize,
    },
}

impl fmt::Display for ProcedureNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureNameError::Empty => write!(f, "procedure name cannot be empty"),
            ProcedureNameError::TooLong { length } => write!(
                f,
                "procedure name too long: {} bytes (must be under {})",
                length, MAX_PROCEDURE_NAME_LENGTH
            ),
            ProcedureNameError::InvalidChar { char, position } => write!(
                f,
                "invalid character '{}' at position {} (only letters, digits and underscore allowed)",
                char, position
            ),
        }
    }
}

impl std::error::Error for ProcedureNameError {}

impl ProcedureName {
    /// Create a new ProcedureName, validating the input
    pub fn new(name: impl Into<String>) -> Result<Self, ProcedureNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(ProcedureName(name))
    }

    /// Validate a procedure name
    pub fn validate(name: &str) -> Result<(), ProcedureNameError> {
        if name.is_empty() {
            return Err(ProcedureNameError::Empty);
        }
        if name.len() >= MAX_PROCEDURE_NAME_LENGTH {
            return Err(ProcedureNameError::TooLong { length: name.len() });
        }
        for (position, c) in name.char_indices() {
            if c.is_ascii() && !(c.is_ascii_alphanumeric() || c == '_') {
                return Err(ProcedureNameError::InvalidChar { char: c, position });
            }
        }
        Ok(())
    }

    /// Parse a user-supplied name, mapping failures to `InvalidName`
    pub fn parse(name: &str) -> Result<Self, ProcedureError> {
        Self::new(name).map_err(|_| ProcedureError::InvalidName(name.to_string()))
    }

    /// Rebuild a name from its registry form
    ///
    /// Returns `None` when `internal` does not carry the internal prefix.
    pub fn from_internal(internal: &str) -> Option<Self> {
        internal
            .strip_prefix(INTERNAL_NAME_PREFIX)
            .map(|n| ProcedureName(n.to_string()))
    }

    /// Registry form of the name (`_proc_<name>`)
    pub fn internal(&self) -> String {
        format!("{}{}", INTERNAL_NAME_PREFIX, self.0)
    }

    /// Name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcedureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ProcedureName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_valid_names() {
        assert!(ProcedureName::new("echo").is_ok());
        assert!(ProcedureName::new("page_rank_v2").is_ok());
        assert!(ProcedureName::new("_leading").is_ok());
        assert!(ProcedureName::new("123").is_ok());
        assert!(ProcedureName::new("最短路径").is_ok());
        assert!(ProcedureName::new("a".repeat(63)).is_ok());
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(ProcedureName::new(""), Err(ProcedureNameError::Empty));
    }

    #[test]
    fn test_length_boundary() {
        let err = ProcedureName::new("a".repeat(64)).unwrap_err();
        assert_eq!(err, ProcedureNameError::TooLong { length: 64 });
    }

    #[test]
    fn test_ascii_punctuation_rejected() {
        for bad in ["has space", "dash-ed", "dot.ted", "@so_echo", "a/b", "q?"] {
            assert!(
                matches!(
                    ProcedureName::new(bad),
                    Err(ProcedureNameError::InvalidChar { .. })
                ),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_invalid_char_position() {
        let err = ProcedureName::new("ab-c").unwrap_err();
        assert_eq!(
            err,
            ProcedureNameError::InvalidChar {
                char: '-',
                position: 2
            }
        );
    }

    #[test]
    fn test_parse_maps_to_invalid_name() {
        let err = ProcedureName::parse("no way").unwrap_err();
        assert_eq!(err, ProcedureError::InvalidName("no way".to_string()));
    }

    #[test]
    fn test_internal_round_trip() {
        let name = ProcedureName::new("echo").unwrap();
        assert_eq!(name.internal(), "_proc_echo");
        assert_eq!(ProcedureName::from_internal("_proc_echo"), Some(name));
        assert_eq!(ProcedureName::from_internal("@so__proc_echo"), None);
    }

    proptest! {
        #[test]
        fn prop_valid_names_never_look_like_artifact_keys(name in "[a-zA-Z0-9_]{1,63}") {
            let parsed = ProcedureName::new(name).unwrap();
            prop_assert!(!parsed.internal().starts_with('@'));
        }
    }
}
