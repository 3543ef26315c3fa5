//! Procedure metadata and call types

use crate::error::ProcedureError;
use crate::signature::SigSpec;
use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Execution model of a procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    /// In-process dynamic library
    Native,
    /// Out-of-process interpreter worker
    Interpreted,
}

impl Language {
    /// Lowercase label used in logs and descriptors
    pub fn as_str(self) -> &'static str {
        match self {
            Language::Native => "native",
            Language::Interpreted => "interpreted",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calling-convention generation of a procedure
///
/// - `V1`: one opaque input, opaque byte output
/// - `V2`: runs inside a caller-supplied transaction and returns a
///   [`StructuredResult`](crate::StructuredResult)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiVersion {
    /// Single opaque call
    V1,
    /// Transaction-scoped call with structured result
    V2,
}

impl ApiVersion {
    /// Wire label (`"v1"` / `"v2"`)
    pub fn as_str(self) -> &'static str {
        match self {
            ApiVersion::V1 => "v1",
            ApiVersion::V2 => "v2",
        }
    }
}

impl FromStr for ApiVersion {
    type Err = ProcedureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1" | "V1" => Ok(ApiVersion::V1),
            "v2" | "V2" => Ok(ApiVersion::V2),
            other => Err(ProcedureError::InvalidVersion(other.to_string())),
        }
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Form in which procedure code is supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeKind {
    /// Ready-to-load artifact (compiled library, or interpreter module)
    So,
    /// Single interpreted source, transpiled and compiled for native use
    Py,
    /// One or more C++ source files
    Cpp,
    /// Archive carrying a buildable source tree
    Zip,
}

impl CodeKind {
    /// Lowercase label
    pub fn as_str(self) -> &'static str {
        match self {
            CodeKind::So => "so",
            CodeKind::Py => "py",
            CodeKind::Cpp => "cpp",
            CodeKind::Zip => "zip",
        }
    }
}

impl FromStr for CodeKind {
    type Err = ProcedureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "so" => Ok(CodeKind::So),
            "py" => Ok(CodeKind::Py),
            "cpp" => Ok(CodeKind::Cpp),
            "zip" => Ok(CodeKind::Zip),
            other => Err(ProcedureError::input(format!("Unknown code type [{}].", other))),
        }
    }
}

impl fmt::Display for CodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted description of a loaded procedure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureMetadata {
    /// User-facing name
    pub name: String,
    /// Free-text description
    pub description: String,
    /// Whether the procedure only reads the graph
    pub read_only: bool,
    /// Execution model
    pub language: Language,
    /// Calling convention
    pub version: ApiVersion,
    /// Declared signature, absent for legacy artifacts
    pub signature: Option<SigSpec>,
    /// Build identifier the compiled artifact was produced under
    pub content_hash: String,
}

/// Listing entry returned by `list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureDescriptor {
    /// User-facing name
    pub name: String,
    /// Free-text description
    pub description: String,
    /// Whether the procedure only reads the graph
    pub read_only: bool,
    /// Execution model
    pub language: Language,
    /// Calling convention
    pub version: ApiVersion,
    /// Signature JSON, or empty when undeclared
    pub signature: String,
    /// Stored code form (`zip`, `cpp`, `py`, or `so_or_py`)
    pub code_type: String,
}

/// Stored code returned by `get_code`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureCode {
    /// User-facing name
    pub name: String,
    /// Free-text description
    pub description: String,
    /// Whether the procedure only reads the graph
    pub read_only: bool,
    /// Raw bytes as supplied at load time
    pub code: Vec<u8>,
    /// Stored code form (`zip`, `cpp`, `py`, or `so_or_py`)
    pub code_type: String,
}

/// Opaque handle to a graph database or transaction owned by the host
///
/// The subsystem never dereferences it; it is forwarded unchanged to native
/// entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphHandle(*mut c_void);

// The handle is only forwarded to native procedures, which are responsible
// for any synchronization on the object it points to.
unsafe impl Send for GraphHandle {}
unsafe impl Sync for GraphHandle {}

impl GraphHandle {
    /// Handle carrying no object
    pub const fn null() -> Self {
        GraphHandle(std::ptr::null_mut())
    }

    /// Wrap a host pointer
    pub fn from_raw(ptr: *mut c_void) -> Self {
        GraphHandle(ptr)
    }

    /// The wrapped pointer
    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }

    /// Whether the handle is null
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl Default for GraphHandle {
    fn default() -> Self {
        GraphHandle::null()
    }
}

/// Who is calling and against what
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    /// Calling user
    pub user: &'a str,
    /// Database handle passed to V1 native procedures
    pub db: GraphHandle,
    /// Transaction handle passed to V2 native procedures
    pub txn: Option<GraphHandle>,
}

impl<'a> CallContext<'a> {
    /// Context with no database or transaction handle
    pub fn new(user: &'a str) -> Self {
        CallContext {
            user,
            db: GraphHandle::null(),
            txn: None,
        }
    }

    /// Attach a database handle
    pub fn with_db(mut self, db: GraphHandle) -> Self {
        self.db = db;
        self
    }

    /// Attach a transaction handle
    pub fn with_txn(mut self, txn: GraphHandle) -> Self {
        self.txn = Some(txn);
        self
    }
}

/// Per-call execution options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallOptions {
    /// Deadline for interpreted calls; `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl CallOptions {
    /// Options with a deadline
    pub fn with_timeout(timeout: Duration) -> Self {
        CallOptions {
            timeout: Some(timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        assert_eq!("v1".parse::<ApiVersion>().unwrap(), ApiVersion::V1);
        assert_eq!("V2".parse::<ApiVersion>().unwrap(), ApiVersion::V2);
        assert_eq!(
            "v3".parse::<ApiVersion>().unwrap_err(),
            ProcedureError::InvalidVersion("v3".into())
        );
    }

    #[test]
    fn test_code_kind_parse() {
        for kind in [CodeKind::So, CodeKind::Py, CodeKind::Cpp, CodeKind::Zip] {
            assert_eq!(kind.as_str().parse::<CodeKind>().unwrap(), kind);
        }
        assert!("jar".parse::<CodeKind>().is_err());
    }

    #[test]
    fn test_null_handle() {
        assert!(GraphHandle::null().is_null());
        assert!(GraphHandle::default().is_null());
        let mut value = 7u32;
        let handle = GraphHandle::from_raw(&mut value as *mut u32 as *mut c_void);
        assert!(!handle.is_null());
    }

    #[test]
    fn test_call_context_builders() {
        let ctx = CallContext::new("admin").with_txn(GraphHandle::null());
        assert_eq!(ctx.user, "admin");
        assert!(ctx.txn.is_some());
        assert!(ctx.db.is_null());
    }

    #[test]
    fn test_call_options_default_has_no_deadline() {
        assert_eq!(CallOptions::default().timeout, None);
        assert_eq!(
            CallOptions::with_timeout(Duration::from_millis(500)).timeout,
            Some(Duration::from_millis(500))
        );
    }
}
