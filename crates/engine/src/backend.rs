//! Execution backend abstraction
//!
//! A backend knows how to validate and invoke artifacts of one execution
//! model. Both models implement [`ProcedureBackend`]:
//!
//! - **Native**: shared libraries opened in-process per call
//! - **Interpreted**: modules run by out-of-process workers
//!
//! # Architecture
//!
//! ```text
//! Manager (owns registry + name map)
//!   ├── load:   stage artifact → Backend::load → commit → insert
//!   ├── call:   clone metadata → Backend::call / call_v2
//!   └── delete: commit → remove entry → Backend::unload
//! ```
//!
//! Backends never touch the registry and are never invoked while the
//! manager's name-map lock is held.

use graphproc_core::{
    ApiVersion, CallContext, CallOptions, Language, ProcedureMetadata, ProcedureResult, SigSpec,
    StructuredResult,
};
use std::path::Path;

/// Outcome of validating an artifact
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedProcedure {
    /// Signature the artifact declared, if any
    pub signature: Option<SigSpec>,
}

/// Everything a backend needs to run one call
#[derive(Debug, Clone, Copy)]
pub struct BackendCall<'a> {
    /// Caller identity and host handles
    pub ctx: &'a CallContext<'a>,
    /// Internal (prefixed) procedure name
    pub internal_name: &'a str,
    /// Installed artifact
    pub artifact: &'a Path,
    /// Metadata copied out of the manager's map
    pub meta: &'a ProcedureMetadata,
    /// Per-call options
    pub options: &'a CallOptions,
}

/// Validates, invokes, and releases procedure artifacts of one language
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; calls for different procedures (and
/// for the same procedure) arrive concurrently from many threads.
pub trait ProcedureBackend: Send + Sync {
    /// Execution model served by this backend
    fn language(&self) -> Language;

    /// File name of the installed artifact for `internal_name`
    fn artifact_file_name(&self, internal_name: &str) -> String;

    /// Check that the artifact at `artifact` is callable under `version`
    ///
    /// # Errors
    ///
    /// - `Load` when the expected entry points cannot be resolved
    /// - `Input` or `Internal` when validation ran the code and it failed
    fn load(
        &self,
        internal_name: &str,
        artifact: &Path,
        version: ApiVersion,
    ) -> ProcedureResult<LoadedProcedure>;

    /// Release whatever the backend holds for `internal_name`
    fn unload(&self, internal_name: &str) -> ProcedureResult<()>;

    /// Release everything the backend holds
    fn unload_all(&self) -> ProcedureResult<()>;

    /// Invoke a V1 procedure
    fn call(&self, call: &BackendCall<'_>, input: &[u8]) -> ProcedureResult<Vec<u8>>;

    /// Invoke a V2 procedure inside the caller's transaction
    fn call_v2(&self, call: &BackendCall<'_>, input: &[u8]) -> ProcedureResult<StructuredResult>;
}
