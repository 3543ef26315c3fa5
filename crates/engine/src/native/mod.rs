//! Native procedure backend
//!
//! Native procedures are shared libraries exporting either the V1 entry point
//! (`Process`) or the V2 pair (`GetSignature` + `ProcessInTxn`). See
//! `include/graphproc_plugin.h` for the C declarations.
//!
//! # Design Notes
//!
//! - every validation and every call opens the library, resolves the entry
//!   points, runs, and closes it again through [`NativeLibrary`]'s drop
//! - the backend holds no per-procedure state, so `unload` has nothing to do
//! - calls run on the caller's thread and cannot be cancelled

pub mod abi;
pub mod loader;

pub use loader::{EntryPoints, NativeLibrary, RawOutput};

use crate::backend::{BackendCall, LoadedProcedure, ProcedureBackend};
use graphproc_core::{
    ApiVersion, Language, ProcedureError, ProcedureResult, SigSpec, StructuredResult,
};
use std::path::Path;
use tracing::debug;

/// Backend running shared libraries in-process
#[derive(Debug, Clone)]
pub struct NativeBackend {
    extension: String,
}

impl Default for NativeBackend {
    fn default() -> Self {
        NativeBackend::new("so")
    }
}

impl NativeBackend {
    /// Backend installing artifacts with the given file extension
    pub fn new(extension: impl Into<String>) -> Self {
        NativeBackend {
            extension: extension.into(),
        }
    }

    fn open_for_call(
        &self,
        call: &BackendCall<'_>,
        expected: ApiVersion,
    ) -> ProcedureResult<NativeLibrary> {
        debug!(
            target: "graphproc::native",
            procedure = %call.meta.name,
            user = %call.ctx.user,
            version = %expected,
            "Opening native procedure"
        );
        NativeLibrary::open(call.artifact)
    }
}

impl ProcedureBackend for NativeBackend {
    fn language(&self) -> Language {
        Language::Native
    }

    fn artifact_file_name(&self, internal_name: &str) -> String {
        format!("{}.{}", internal_name, self.extension)
    }

    fn load(
        &self,
        internal_name: &str,
        artifact: &Path,
        version: ApiVersion,
    ) -> ProcedureResult<LoadedProcedure> {
        let library = NativeLibrary::open(artifact)?;
        let entry = library.resolve()?;
        if entry.version() != version {
            return Err(ProcedureError::load(format!(
                "Procedure [{}] was declared {} but exports the {} entry points.",
                internal_name,
                version,
                entry.version()
            )));
        }
        let signature = match version {
            ApiVersion::V1 => None,
            ApiVersion::V2 => {
                let raw = entry.signature()?;
                if !raw.ok {
                    return Err(ProcedureError::load(format!(
                        "GetSignature of procedure [{}] failed: {}",
                        internal_name,
                        String::from_utf8_lossy(&raw.output)
                    )));
                }
                let sig = SigSpec::from_json(&raw.output)?;
                Some(sig)
            }
        };
        debug!(
            target: "graphproc::native",
            procedure = %internal_name,
            version = %version,
            "Validated native procedure"
        );
        Ok(LoadedProcedure { signature })
    }

    fn unload(&self, _internal_name: &str) -> ProcedureResult<()> {
        Ok(())
    }

    fn unload_all(&self) -> ProcedureResult<()> {
        Ok(())
    }

    fn call(&self, call: &BackendCall<'_>, input: &[u8]) -> ProcedureResult<Vec<u8>> {
        let library = self.open_for_call(call, ApiVersion::V1)?;
        let entry = library.resolve()?;
        let raw = entry.process(call.ctx.db, input)?;
        if !raw.ok {
            return Err(ProcedureError::input(
                String::from_utf8_lossy(&raw.output).into_owned(),
            ));
        }
        Ok(raw.output)
    }

    fn call_v2(&self, call: &BackendCall<'_>, input: &[u8]) -> ProcedureResult<StructuredResult> {
        let txn = call.ctx.txn.ok_or_else(|| {
            ProcedureError::input(format!(
                "Procedure [{}] must be called inside a transaction.",
                call.meta.name
            ))
        })?;
        let library = self.open_for_call(call, ApiVersion::V2)?;
        let entry = library.resolve()?;
        let raw = entry.process_in_txn(txn, input)?;
        if !raw.ok {
            return Err(ProcedureError::input(
                String::from_utf8_lossy(&raw.output).into_owned(),
            ));
        }
        StructuredResult::from_json(&raw.output)
    }
}
