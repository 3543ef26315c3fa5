//! Per-call shared-library handle
//!
//! A [`NativeLibrary`] is opened for one validation or one call and closed
//! when dropped, on every path. Nothing is cached between calls, so replacing
//! an artifact on disk takes effect on the next call.

use super::abi::{
    GetSignatureFn, OutputBuffer, ProcessFn, ProcessInTxnFn, GET_SIGNATURE_SYMBOL,
    PROCESS_IN_TXN_SYMBOL, PROCESS_SYMBOL,
};
use graphproc_core::{ApiVersion, GraphHandle, ProcedureError, ProcedureResult};
use libloading::{Library, Symbol};
use std::path::{Path, PathBuf};

const STATIC_TLS_HINT: &str = "The library uses initial-exec thread-local storage. \
Rebuild it with -ftls-model=global-dynamic, or preload it into the server with LD_PRELOAD.";

/// Outcome of a raw entry-point invocation
#[derive(Debug)]
pub struct RawOutput {
    /// Value the entry point returned
    pub ok: bool,
    /// Bytes written to the sink
    pub output: Vec<u8>,
}

/// Entry points exported by a library
pub enum EntryPoints<'lib> {
    /// `Process`
    V1(Symbol<'lib, ProcessFn>),
    /// `GetSignature` and `ProcessInTxn`
    V2 {
        /// `GetSignature`
        get_signature: Symbol<'lib, GetSignatureFn>,
        /// `ProcessInTxn`
        process_in_txn: Symbol<'lib, ProcessInTxnFn>,
    },
}

impl EntryPoints<'_> {
    /// Calling convention these entry points implement
    pub fn version(&self) -> ApiVersion {
        match self {
            EntryPoints::V1(_) => ApiVersion::V1,
            EntryPoints::V2 { .. } => ApiVersion::V2,
        }
    }

    /// Run `Process`
    pub fn process(&self, db: GraphHandle, input: &[u8]) -> ProcedureResult<RawOutput> {
        let EntryPoints::V1(process) = self else {
            return Err(ProcedureError::load("Library does not export Process."));
        };
        let mut buffer = OutputBuffer::new();
        let mut sink = buffer.sink();
        // SAFETY: the symbol was resolved with the documented signature; the
        // input slice and the sink outlive the call.
        let ok = unsafe { process(db.as_ptr(), input.as_ptr(), input.len(), &mut sink) };
        Ok(RawOutput {
            ok,
            output: buffer.into_bytes(),
        })
    }

    /// Run `GetSignature`
    pub fn signature(&self) -> ProcedureResult<RawOutput> {
        let EntryPoints::V2 { get_signature, .. } = self else {
            return Err(ProcedureError::load("Library does not export GetSignature."));
        };
        let mut buffer = OutputBuffer::new();
        let mut sink = buffer.sink();
        // SAFETY: as for `process`.
        let ok = unsafe { get_signature(&mut sink) };
        Ok(RawOutput {
            ok,
            output: buffer.into_bytes(),
        })
    }

    /// Run `ProcessInTxn`
    pub fn process_in_txn(&self, txn: GraphHandle, input: &[u8]) -> ProcedureResult<RawOutput> {
        let EntryPoints::V2 { process_in_txn, .. } = self else {
            return Err(ProcedureError::load("Library does not export ProcessInTxn."));
        };
        let mut buffer = OutputBuffer::new();
        let mut sink = buffer.sink();
        // SAFETY: as for `process`.
        let ok = unsafe { process_in_txn(txn.as_ptr(), input.as_ptr(), input.len(), &mut sink) };
        Ok(RawOutput {
            ok,
            output: buffer.into_bytes(),
        })
    }
}

/// An open shared library; closed on drop
pub struct NativeLibrary {
    lib: Library,
    path: PathBuf,
}

impl std::fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeLibrary")
            .field("path", &self.path)
            .finish()
    }
}

impl NativeLibrary {
    /// Map the library at `path`
    pub fn open(path: &Path) -> ProcedureResult<Self> {
        // SAFETY: loading runs the library's initializers. Procedures are
        // trusted code installed by an authorized user.
        let lib = unsafe { Library::new(path) }.map_err(|e| {
            let mut msg = format!("Failed to load library {}: {}", path.display(), e);
            if msg.contains("static TLS block") {
                msg.push('\n');
                msg.push_str(STATIC_TLS_HINT);
            }
            ProcedureError::load(msg)
        })?;
        Ok(NativeLibrary {
            lib,
            path: path.to_path_buf(),
        })
    }

    /// Path the library was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve exactly one complete set of entry points
    pub fn resolve(&self) -> ProcedureResult<EntryPoints<'_>> {
        // SAFETY: symbol types match the ABI header.
        let process = unsafe { self.lib.get::<ProcessFn>(PROCESS_SYMBOL) }.ok();
        let get_signature = unsafe { self.lib.get::<GetSignatureFn>(GET_SIGNATURE_SYMBOL) }.ok();
        let process_in_txn =
            unsafe { self.lib.get::<ProcessInTxnFn>(PROCESS_IN_TXN_SYMBOL) }.ok();

        match (process, get_signature, process_in_txn) {
            (Some(process), None, None) => Ok(EntryPoints::V1(process)),
            (None, Some(get_signature), Some(process_in_txn)) => Ok(EntryPoints::V2 {
                get_signature,
                process_in_txn,
            }),
            (Some(_), _, _) => Err(ProcedureError::load(format!(
                "Library {} exports both Process and transaction-scoped entry points.",
                self.path.display()
            ))),
            (None, None, None) => Err(ProcedureError::load(format!(
                "Library {} exports neither Process nor GetSignature/ProcessInTxn.",
                self.path.display()
            ))),
            (None, _, _) => Err(ProcedureError::load(format!(
                "Library {} must export both GetSignature and ProcessInTxn.",
                self.path.display()
            ))),
        }
    }
}
