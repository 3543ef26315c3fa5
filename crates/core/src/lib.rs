//! Core types for graphproc
//!
//! This crate defines the foundational types shared by every layer of the
//! stored-procedure subsystem:
//! - ProcedureError / ErrorKind: the error taxonomy surfaced to callers
//! - ProcedureMetadata: persisted description of a loaded procedure
//! - Language, ApiVersion, CodeKind: discriminators for backends and inputs
//! - SigSpec, Parameter, FieldType: declared procedure signatures
//! - StructuredResult: output of transaction-scoped (V2) procedures
//! - ProcedureName: name policy and internal key namespacing

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod limits;
pub mod name;
pub mod signature;
pub mod types;

pub use error::{ErrorKind, ProcedureError, ProcedureResult};
pub use limits::{MAX_PROCEDURE_NAME_LENGTH, MAX_TASK_OUTPUT, MAX_WIRE_CHUNK};
pub use name::{ProcedureName, ProcedureNameError, INTERNAL_NAME_PREFIX};
pub use signature::{FieldType, Parameter, SigSpec, StructuredResult};
pub use types::{
    ApiVersion, CallContext, CallOptions, CodeKind, GraphHandle, Language, ProcedureCode,
    ProcedureDescriptor, ProcedureMetadata,
};
