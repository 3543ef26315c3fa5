//! Interpreted procedure backend
//!
//! Loading asks a worker to import the module (`__graphproc_load_module__`),
//! which may answer with a declared signature. Calls run the module on a
//! pooled worker. Workers do not track which modules they imported, so
//! unloading anything kills every worker and later calls start fresh ones.

use super::pool::{PoolStats, WorkerPool};
use crate::backend::{BackendCall, LoadedProcedure, ProcedureBackend};
use graphproc_core::{
    ApiVersion, Language, ProcedureError, ProcedureResult, SigSpec, StructuredResult,
};
use graphproc_wire::{TaskInput, TaskOutput, TaskStatus, LOAD_MODULE_FUNCTION};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Backend running modules in interpreter workers
#[derive(Debug)]
pub struct InterpretedBackend {
    pool: WorkerPool,
    graph: String,
    load_timeout: Option<Duration>,
}

impl InterpretedBackend {
    /// Backend dispatching to `pool` for procedures of `graph`
    pub fn new(pool: WorkerPool, graph: impl Into<String>, load_timeout: Option<Duration>) -> Self {
        InterpretedBackend {
            pool,
            graph: graph.into(),
            load_timeout,
        }
    }

    /// Worker counts
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Underlying pool
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    fn run(&self, call: &BackendCall<'_>, input: &[u8]) -> ProcedureResult<Vec<u8>> {
        let task = TaskInput {
            user: call.ctx.user.to_string(),
            graph: self.graph.clone(),
            plugin_dir: parent_dir(call.artifact),
            function: call.internal_name.to_string(),
            input: input.to_vec(),
            read_only: call.meta.read_only,
        };
        debug!(
            target: "graphproc::worker",
            procedure = %call.meta.name,
            user = %call.ctx.user,
            timeout = ?call.options.timeout,
            "Dispatching interpreted call"
        );
        let output = self.pool.run_task(&task, call.options.timeout)?;
        call_result(output)
    }
}

fn parent_dir(artifact: &Path) -> String {
    artifact
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

fn call_result(output: TaskOutput) -> ProcedureResult<Vec<u8>> {
    match output.status {
        TaskStatus::Success | TaskStatus::SuccessWithSignature => Ok(output.output),
        TaskStatus::InputErr => Err(ProcedureError::input(format!(
            "Procedure returned failure: {}",
            String::from_utf8_lossy(&output.output)
        ))),
        TaskStatus::InternalErr => Err(ProcedureError::internal(
            String::from_utf8_lossy(&output.output).into_owned(),
        )),
    }
}

impl ProcedureBackend for InterpretedBackend {
    fn language(&self) -> Language {
        Language::Interpreted
    }

    fn artifact_file_name(&self, internal_name: &str) -> String {
        format!("{}.py", internal_name)
    }

    fn load(
        &self,
        internal_name: &str,
        artifact: &Path,
        version: ApiVersion,
    ) -> ProcedureResult<LoadedProcedure> {
        let task = TaskInput {
            user: String::new(),
            graph: self.graph.clone(),
            plugin_dir: parent_dir(artifact),
            function: LOAD_MODULE_FUNCTION.to_string(),
            input: internal_name.as_bytes().to_vec(),
            read_only: true,
        };
        let output = self.pool.run_task(&task, self.load_timeout)?;
        let signature = match output.status {
            TaskStatus::Success => None,
            TaskStatus::SuccessWithSignature => Some(SigSpec::from_json(&output.output)?),
            TaskStatus::InputErr => {
                return Err(ProcedureError::input(format!(
                    "Failed to load procedure [{}]: {}",
                    internal_name,
                    String::from_utf8_lossy(&output.output)
                )))
            }
            TaskStatus::InternalErr => {
                return Err(ProcedureError::internal(format!(
                    "Failed to load procedure [{}]: {}",
                    internal_name,
                    String::from_utf8_lossy(&output.output)
                )))
            }
        };
        debug!(
            target: "graphproc::worker",
            procedure = %internal_name,
            version = %version,
            signed = signature.is_some(),
            "Validated interpreted procedure"
        );
        Ok(LoadedProcedure { signature })
    }

    fn unload(&self, internal_name: &str) -> ProcedureResult<()> {
        info!(
            target: "graphproc::worker",
            procedure = %internal_name,
            "Unloading module, restarting workers"
        );
        self.pool.kill_all();
        Ok(())
    }

    fn unload_all(&self) -> ProcedureResult<()> {
        self.pool.kill_all();
        Ok(())
    }

    fn call(&self, call: &BackendCall<'_>, input: &[u8]) -> ProcedureResult<Vec<u8>> {
        self.run(call, input)
    }

    fn call_v2(&self, call: &BackendCall<'_>, input: &[u8]) -> ProcedureResult<StructuredResult> {
        let bytes = self.run(call, input)?;
        StructuredResult::from_json(&bytes)
    }
}
