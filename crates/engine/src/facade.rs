//! Procedure manager facade
//!
//! Single entry point for procedure operations. Holds one
//! [`SingleLanguageManager`] per enabled language and dispatches on
//! [`Language`].
//!
//! # Example
//!
//! ```ignore
//! use graphproc_engine::{LoadRequest, ProcedureManager};
//! use graphproc_core::{CallContext, CallOptions, CodeKind, Language};
//!
//! let procs = ProcedureManager::open_dir("./my-db")?;
//! procs.load_from_code("admin", Language::Native, LoadRequest::new("echo", CodeKind::So, lib))?;
//! let out = procs.call(&CallContext::new("admin"), Language::Native, "echo", b"hi", &CallOptions::default())?;
//! ```

use crate::backend::ProcedureBackend;
use crate::compile::Builder;
use crate::config::{ProcedureConfig, CONFIG_FILE_NAME};
use crate::manager::{LoadRequest, SingleLanguageManager, COMPILED_CODE_TYPE};
use crate::native::NativeBackend;
use crate::worker::{InterpretedBackend, PoolConfig, PoolStats, WorkerPool};
use graphproc_core::{
    CallContext, CallOptions, Language, ProcedureCode, ProcedureDescriptor, ProcedureError,
    ProcedureResult, StructuredResult,
};
use graphproc_storage::{CodeRegistry, KvEngine, MemoryEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// File holding the registry image inside a database directory
pub const REGISTRY_IMAGE_FILE: &str = "procedures.gpkv";

/// Worker executable looked up when none is configured
pub const TASK_RUNNER_PROGRAM: &str = "graphproc-task-runner";

/// Procedure operations across every enabled language
#[derive(Debug)]
pub struct ProcedureManager {
    config: ProcedureConfig,
    native: SingleLanguageManager,
    interpreted: Option<SingleLanguageManager>,
    interpreted_backend: Option<Arc<InterpretedBackend>>,
}

impl ProcedureManager {
    /// Open with `graphproc.toml` and a registry image inside `dir`
    ///
    /// A commented default config file is written when missing. The
    /// directory itself becomes `db_dir`, whatever the file says.
    pub fn open_dir(dir: impl AsRef<Path>) -> ProcedureResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            ProcedureError::internal(format!(
                "Failed to create database directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        let config_path = dir.join(CONFIG_FILE_NAME);
        ProcedureConfig::write_default_if_missing(&config_path)?;
        let mut config = ProcedureConfig::from_file(&config_path)?;
        config.db_dir = dir.to_path_buf();
        let engine = MemoryEngine::open(dir.join(REGISTRY_IMAGE_FILE))?;
        Self::open(config, Arc::new(engine))
    }

    /// Open both managers over `engine`, loading every stored procedure
    pub fn open(config: ProcedureConfig, engine: Arc<dyn KvEngine>) -> ProcedureResult<Self> {
        config.validate()?;
        let build_id = config.effective_build_id();
        let builder = Builder::new(config.toolchain.clone());

        let native_backend: Arc<dyn ProcedureBackend> =
            Arc::new(NativeBackend::new(config.toolchain.binary_extension.clone()));
        let native = SingleLanguageManager::open(
            config.graph.clone(),
            config.native.resolve_plugin_dir(&config.db_dir),
            Arc::clone(&engine),
            CodeRegistry::new(config.native.table.clone(), build_id.clone()),
            native_backend,
            builder.clone(),
        )?;

        let (interpreted, interpreted_backend) = if config.enable_interpreted {
            let pool = WorkerPool::new(PoolConfig {
                program: resolve_worker_program(&config)?,
                args: config.interpreted.worker_args.clone(),
                db_dir: config.db_dir.clone(),
                interpreter: config.interpreted.interpreter.clone(),
                max_idle: config.interpreted.max_idle(),
                max_lifetime: config.interpreted.max_lifetime(),
                poll_interval: config.interpreted.poll_interval(),
                queue_prefix: config.interpreted.storage.table.clone(),
            });
            let backend = Arc::new(InterpretedBackend::new(
                pool,
                config.graph.clone(),
                Some(config.toolchain.timeout()),
            ));
            let dyn_backend: Arc<dyn ProcedureBackend> = backend.clone();
            let manager = SingleLanguageManager::open(
                config.graph.clone(),
                config.interpreted.storage.resolve_plugin_dir(&config.db_dir),
                Arc::clone(&engine),
                CodeRegistry::new(config.interpreted.storage.table.clone(), build_id),
                dyn_backend,
                builder,
            )?;
            (Some(manager), Some(backend))
        } else {
            (None, None)
        };

        info!(
            target: "graphproc::manager",
            graph = %config.graph,
            db_dir = %config.db_dir.display(),
            interpreted = config.enable_interpreted,
            "Procedure manager ready"
        );
        Ok(ProcedureManager {
            config,
            native,
            interpreted,
            interpreted_backend,
        })
    }

    /// Configuration in effect
    pub fn config(&self) -> &ProcedureConfig {
        &self.config
    }

    /// Manager serving `language`
    ///
    /// # Errors
    ///
    /// `Internal` when `language` is interpreted and interpreted procedures
    /// are disabled.
    pub fn manager(&self, language: Language) -> ProcedureResult<&SingleLanguageManager> {
        match language {
            Language::Native => Ok(&self.native),
            Language::Interpreted => self.interpreted.as_ref().ok_or_else(|| {
                ProcedureError::internal("Interpreted procedures are disabled.")
            }),
        }
    }

    /// Worker pool counts, when interpreted procedures are enabled
    pub fn interpreted_stats(&self) -> Option<PoolStats> {
        self.interpreted_backend.as_ref().map(|b| b.stats())
    }

    /// See [`SingleLanguageManager::load_from_code`]
    pub fn load_from_code(
        &self,
        user: &str,
        language: Language,
        request: LoadRequest,
    ) -> ProcedureResult<bool> {
        self.manager(language)?.load_from_code(user, request)
    }

    /// See [`SingleLanguageManager::del_plugin`]
    pub fn del_plugin(&self, user: &str, language: Language, name: &str) -> ProcedureResult<bool> {
        self.manager(language)?.del_plugin(user, name)
    }

    /// See [`SingleLanguageManager::delete_all`]
    pub fn delete_all(&self, user: &str, language: Language) -> ProcedureResult<()> {
        self.manager(language)?.delete_all(user)
    }

    /// See [`SingleLanguageManager::is_read_only`]
    pub fn is_read_only(&self, language: Language, name: &str) -> ProcedureResult<bool> {
        self.manager(language)?.is_read_only(name)
    }

    /// See [`SingleLanguageManager::list`]; code types are resolved as in
    /// [`get_code`](Self::get_code)
    pub fn list(&self, user: &str, language: Language) -> ProcedureResult<Vec<ProcedureDescriptor>> {
        let mut entries = self.manager(language)?.list(user)?;
        for entry in &mut entries {
            resolve_code_type(language, &mut entry.code_type);
        }
        Ok(entries)
    }

    /// Stored code of `name`
    ///
    /// A compiled-only artifact is reported as `so` for native procedures
    /// and `py` for interpreted ones.
    pub fn get_code(&self, language: Language, name: &str) -> ProcedureResult<ProcedureCode> {
        let mut code = self.manager(language)?.get_code(name)?;
        resolve_code_type(language, &mut code.code_type);
        Ok(code)
    }

    /// See [`SingleLanguageManager::call`]
    pub fn call(
        &self,
        ctx: &CallContext<'_>,
        language: Language,
        name: &str,
        input: &[u8],
        options: &CallOptions,
    ) -> ProcedureResult<Option<Vec<u8>>> {
        self.manager(language)?.call(ctx, name, input, options)
    }

    /// See [`SingleLanguageManager::call_v2`]
    pub fn call_v2(
        &self,
        ctx: &CallContext<'_>,
        language: Language,
        name: &str,
        input: &[u8],
        options: &CallOptions,
    ) -> ProcedureResult<Option<StructuredResult>> {
        self.manager(language)?.call_v2(ctx, name, input, options)
    }
}

fn resolve_code_type(language: Language, code_type: &mut String) {
    if code_type == COMPILED_CODE_TYPE {
        *code_type = match language {
            Language::Native => "so",
            Language::Interpreted => "py",
        }
        .to_string();
    }
}

fn resolve_worker_program(config: &ProcedureConfig) -> ProcedureResult<PathBuf> {
    if let Some(program) = &config.interpreted.worker_program {
        return Ok(program.clone());
    }
    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(TASK_RUNNER_PROGRAM)))
        .filter(|path| path.is_file());
    if let Some(path) = sibling {
        return Ok(path);
    }
    which::which(TASK_RUNNER_PROGRAM).map_err(|e| {
        ProcedureError::internal(format!(
            "Cannot find worker program {}: {}. Set interpreted.worker_program in {}.",
            TASK_RUNNER_PROGRAM, e, CONFIG_FILE_NAME
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphproc_core::{CodeKind, ErrorKind};

    fn native_only(dir: &Path) -> ProcedureConfig {
        ProcedureConfig {
            enable_interpreted: false,
            ..ProcedureConfig::with_db_dir(dir)
        }
    }

    #[test]
    fn test_disabled_interpreted_is_internal() {
        let dir = tempfile::tempdir().unwrap();
        let procs =
            ProcedureManager::open(native_only(dir.path()), Arc::new(MemoryEngine::new())).unwrap();
        let err = procs.list("admin", Language::Interpreted).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(procs.interpreted_stats().is_none());
        assert!(procs.list("admin", Language::Native).unwrap().is_empty());
    }

    #[test]
    fn test_open_dir_writes_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "enable_interpreted = false\n",
        )
        .unwrap();
        let procs = ProcedureManager::open_dir(dir.path()).unwrap();
        assert_eq!(procs.config().db_dir, dir.path());
        assert!(dir.path().join("native_plugins").is_dir());
    }

    #[test]
    fn test_invalid_name_rejected_before_build() {
        let dir = tempfile::tempdir().unwrap();
        let procs =
            ProcedureManager::open(native_only(dir.path()), Arc::new(MemoryEngine::new())).unwrap();
        let err = procs
            .load_from_code(
                "admin",
                Language::Native,
                LoadRequest::new("bad name", CodeKind::So, b"x".to_vec()),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidName);
    }
}
