//! Procedure manager for one execution language
//!
//! The manager owns the name → metadata map for its language and is the only
//! writer of its registry table.
//!
//! # Design Notes
//!
//! - readers hold the map lock only long enough to copy metadata out; calls
//!   run with no lock held
//! - loads are two-phase: check under the read lock, build and validate with
//!   no lock, then re-check, install and commit under the write lock. Of
//!   concurrent loads of one name exactly one wins; the rest return `false`
//! - the backend is never invoked while the write lock is held
//! - artifact files are written before the registry commit and removed only
//!   after a delete commits; `load_all_on_startup` repairs anything a crash
//!   left behind

use crate::backend::{BackendCall, ProcedureBackend};
use crate::compile::{BuiltArtifact, Builder};
use graphproc_core::{
    ApiVersion, CallContext, CallOptions, CodeKind, Language, ProcedureCode, ProcedureDescriptor,
    ProcedureError, ProcedureMetadata, ProcedureName, ProcedureResult, StructuredResult,
};
use graphproc_storage::{ArtifactKind, CodeRegistry, KvEngine, KvTransaction};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Code type reported for a procedure with only a compiled artifact
pub const COMPILED_CODE_TYPE: &str = "so_or_py";

/// Everything needed to load a procedure from code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    /// User-facing name
    pub name: String,
    /// Code, one part per file
    pub code_parts: Vec<Vec<u8>>,
    /// File names, one per part (multi-file sources only)
    pub filenames: Vec<String>,
    /// Form of the supplied code
    pub code_kind: CodeKind,
    /// Free-text description
    pub description: String,
    /// Whether the procedure only reads the graph
    pub read_only: bool,
    /// Calling convention (`v1` or `v2`)
    pub version: String,
}

impl LoadRequest {
    /// Single-part request with default settings (read-only, `v1`)
    pub fn new(name: impl Into<String>, code_kind: CodeKind, code: impl Into<Vec<u8>>) -> Self {
        LoadRequest {
            name: name.into(),
            code_parts: vec![code.into()],
            filenames: Vec::new(),
            code_kind,
            description: String::new(),
            read_only: true,
            version: ApiVersion::V1.as_str().to_string(),
        }
    }

    /// Multi-file request; `files` are `(file name, content)` pairs
    pub fn from_files<N, C>(name: impl Into<String>, files: impl IntoIterator<Item = (N, C)>) -> Self
    where
        N: Into<String>,
        C: Into<Vec<u8>>,
    {
        let (filenames, code_parts): (Vec<String>, Vec<Vec<u8>>) = files
            .into_iter()
            .map(|(n, c)| (n.into(), c.into()))
            .unzip();
        LoadRequest {
            code_parts,
            filenames,
            ..LoadRequest::new(name, CodeKind::Cpp, Vec::new())
        }
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the read-only flag
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the calling convention
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// Removes an installed artifact file unless disarmed
struct ArtifactGuard<'a> {
    path: &'a Path,
    armed: bool,
}

impl ArtifactGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ArtifactGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(self.path) {
                warn!(
                    target: "graphproc::manager",
                    path = %self.path.display(),
                    error = %e,
                    "Failed to roll back installed artifact"
                );
            }
        }
    }
}

/// Puts a removed map entry back unless disarmed
struct RestoreEntry<'a> {
    map: &'a mut HashMap<ProcedureName, ProcedureMetadata>,
    entry: Option<(ProcedureName, ProcedureMetadata)>,
}

impl RestoreEntry<'_> {
    fn disarm(mut self) {
        self.entry = None;
    }
}

impl Drop for RestoreEntry<'_> {
    fn drop(&mut self) {
        if let Some((name, meta)) = self.entry.take() {
            warn!(
                target: "graphproc::manager",
                procedure = %name,
                "Delete did not commit, restoring procedure"
            );
            self.map.insert(name, meta);
        }
    }
}

/// Manages every procedure of one language
pub struct SingleLanguageManager {
    graph: String,
    language: Language,
    plugin_dir: PathBuf,
    engine: Arc<dyn KvEngine>,
    registry: CodeRegistry,
    backend: Arc<dyn ProcedureBackend>,
    builder: Builder,
    procedures: RwLock<HashMap<ProcedureName, ProcedureMetadata>>,
}

impl std::fmt::Debug for SingleLanguageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleLanguageManager")
            .field("graph", &self.graph)
            .field("language", &self.language)
            .field("plugin_dir", &self.plugin_dir)
            .field("table", &self.registry.table())
            .field("procedures", &self.procedures.read().len())
            .finish()
    }
}

impl SingleLanguageManager {
    /// Create the plugin directory and load every stored procedure
    ///
    /// # Errors
    ///
    /// `Internal` when the directory cannot be created or any stored
    /// procedure fails to load.
    pub fn open(
        graph: impl Into<String>,
        plugin_dir: impl Into<PathBuf>,
        engine: Arc<dyn KvEngine>,
        registry: CodeRegistry,
        backend: Arc<dyn ProcedureBackend>,
        builder: Builder,
    ) -> ProcedureResult<Self> {
        let plugin_dir = plugin_dir.into();
        std::fs::create_dir_all(&plugin_dir).map_err(|e| {
            ProcedureError::internal(format!(
                "Failed to create plugin directory {}: {}",
                plugin_dir.display(),
                e
            ))
        })?;
        let manager = SingleLanguageManager {
            graph: graph.into(),
            language: backend.language(),
            plugin_dir,
            engine,
            registry,
            backend,
            builder,
            procedures: RwLock::new(HashMap::new()),
        };
        manager.load_all_on_startup()?;
        Ok(manager)
    }

    /// Language served
    pub fn language(&self) -> Language {
        self.language
    }

    /// Graph the procedures belong to
    pub fn graph(&self) -> &str {
        &self.graph
    }

    /// Directory holding installed artifacts
    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Registry table
    pub fn table(&self) -> &str {
        self.registry.table()
    }

    /// Whether `name` is loaded
    pub fn contains(&self, name: &str) -> bool {
        ProcedureName::new(name).map_or(false, |n| self.procedures.read().contains_key(&n))
    }

    /// Installed artifact path for `name`
    pub fn artifact_path(&self, name: &ProcedureName) -> PathBuf {
        self.plugin_dir
            .join(self.backend.artifact_file_name(&name.internal()))
    }

    /// Build, validate, and register a procedure
    ///
    /// Returns `Ok(false)` when a procedure of that name is already loaded;
    /// the existing one is left untouched.
    pub fn load_from_code(&self, user: &str, request: LoadRequest) -> ProcedureResult<bool> {
        let name = ProcedureName::parse(&request.name)?;
        let version: ApiVersion = request.version.parse()?;
        if request.code_parts.is_empty() || request.code_parts.iter().any(|p| p.is_empty()) {
            return Err(ProcedureError::input("Code cannot be empty."));
        }

        if self.procedures.read().contains_key(&name) {
            info!(
                target: "graphproc::manager",
                procedure = %name,
                user = %user,
                "Procedure already exists, ignoring load"
            );
            return Ok(false);
        }

        let internal = name.internal();
        let staging = self.staging_dir(&internal)?;
        let built = self.build(&internal, &request, staging.path())?;
        let install_dir = staging.path().join("install");
        std::fs::create_dir_all(&install_dir).map_err(|e| {
            ProcedureError::internal(format!("Failed to stage procedure [{}]: {}", name, e))
        })?;
        let staged = install_dir.join(self.backend.artifact_file_name(&internal));
        std::fs::write(&staged, &built.binary).map_err(|e| {
            ProcedureError::internal(format!("Failed to stage procedure [{}]: {}", name, e))
        })?;
        let loaded = self.backend.load(&internal, &staged, version)?;

        let mut procedures = self.procedures.write();
        if procedures.contains_key(&name) {
            debug!(
                target: "graphproc::manager",
                procedure = %name,
                "Lost a concurrent load, discarding artifact"
            );
            return Ok(false);
        }

        let final_path = self.artifact_path(&name);
        std::fs::rename(&staged, &final_path).map_err(|e| {
            ProcedureError::internal(format!(
                "Failed to install procedure [{}] at {}: {}",
                name,
                final_path.display(),
                e
            ))
        })?;
        let installed = ArtifactGuard {
            path: &final_path,
            armed: true,
        };

        let meta = ProcedureMetadata {
            name: name.as_str().to_string(),
            description: request.description,
            read_only: request.read_only,
            language: self.language,
            version,
            signature: loaded.signature,
            content_hash: self.registry.build_id().to_string(),
        };
        let mut txn = self.engine.begin_write()?;
        self.registry.put_metadata(&mut *txn, &name, &meta)?;
        self.registry
            .put_artifact(&mut *txn, &name, ArtifactKind::Compiled, &built.binary)?;
        if let Some((kind, source)) = &built.source {
            self.registry.put_artifact(&mut *txn, &name, *kind, source)?;
        }
        txn.commit()?;

        procedures.insert(name.clone(), meta);
        installed.disarm();
        info!(
            target: "graphproc::manager",
            procedure = %name,
            user = %user,
            language = %self.language,
            kind = %request.code_kind,
            version = %version,
            "Loaded procedure"
        );
        Ok(true)
    }

    /// Remove a procedure; returns whether it existed
    pub fn del_plugin(&self, user: &str, name: &str) -> ProcedureResult<bool> {
        let name = ProcedureName::parse(name)?;
        if !self.procedures.read().contains_key(&name) {
            return Ok(false);
        }
        {
            let mut procedures = self.procedures.write();
            let meta = match procedures.remove(&name) {
                Some(meta) => meta,
                None => return Ok(false),
            };
            let restore = RestoreEntry {
                map: &mut *procedures,
                entry: Some((name.clone(), meta)),
            };
            let mut txn = self.engine.begin_write()?;
            self.registry.delete_all(&mut *txn, &name)?;
            txn.commit()?;
            restore.disarm();
            self.remove_artifact(&name);
        }
        if let Err(e) = self.backend.unload(&name.internal()) {
            warn!(
                target: "graphproc::manager",
                procedure = %name,
                error = %e,
                "Backend unload failed"
            );
        }
        info!(target: "graphproc::manager", procedure = %name, user = %user, "Deleted procedure");
        Ok(true)
    }

    /// Remove every procedure of this language
    pub fn delete_all(&self, user: &str) -> ProcedureResult<()> {
        let count = {
            let mut procedures = self.procedures.write();
            let mut txn = self.engine.begin_write()?;
            self.registry.drop_all(&mut *txn)?;
            txn.commit()?;
            let names: Vec<ProcedureName> = procedures.drain().map(|(n, _)| n).collect();
            for name in &names {
                self.remove_artifact(name);
            }
            names.len()
        };
        if let Err(e) = self.backend.unload_all() {
            warn!(target: "graphproc::manager", error = %e, "Backend unload failed");
        }
        info!(
            target: "graphproc::manager",
            user = %user,
            language = %self.language,
            count,
            "Deleted all procedures"
        );
        Ok(())
    }

    /// Whether `name` is declared read-only
    pub fn is_read_only(&self, name: &str) -> ProcedureResult<bool> {
        let name = ProcedureName::parse(name)?;
        self.procedures
            .read()
            .get(&name)
            .map(|m| m.read_only)
            .ok_or_else(|| ProcedureError::NotFound(name.as_str().to_string()))
    }

    /// Describe every loaded procedure, ordered by name
    pub fn list(&self, user: &str) -> ProcedureResult<Vec<ProcedureDescriptor>> {
        let mut entries: Vec<(ProcedureName, ProcedureMetadata)> = self
            .procedures
            .read()
            .iter()
            .map(|(n, m)| (n.clone(), m.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

        let txn = self.engine.begin_read()?;
        let mut out = Vec::with_capacity(entries.len());
        for (name, meta) in entries {
            let code_type = self
                .registry
                .source_variant(&*txn, &name)?
                .map_or(COMPILED_CODE_TYPE, ArtifactKind::code_type);
            out.push(ProcedureDescriptor {
                name: meta.name,
                description: meta.description,
                read_only: meta.read_only,
                language: meta.language,
                version: meta.version,
                signature: meta.signature.map(|s| s.to_json()).unwrap_or_default(),
                code_type: code_type.to_string(),
            });
        }
        debug!(target: "graphproc::manager", user = %user, count = out.len(), "Listed procedures");
        Ok(out)
    }

    /// Stored code of `name`, in its highest-priority form
    pub fn get_code(&self, name: &str) -> ProcedureResult<ProcedureCode> {
        let name = ProcedureName::parse(name)?;
        let meta = self
            .procedures
            .read()
            .get(&name)
            .cloned()
            .ok_or_else(|| ProcedureError::NotFound(name.as_str().to_string()))?;
        let txn = self.engine.begin_read()?;
        let kind = self.registry.source_variant(&*txn, &name)?.ok_or_else(|| {
            ProcedureError::internal(format!("No stored code for procedure [{}].", name))
        })?;
        let code = self
            .registry
            .get_artifact(&*txn, &name, kind)?
            .unwrap_or_default();
        Ok(ProcedureCode {
            name: meta.name,
            description: meta.description,
            read_only: meta.read_only,
            code,
            code_type: kind.code_type().to_string(),
        })
    }

    /// Invoke a V1 procedure; `Ok(None)` when no such procedure is loaded
    pub fn call(
        &self,
        ctx: &CallContext<'_>,
        name: &str,
        input: &[u8],
        options: &CallOptions,
    ) -> ProcedureResult<Option<Vec<u8>>> {
        let Some((name, meta)) = self.lookup(name) else {
            return Ok(None);
        };
        if meta.version != ApiVersion::V1 {
            return Err(ProcedureError::input(format!(
                "Procedure [{}] is a {} procedure and must be called with call_v2.",
                name, meta.version
            )));
        }
        let internal = name.internal();
        let artifact = self.artifact_path(&name);
        let call = BackendCall {
            ctx,
            internal_name: &internal,
            artifact: &artifact,
            meta: &meta,
            options,
        };
        debug!(
            target: "graphproc::manager",
            procedure = %name,
            user = %ctx.user,
            input_len = input.len(),
            "Calling procedure"
        );
        self.backend.call(&call, input).map(Some)
    }

    /// Invoke a V2 procedure; `Ok(None)` when no such procedure is loaded
    pub fn call_v2(
        &self,
        ctx: &CallContext<'_>,
        name: &str,
        input: &[u8],
        options: &CallOptions,
    ) -> ProcedureResult<Option<StructuredResult>> {
        let Some((name, meta)) = self.lookup(name) else {
            return Ok(None);
        };
        if meta.version != ApiVersion::V2 {
            return Err(ProcedureError::input(format!(
                "Procedure [{}] is a {} procedure and must be called with call.",
                name, meta.version
            )));
        }
        let internal = name.internal();
        let artifact = self.artifact_path(&name);
        let call = BackendCall {
            ctx,
            internal_name: &internal,
            artifact: &artifact,
            meta: &meta,
            options,
        };
        debug!(
            target: "graphproc::manager",
            procedure = %name,
            user = %ctx.user,
            input_len = input.len(),
            "Calling transaction-scoped procedure"
        );
        self.backend.call_v2(&call, input).map(Some)
    }

    /// Load every stored procedure into memory
    ///
    /// Stale or missing artifacts are rebuilt from the highest-priority
    /// stored source and rewritten. The first failure aborts the whole
    /// startup.
    pub fn load_all_on_startup(&self) -> ProcedureResult<()> {
        let mut txn = self.engine.begin_write()?;
        let names = self.registry.scan_names(&*txn)?;
        let mut loaded = Vec::with_capacity(names.len());
        for name in names {
            let meta = self.restore_one(&mut *txn, &name).map_err(|e| {
                ProcedureError::internal(format!("Failed to load procedure [{}]: {}", name, e))
            })?;
            loaded.push((name, meta));
        }
        txn.commit()?;

        let count = loaded.len();
        let mut procedures = self.procedures.write();
        for (name, meta) in loaded {
            procedures.insert(name, meta);
        }
        info!(
            target: "graphproc::manager",
            language = %self.language,
            table = %self.registry.table(),
            count,
            "Loaded stored procedures"
        );
        Ok(())
    }

    fn restore_one(
        &self,
        txn: &mut dyn KvTransaction,
        name: &ProcedureName,
    ) -> ProcedureResult<ProcedureMetadata> {
        let mut meta = self
            .registry
            .get_metadata(txn, name)?
            .ok_or_else(|| ProcedureError::internal("Metadata is missing."))?;
        let internal = name.internal();
        let stored = self
            .registry
            .get_artifact(txn, name, ArtifactKind::Compiled)?;
        let current = self.registry.is_build_current(txn, name)?;
        let binary = match stored {
            Some(binary) if current => binary,
            _ => {
                let kind = self
                    .registry
                    .source_variant(txn, name)?
                    .ok_or_else(|| ProcedureError::internal("No stored code."))?;
                let source = self
                    .registry
                    .get_artifact(txn, name, kind)?
                    .unwrap_or_default();
                let staging = self.staging_dir(&internal)?;
                let binary = self.builder.rebuild(&internal, kind, &source, staging.path())?;
                self.registry
                    .put_artifact(txn, name, ArtifactKind::Compiled, &binary)?;
                meta.content_hash = self.registry.build_id().to_string();
                self.registry.put_metadata(txn, name, &meta)?;
                info!(
                    target: "graphproc::manager",
                    procedure = %name,
                    from = kind.code_type(),
                    "Rebuilt procedure for the running build"
                );
                binary
            }
        };

        let path = self.artifact_path(name);
        let on_disk = std::fs::read(&path).ok();
        if on_disk.as_deref() != Some(binary.as_slice()) {
            std::fs::write(&path, &binary).map_err(|e| {
                ProcedureError::internal(format!(
                    "Failed to write artifact {}: {}",
                    path.display(),
                    e
                ))
            })?;
            debug!(
                target: "graphproc::manager",
                procedure = %name,
                path = %path.display(),
                "Rewrote artifact file"
            );
        }

        let loaded = self.backend.load(&internal, &path, meta.version)?;
        if loaded.signature.is_some() && loaded.signature != meta.signature {
            meta.signature = loaded.signature;
            self.registry.put_metadata(txn, name, &meta)?;
        }
        Ok(meta)
    }

    fn build(
        &self,
        internal: &str,
        request: &LoadRequest,
        staging: &Path,
    ) -> ProcedureResult<BuiltArtifact> {
        match self.language {
            Language::Native => self.builder.build(
                internal,
                request.code_kind,
                &request.code_parts,
                &request.filenames,
                staging,
            ),
            Language::Interpreted => match (request.code_kind, request.code_parts.as_slice()) {
                (CodeKind::Py | CodeKind::So, [code]) => Ok(BuiltArtifact::prebuilt(code.clone())),
                (CodeKind::Py, parts) => Err(ProcedureError::internal(format!(
                    "Code type [py] takes exactly one code part, got {}.",
                    parts.len()
                ))),
                (CodeKind::So, parts) => Err(ProcedureError::input(format!(
                    "Code type [so] takes exactly one code part, got {}.",
                    parts.len()
                ))),
                (kind, _) => Err(ProcedureError::input(format!(
                    "Code type [{}] is not supported for interpreted procedures.",
                    kind
                ))),
            },
        }
    }

    fn staging_dir(&self, internal: &str) -> ProcedureResult<TempDir> {
        tempfile::Builder::new()
            .prefix(&format!(".staging_{}_", internal))
            .tempdir_in(&self.plugin_dir)
            .map_err(|e| {
                ProcedureError::internal(format!(
                    "Failed to create staging directory in {}: {}",
                    self.plugin_dir.display(),
                    e
                ))
            })
    }

    fn lookup(&self, name: &str) -> Option<(ProcedureName, ProcedureMetadata)> {
        let name = ProcedureName::new(name).ok()?;
        let meta = self.procedures.read().get(&name).cloned()?;
        Some((name, meta))
    }

    fn remove_artifact(&self, name: &ProcedureName) {
        let path = self.artifact_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                target: "graphproc::manager",
                path = %path.display(),
                error = %e,
                "Failed to remove artifact file"
            ),
        }
    }
}

impl Drop for SingleLanguageManager {
    fn drop(&mut self) {
        if let Err(e) = self.backend.unload_all() {
            warn!(
                target: "graphproc::manager",
                language = %self.language,
                error = %e,
                "Failed to unload procedures"
            );
        }
    }
}
