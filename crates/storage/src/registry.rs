//! Code registry: procedure metadata and artifacts in one KV table
//!
//! ## Key scheme
//!
//! | Key | Value |
//! |-----|-------|
//! | `_proc_<name>` | MessagePack-encoded [`ProcedureMetadata`] |
//! | `@so__proc_<name>` | compiled binary (or interpreter module) |
//! | `@zip__proc_<name>` | archive package |
//! | `@cpp__proc_<name>` | merged multi-file source |
//! | `@cython__proc_<name>` | single interpreted source |
//! | `@hash__proc_<name>` | build identifier the binary was produced under |
//!
//! Every key that does not start with `@` is a metadata key. Procedure
//! names cannot contain `@`, so the two spaces never meet.
//!
//! The registry never opens transactions; callers pass the transaction so
//! metadata and artifacts of one load commit together.

use crate::error::StorageResult;
use crate::kv::KvTransaction;
use graphproc_core::{ProcedureMetadata, ProcedureName};
use tracing::warn;

const HASH_PREFIX: &str = "@hash_";

/// Stored form of a procedure's code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Directly loadable binary
    Compiled,
    /// Archive awaiting unpack and build
    Archive,
    /// Merged multi-file C++ source
    MultiFile,
    /// Single interpreted source, transpiled before compiling
    RawSource,
}

impl ArtifactKind {
    /// Probe order used when choosing which stored form to rebuild from
    pub const PRIORITY: [ArtifactKind; 4] = [
        ArtifactKind::Archive,
        ArtifactKind::MultiFile,
        ArtifactKind::RawSource,
        ArtifactKind::Compiled,
    ];

    /// Key prefix for this kind
    pub fn prefix(self) -> &'static str {
        match self {
            ArtifactKind::Compiled => "@so_",
            ArtifactKind::Archive => "@zip_",
            ArtifactKind::MultiFile => "@cpp_",
            ArtifactKind::RawSource => "@cython_",
        }
    }

    /// Label reported as a procedure's code type
    ///
    /// A compiled artifact reports `so_or_py`: the same key holds native
    /// libraries and interpreter modules, and only the caller knows which
    /// language the table belongs to.
    pub fn code_type(self) -> &'static str {
        match self {
            ArtifactKind::Compiled => "so_or_py",
            ArtifactKind::Archive => "zip",
            ArtifactKind::MultiFile => "cpp",
            ArtifactKind::RawSource => "py",
        }
    }

    fn key(self, name: &ProcedureName) -> Vec<u8> {
        format!("{}{}", self.prefix(), name.internal()).into_bytes()
    }
}

/// Typed access to the procedure table of one language
#[derive(Debug, Clone)]
pub struct CodeRegistry {
    table: String,
    build_id: String,
}

impl CodeRegistry {
    /// Registry over `table`, stamping binaries with `build_id`
    pub fn new(table: impl Into<String>, build_id: impl Into<String>) -> Self {
        CodeRegistry {
            table: table.into(),
            build_id: build_id.into(),
        }
    }

    /// Table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Build identifier of the running process
    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// Store metadata for `name`
    pub fn put_metadata(
        &self,
        txn: &mut dyn KvTransaction,
        name: &ProcedureName,
        meta: &ProcedureMetadata,
    ) -> StorageResult<()> {
        let bytes = rmp_serde::to_vec_named(meta)?;
        txn.put(&self.table, name.internal().as_bytes(), &bytes)
    }

    /// Load metadata for `name`
    pub fn get_metadata(
        &self,
        txn: &dyn KvTransaction,
        name: &ProcedureName,
    ) -> StorageResult<Option<ProcedureMetadata>> {
        match txn.get(&self.table, name.internal().as_bytes())? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store one artifact
    ///
    /// Storing the compiled binary also stamps the hash key with the
    /// running build identifier.
    pub fn put_artifact(
        &self,
        txn: &mut dyn KvTransaction,
        name: &ProcedureName,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> StorageResult<()> {
        txn.put(&self.table, &kind.key(name), bytes)?;
        if kind == ArtifactKind::Compiled {
            txn.put(&self.table, &hash_key(name), self.build_id.as_bytes())?;
        }
        Ok(())
    }

    /// Load one artifact
    pub fn get_artifact(
        &self,
        txn: &dyn KvTransaction,
        name: &ProcedureName,
        kind: ArtifactKind,
    ) -> StorageResult<Option<Vec<u8>>> {
        txn.get(&self.table, &kind.key(name))
    }

    /// Remove metadata, every artifact and the hash of `name`
    ///
    /// Returns whether metadata existed.
    pub fn delete_all(
        &self,
        txn: &mut dyn KvTransaction,
        name: &ProcedureName,
    ) -> StorageResult<bool> {
        let existed = txn.delete(&self.table, name.internal().as_bytes())?;
        for kind in ArtifactKind::PRIORITY {
            txn.delete(&self.table, &kind.key(name))?;
        }
        txn.delete(&self.table, &hash_key(name))?;
        Ok(existed)
    }

    /// Drop the whole table
    pub fn drop_all(&self, txn: &mut dyn KvTransaction) -> StorageResult<()> {
        txn.drop_table(&self.table)
    }

    /// Names of every stored procedure
    pub fn scan_names(&self, txn: &dyn KvTransaction) -> StorageResult<Vec<ProcedureName>> {
        let mut names = Vec::new();
        for key in txn.scan_keys(&self.table)? {
            if key.first() == Some(&b'@') {
                continue;
            }
            let parsed = std::str::from_utf8(&key)
                .ok()
                .and_then(ProcedureName::from_internal);
            match parsed {
                Some(name) => names.push(name),
                None => warn!(
                    target: "graphproc::storage",
                    table = %self.table,
                    key = %String::from_utf8_lossy(&key),
                    "Skipping unrecognized registry key"
                ),
            }
        }
        Ok(names)
    }

    /// Whether the stored binary was produced by the running build
    pub fn is_build_current(
        &self,
        txn: &dyn KvTransaction,
        name: &ProcedureName,
    ) -> StorageResult<bool> {
        Ok(txn
            .get(&self.table, &hash_key(name))?
            .map_or(false, |h| h == self.build_id.as_bytes()))
    }

    /// Highest-priority stored form of `name`
    pub fn source_variant(
        &self,
        txn: &dyn KvTransaction,
        name: &ProcedureName,
    ) -> StorageResult<Option<ArtifactKind>> {
        for kind in ArtifactKind::PRIORITY {
            if txn.get(&self.table, &kind.key(name))?.is_some() {
                return Ok(Some(kind));
            }
        }
        Ok(None)
    }

    /// Every stored form of `name`, in priority order
    pub fn variants_present(
        &self,
        txn: &dyn KvTransaction,
        name: &ProcedureName,
    ) -> StorageResult<Vec<ArtifactKind>> {
        let mut present = Vec::new();
        for kind in ArtifactKind::PRIORITY {
            if txn.get(&self.table, &kind.key(name))?.is_some() {
                present.push(kind);
            }
        }
        Ok(present)
    }
}

fn hash_key(name: &ProcedureName) -> Vec<u8> {
    format!("{}{}", HASH_PREFIX, name.internal()).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvEngine;
    use crate::memory::MemoryEngine;
    use graphproc_core::{ApiVersion, Language};

    fn name(n: &str) -> ProcedureName {
        ProcedureName::new(n).unwrap()
    }

    fn meta(n: &str) -> ProcedureMetadata {
        ProcedureMetadata {
            name: n.to_string(),
            description: "test".into(),
            read_only: true,
            language: Language::Native,
            version: ApiVersion::V1,
            signature: None,
            content_hash: "build-1".into(),
        }
    }

    #[test]
    fn test_key_layout() {
        let engine = MemoryEngine::new();
        let registry = CodeRegistry::new("cpp_plugins", "build-1");
        let echo = name("echo");

        let mut txn = engine.begin_write().unwrap();
        registry.put_metadata(txn.as_mut(), &echo, &meta("echo")).unwrap();
        registry
            .put_artifact(txn.as_mut(), &echo, ArtifactKind::Compiled, b"\x7fELF")
            .unwrap();
        registry
            .put_artifact(txn.as_mut(), &echo, ArtifactKind::MultiFile, b"//a.cpp\n")
            .unwrap();
        let keys: Vec<String> = txn
            .scan_keys("cpp_plugins")
            .unwrap()
            .into_iter()
            .map(|k| String::from_utf8(k).unwrap())
            .collect();
        assert_eq!(
            keys,
            vec![
                "@cpp__proc_echo",
                "@hash__proc_echo",
                "@so__proc_echo",
                "_proc_echo"
            ]
        );
    }

    #[test]
    fn test_metadata_round_trip() {
        let engine = MemoryEngine::new();
        let registry = CodeRegistry::new("t", "b");
        let mut txn = engine.begin_write().unwrap();
        registry
            .put_metadata(txn.as_mut(), &name("echo"), &meta("echo"))
            .unwrap();
        assert_eq!(
            registry.get_metadata(txn.as_ref(), &name("echo")).unwrap(),
            Some(meta("echo"))
        );
        assert_eq!(registry.get_metadata(txn.as_ref(), &name("nope")).unwrap(), None);
    }

    #[test]
    fn test_scan_skips_artifacts() {
        let engine = MemoryEngine::new();
        let registry = CodeRegistry::new("t", "b");
        let mut txn = engine.begin_write().unwrap();
        for n in ["b", "a"] {
            registry.put_metadata(txn.as_mut(), &name(n), &meta(n)).unwrap();
            registry
                .put_artifact(txn.as_mut(), &name(n), ArtifactKind::Compiled, b"x")
                .unwrap();
        }
        txn.put("t", b"stray", b"?").unwrap();
        let names = registry.scan_names(txn.as_ref()).unwrap();
        assert_eq!(names, vec![name("a"), name("b")]);
    }

    #[test]
    fn test_build_identity() {
        let engine = MemoryEngine::new();
        let old = CodeRegistry::new("t", "build-1");
        let new = CodeRegistry::new("t", "build-2");
        let mut txn = engine.begin_write().unwrap();
        assert!(!old.is_build_current(txn.as_ref(), &name("p")).unwrap());
        old.put_artifact(txn.as_mut(), &name("p"), ArtifactKind::Compiled, b"x")
            .unwrap();
        assert!(old.is_build_current(txn.as_ref(), &name("p")).unwrap());
        assert!(!new.is_build_current(txn.as_ref(), &name("p")).unwrap());
    }

    #[test]
    fn test_source_priority() {
        let engine = MemoryEngine::new();
        let registry = CodeRegistry::new("t", "b");
        let p = name("p");
        let mut txn = engine.begin_write().unwrap();
        assert_eq!(registry.source_variant(txn.as_ref(), &p).unwrap(), None);

        registry
            .put_artifact(txn.as_mut(), &p, ArtifactKind::Compiled, b"so")
            .unwrap();
        assert_eq!(
            registry.source_variant(txn.as_ref(), &p).unwrap(),
            Some(ArtifactKind::Compiled)
        );
        registry
            .put_artifact(txn.as_mut(), &p, ArtifactKind::RawSource, b"py")
            .unwrap();
        assert_eq!(
            registry.source_variant(txn.as_ref(), &p).unwrap(),
            Some(ArtifactKind::RawSource)
        );
        registry
            .put_artifact(txn.as_mut(), &p, ArtifactKind::Archive, b"zip")
            .unwrap();
        assert_eq!(
            registry.source_variant(txn.as_ref(), &p).unwrap(),
            Some(ArtifactKind::Archive)
        );
        assert_eq!(
            registry.variants_present(txn.as_ref(), &p).unwrap(),
            vec![
                ArtifactKind::Archive,
                ArtifactKind::RawSource,
                ArtifactKind::Compiled
            ]
        );
    }

    #[test]
    fn test_delete_all_is_total() {
        let engine = MemoryEngine::new();
        let registry = CodeRegistry::new("t", "b");
        let p = name("p");
        let mut txn = engine.begin_write().unwrap();
        registry.put_metadata(txn.as_mut(), &p, &meta("p")).unwrap();
        for kind in ArtifactKind::PRIORITY {
            registry.put_artifact(txn.as_mut(), &p, kind, b"x").unwrap();
        }
        assert!(registry.delete_all(txn.as_mut(), &p).unwrap());
        assert!(txn.scan_keys("t").unwrap().is_empty());
        assert!(!registry.delete_all(txn.as_mut(), &p).unwrap());
    }

    #[test]
    fn test_code_type_labels() {
        assert_eq!(ArtifactKind::Archive.code_type(), "zip");
        assert_eq!(ArtifactKind::MultiFile.code_type(), "cpp");
        assert_eq!(ArtifactKind::RawSource.code_type(), "py");
        assert_eq!(ArtifactKind::Compiled.code_type(), "so_or_py");
    }
}
