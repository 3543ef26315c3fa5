//! Code registry over a persisted engine image

use graphproc_core::{ApiVersion, Language, ProcedureMetadata, ProcedureName};
use graphproc_storage::{
    merge_files, split_files, ArtifactKind, CodeRegistry, KvEngine, MemoryEngine, SourceFile,
};
use std::sync::{Arc, Barrier};
use std::thread;

fn meta(name: &str) -> ProcedureMetadata {
    ProcedureMetadata {
        name: name.to_string(),
        description: format!("{} procedure", name),
        read_only: true,
        language: Language::Native,
        version: ApiVersion::V1,
        signature: None,
        content_hash: "b1".to_string(),
    }
}

fn name(s: &str) -> ProcedureName {
    ProcedureName::new(s).unwrap()
}

#[test]
fn registry_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("procedures.gpkv");
    let registry = CodeRegistry::new("native_plugins", "b1");
    let files = vec![
        SourceFile::new("main.cpp", "int main;"),
        SourceFile::new("util.h", "#pragma once"),
    ];

    {
        let engine = MemoryEngine::open(&image).unwrap();
        let mut txn = engine.begin_write().unwrap();
        registry.put_metadata(&mut *txn, &name("bfs"), &meta("bfs")).unwrap();
        registry
            .put_artifact(&mut *txn, &name("bfs"), ArtifactKind::Compiled, b"\x7fELF")
            .unwrap();
        registry
            .put_artifact(
                &mut *txn,
                &name("bfs"),
                ArtifactKind::MultiFile,
                &merge_files(&files).unwrap(),
            )
            .unwrap();
        txn.commit().unwrap();

        // Never committed
        let mut txn = engine.begin_write().unwrap();
        registry.put_metadata(&mut *txn, &name("lost"), &meta("lost")).unwrap();
    }

    let engine = MemoryEngine::open(&image).unwrap();
    let txn = engine.begin_read().unwrap();
    assert_eq!(registry.scan_names(&*txn).unwrap(), vec![name("bfs")]);
    assert_eq!(registry.get_metadata(&*txn, &name("bfs")).unwrap(), Some(meta("bfs")));
    assert!(registry.is_build_current(&*txn, &name("bfs")).unwrap());
    assert_eq!(
        registry.source_variant(&*txn, &name("bfs")).unwrap(),
        Some(ArtifactKind::MultiFile)
    );
    let merged = registry
        .get_artifact(&*txn, &name("bfs"), ArtifactKind::MultiFile)
        .unwrap()
        .unwrap();
    assert_eq!(split_files(&merged).unwrap(), files);

    let newer = CodeRegistry::new("native_plugins", "b2");
    assert!(!newer.is_build_current(&*txn, &name("bfs")).unwrap());
}

#[test]
fn readers_see_whole_commits() {
    let engine = Arc::new(MemoryEngine::new());
    let registry = CodeRegistry::new("interpreted_plugins", "b1");
    let writers = 4;
    let per_writer = 25;
    let barrier = Barrier::new(writers + 1);

    thread::scope(|s| {
        for w in 0..writers {
            let engine = &engine;
            let registry = &registry;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for i in 0..per_writer {
                    let n = name(&format!("p{}_{}", w, i));
                    let mut txn = engine.begin_write().unwrap();
                    registry.put_metadata(&mut *txn, &n, &meta(n.as_str())).unwrap();
                    registry
                        .put_artifact(&mut *txn, &n, ArtifactKind::Compiled, b"bin")
                        .unwrap();
                    txn.commit().unwrap();
                }
            });
        }

        let engine = &engine;
        let registry = &registry;
        let barrier = &barrier;
        s.spawn(move || {
            barrier.wait();
            for _ in 0..50 {
                let txn = engine.begin_read().unwrap();
                for n in registry.scan_names(&*txn).unwrap() {
                    // Metadata and binary land in the same commit
                    assert_eq!(
                        registry
                            .get_artifact(&*txn, &n, ArtifactKind::Compiled)
                            .unwrap()
                            .as_deref(),
                        Some(&b"bin"[..])
                    );
                }
            }
        });
    });

    let txn = engine.begin_read().unwrap();
    assert_eq!(registry.scan_names(&*txn).unwrap().len(), writers * per_writer);
}

#[test]
fn drop_all_clears_only_its_table() {
    let engine = MemoryEngine::new();
    let native = CodeRegistry::new("native_plugins", "b1");
    let interpreted = CodeRegistry::new("interpreted_plugins", "b1");

    let mut txn = engine.begin_write().unwrap();
    native.put_metadata(&mut *txn, &name("a"), &meta("a")).unwrap();
    interpreted.put_metadata(&mut *txn, &name("b"), &meta("b")).unwrap();
    txn.commit().unwrap();

    let mut txn = engine.begin_write().unwrap();
    native.drop_all(&mut *txn).unwrap();
    txn.commit().unwrap();

    let txn = engine.begin_read().unwrap();
    assert!(native.scan_names(&*txn).unwrap().is_empty());
    assert_eq!(interpreted.scan_names(&*txn).unwrap(), vec![name("b")]);
}
