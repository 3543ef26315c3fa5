//! Build pipelines turning supplied code into a loadable artifact
//!
//! | Code kind | Pipeline | Stored source |
//! |-----------|----------|---------------|
//! | `So` | none, bytes are the artifact | none |
//! | `Py` | transpile, then compile | `@cython_` |
//! | `Cpp` | stage every file, compile together | `@cpp_` (merged bundle) |
//! | `Zip` | unpack, build in place, pick the one produced binary | `@zip_` |
//!
//! All work happens inside a staging directory owned by the caller, so every
//! exit path cleans up by dropping that directory.

use crate::config::ToolchainConfig;
use crate::toolchain::{self, expand_template, Substitutions};
use graphproc_core::{CodeKind, ProcedureError, ProcedureResult};
use graphproc_storage::{merge_files, split_files, validate_file_name, ArtifactKind, SourceFile};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Result of a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArtifact {
    /// Loadable artifact
    pub binary: Vec<u8>,
    /// Source form to keep in the registry, if any
    pub source: Option<(ArtifactKind, Vec<u8>)>,
}

impl BuiltArtifact {
    /// Artifact supplied ready to load
    pub fn prebuilt(binary: Vec<u8>) -> Self {
        BuiltArtifact {
            binary,
            source: None,
        }
    }
}

/// Runs the toolchain steps of each pipeline
#[derive(Debug, Clone)]
pub struct Builder {
    config: ToolchainConfig,
}

impl Builder {
    /// Builder using the given command templates
    pub fn new(config: ToolchainConfig) -> Self {
        Builder { config }
    }

    /// Toolchain settings in effect
    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    /// Build a native procedure from freshly supplied code
    ///
    /// `name` is the internal procedure name; it names staged files and the
    /// transpiled module.
    pub fn build(
        &self,
        name: &str,
        kind: CodeKind,
        parts: &[Vec<u8>],
        filenames: &[String],
        staging: &Path,
    ) -> ProcedureResult<BuiltArtifact> {
        match kind {
            CodeKind::So => {
                let binary = single_part(parts, "so", ProcedureError::input)?;
                Ok(BuiltArtifact::prebuilt(binary.to_vec()))
            }
            CodeKind::Py => {
                let source = single_part(parts, "py", ProcedureError::internal)?;
                let binary = self.compile_py(name, source, staging)?;
                Ok(BuiltArtifact {
                    binary,
                    source: Some((ArtifactKind::RawSource, source.to_vec())),
                })
            }
            CodeKind::Cpp => {
                if filenames.len() != parts.len() {
                    return Err(ProcedureError::input(format!(
                        "Got {} code parts but {} file names.",
                        parts.len(),
                        filenames.len()
                    )));
                }
                let files: Vec<SourceFile> = filenames
                    .iter()
                    .zip(parts)
                    .map(|(n, c)| SourceFile::new(n.clone(), c.clone()))
                    .collect();
                let merged = merge_files(&files)
                    .map_err(|e| ProcedureError::input(format!("Invalid source files: {}", e)))?;
                let binary = self.compile_cpp(name, &files, staging)?;
                Ok(BuiltArtifact {
                    binary,
                    source: Some((ArtifactKind::MultiFile, merged)),
                })
            }
            CodeKind::Zip => {
                let archive = single_part(parts, "zip", ProcedureError::input)?;
                let binary = self.build_archive(name, archive, staging)?;
                Ok(BuiltArtifact {
                    binary,
                    source: Some((ArtifactKind::Archive, archive.to_vec())),
                })
            }
        }
    }

    /// Rebuild the artifact of `name` from a stored source form
    pub fn rebuild(
        &self,
        name: &str,
        kind: ArtifactKind,
        stored: &[u8],
        staging: &Path,
    ) -> ProcedureResult<Vec<u8>> {
        match kind {
            ArtifactKind::Compiled => Ok(stored.to_vec()),
            ArtifactKind::RawSource => self.compile_py(name, stored, staging),
            ArtifactKind::MultiFile => {
                let files = split_files(stored).map_err(|e| {
                    ProcedureError::internal(format!("Stored source bundle is corrupt: {}", e))
                })?;
                self.compile_cpp(name, &files, staging)
            }
            ArtifactKind::Archive => self.build_archive(name, stored, staging),
        }
    }

    /// Stage `files` and compile them into one shared library
    pub fn compile_cpp(
        &self,
        name: &str,
        files: &[SourceFile],
        staging: &Path,
    ) -> ProcedureResult<Vec<u8>> {
        if files.is_empty() {
            return Err(ProcedureError::input("No source files supplied."));
        }
        let src_dir = make_dir(staging, "cpp")?;
        let mut sources = Vec::with_capacity(files.len());
        for file in files {
            validate_file_name(&file.name)
                .map_err(|e| ProcedureError::input(format!("Invalid source files: {}", e)))?;
            let path = src_dir.join(&file.name);
            if sources.contains(&path) {
                return Err(ProcedureError::input(format!(
                    "Source file [{}] supplied twice.",
                    file.name
                )));
            }
            write_file(&path, &file.content)?;
            sources.push(path);
        }
        let output = staging.join(format!("{}.{}", name, self.config.binary_extension));
        let subs = Substitutions {
            name: Some(name.to_string()),
            sources,
            output: Some(output.clone()),
            dir: Some(src_dir.clone()),
            ..Default::default()
        };
        self.step(&self.config.cpp_compile, &subs, Some(&src_dir), name, "compile")?;
        read_output(&output, name)
    }

    /// Transpile an interpreted source and compile the result
    pub fn compile_py(&self, name: &str, source: &[u8], staging: &Path) -> ProcedureResult<Vec<u8>> {
        let src_dir = make_dir(staging, "py")?;
        let py_path = src_dir.join(format!("{}.py", name));
        let cpp_path = src_dir.join(format!("{}.cpp", name));
        write_file(&py_path, source)?;

        let transpile = Substitutions {
            name: Some(name.to_string()),
            source: Some(py_path),
            output: Some(cpp_path.clone()),
            dir: Some(src_dir.clone()),
            ..Default::default()
        };
        self.step(&self.config.py_transpile, &transpile, Some(&src_dir), name, "transpile")?;
        if !cpp_path.exists() {
            return Err(ProcedureError::input(format!(
                "Transpiling procedure [{}] produced no output.",
                name
            )));
        }

        let output = staging.join(format!("{}.{}", name, self.config.binary_extension));
        let compile = Substitutions {
            name: Some(name.to_string()),
            source: Some(cpp_path.clone()),
            sources: vec![cpp_path],
            output: Some(output.clone()),
            dir: Some(src_dir.clone()),
            ..Default::default()
        };
        self.step(&self.config.py_compile, &compile, Some(&src_dir), name, "compile")?;
        read_output(&output, name)
    }

    /// Unpack an archive, build it, and return the single binary it produced
    pub fn build_archive(
        &self,
        name: &str,
        archive: &[u8],
        staging: &Path,
    ) -> ProcedureResult<Vec<u8>> {
        let archive_path = staging.join(format!("{}.archive", name));
        write_file(&archive_path, archive)?;
        let unpack_dir = make_dir(staging, "unpacked")?;

        let subs = Substitutions {
            name: Some(name.to_string()),
            archive: Some(archive_path),
            dir: Some(unpack_dir.clone()),
            ..Default::default()
        };
        self.step(&self.config.zip_unpack, &subs, Some(staging), name, "unpack")?;
        self.step(&self.config.zip_build, &subs, Some(&unpack_dir), name, "build")?;

        let mut found = Vec::new();
        find_with_extension(&unpack_dir, &self.config.binary_extension, &mut found)?;
        match found.len() {
            1 => read_output(&found[0], name),
            0 => Err(ProcedureError::input(format!(
                "Building procedure [{}] produced no .{} file.",
                name, self.config.binary_extension
            ))),
            n => Err(ProcedureError::input(format!(
                "Building procedure [{}] produced {} .{} files, expected exactly one: {}",
                name,
                n,
                self.config.binary_extension,
                found
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    fn step(
        &self,
        template: &[String],
        subs: &Substitutions,
        cwd: Option<&Path>,
        name: &str,
        what: &str,
    ) -> ProcedureResult<()> {
        let context = format!("Failed to {} procedure [{}]", what, name);
        let argv = expand_template(template, subs).map_err(|e| e.into_procedure_error(&context))?;
        let output = toolchain::run(&argv, cwd, self.config.timeout())
            .map_err(|e| e.into_procedure_error(&context))?;
        debug!(
            target: "graphproc::toolchain",
            procedure = %name,
            step = what,
            stderr_len = output.stderr.len(),
            "Toolchain step finished"
        );
        Ok(())
    }
}

fn single_part<'a>(
    parts: &'a [Vec<u8>],
    kind: &str,
    too_many: fn(String) -> ProcedureError,
) -> ProcedureResult<&'a [u8]> {
    match parts {
        [one] => Ok(one),
        [] => Err(ProcedureError::input("Code cannot be empty.")),
        _ => Err(too_many(format!(
            "Code type [{}] takes exactly one code part, got {}.",
            kind,
            parts.len()
        ))),
    }
}

fn make_dir(parent: &Path, name: &str) -> ProcedureResult<PathBuf> {
    let dir = parent.join(name);
    std::fs::create_dir_all(&dir).map_err(|e| {
        ProcedureError::internal(format!(
            "Failed to create staging directory {}: {}",
            dir.display(),
            e
        ))
    })?;
    Ok(dir)
}

fn write_file(path: &Path, bytes: &[u8]) -> ProcedureResult<()> {
    std::fs::write(path, bytes).map_err(|e| {
        ProcedureError::internal(format!("Failed to write {}: {}", path.display(), e))
    })
}

fn read_output(path: &Path, name: &str) -> ProcedureResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        ProcedureError::input(format!(
            "Build of procedure [{}] did not produce {}: {}",
            name,
            path.display(),
            e
        ))
    })
}

fn find_with_extension(dir: &Path, ext: &str, found: &mut Vec<PathBuf>) -> ProcedureResult<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        ProcedureError::internal(format!("Failed to scan {}: {}", dir.display(), e))
    })?;
    for entry in entries {
        let path = entry
            .map_err(|e| ProcedureError::internal(format!("Failed to scan {}: {}", dir.display(), e)))?
            .path();
        if path.is_dir() {
            find_with_extension(&path, ext, found)?;
        } else if path.extension().map_or(false, |e| e == ext) {
            found.push(path);
        }
    }
    found.sort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphproc_core::ErrorKind;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    /// Toolchain where "compiling" concatenates the sources.
    fn shell_toolchain() -> ToolchainConfig {
        ToolchainConfig {
            cpp_compile: argv(&["sh", "-c", "cat \"$@\" > \"$0\"", "{output}", "{sources}"]),
            py_transpile: argv(&["sh", "-c", "cp \"$0\" \"$1\"", "{source}", "{output}"]),
            py_compile: argv(&["sh", "-c", "cat \"$@\" > \"$0\"", "{output}", "{sources}"]),
            zip_unpack: argv(&["sh", "-c", "cp \"$0\" \"$1/build.sh\"", "{archive}", "{dir}"]),
            zip_build: argv(&["sh", "build.sh"]),
            binary_extension: "so".into(),
            timeout_seconds: 10,
        }
    }

    #[test]
    fn test_so_is_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Builder::new(shell_toolchain());
        let built = builder
            .build("_proc_p", CodeKind::So, &[b"\x7fELF".to_vec()], &[], dir.path())
            .unwrap();
        assert_eq!(built, BuiltArtifact::prebuilt(b"\x7fELF".to_vec()));
    }

    #[test]
    fn test_cpp_compiles_all_files_and_keeps_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Builder::new(shell_toolchain());
        let parts = vec![b"int a;\n".to_vec(), b"int b;\n".to_vec()];
        let names = vec!["a.cpp".to_string(), "b.cpp".to_string()];
        let built = builder
            .build("_proc_p", CodeKind::Cpp, &parts, &names, dir.path())
            .unwrap();
        assert_eq!(built.binary, b"int a;\nint b;\n");
        let (kind, bundle) = built.source.unwrap();
        assert_eq!(kind, ArtifactKind::MultiFile);
        assert_eq!(
            split_files(&bundle).unwrap(),
            vec![SourceFile::new("a.cpp", "int a;\n"), SourceFile::new("b.cpp", "int b;\n")]
        );
    }

    #[test]
    fn test_cpp_name_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Builder::new(shell_toolchain());
        let err = builder
            .build("_proc_p", CodeKind::Cpp, &[b"x".to_vec()], &[], dir.path())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[test]
    fn test_cpp_duplicate_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Builder::new(shell_toolchain());
        let files = vec![SourceFile::new("a.cpp", "1"), SourceFile::new("a.cpp", "2")];
        assert!(builder.compile_cpp("_proc_p", &files, dir.path()).is_err());
    }

    #[test]
    fn test_py_requires_one_part() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Builder::new(shell_toolchain());
        let err = builder
            .build(
                "_proc_p",
                CodeKind::Py,
                &[b"a".to_vec(), b"b".to_vec()],
                &[],
                dir.path(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);

        let err = builder
            .build(
                "_proc_p",
                CodeKind::Zip,
                &[b"a".to_vec(), b"b".to_vec()],
                &[],
                dir.path(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
    }

    #[test]
    fn test_py_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Builder::new(shell_toolchain());
        let built = builder
            .build("_proc_p", CodeKind::Py, &[b"print(1)".to_vec()], &[], dir.path())
            .unwrap();
        assert_eq!(built.binary, b"print(1)");
        assert_eq!(
            built.source,
            Some((ArtifactKind::RawSource, b"print(1)".to_vec()))
        );
    }

    #[test]
    fn test_archive_exactly_one_binary() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Builder::new(shell_toolchain());

        let one = b"printf lib > libp.so".to_vec();
        let built = builder
            .build("_proc_p", CodeKind::Zip, &[one.clone()], &[], dir.path())
            .unwrap();
        assert_eq!(built.binary, b"lib");
        assert_eq!(built.source, Some((ArtifactKind::Archive, one)));

        let dir = tempfile::tempdir().unwrap();
        let none = b"true".to_vec();
        let err = builder
            .build("_proc_p", CodeKind::Zip, &[none], &[], dir.path())
            .unwrap_err();
        assert!(err.to_string().contains("no .so"));

        let dir = tempfile::tempdir().unwrap();
        let two = b"mkdir out; touch a.so out/b.so".to_vec();
        let err = builder
            .build("_proc_p", CodeKind::Zip, &[two], &[], dir.path())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
        assert!(err.to_string().contains("expected exactly one"));
    }

    #[test]
    fn test_failed_compile_carries_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = shell_toolchain();
        config.cpp_compile = argv(&["sh", "-c", "echo 'a.cpp:1: error: boom' >&2; exit 1"]);
        let builder = Builder::new(config);
        let err = builder
            .build(
                "_proc_p",
                CodeKind::Cpp,
                &[b"x".to_vec()],
                &["a.cpp".to_string()],
                dir.path(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Input);
        assert!(err.to_string().contains("Failed to compile procedure [_proc_p]"));
        assert!(err.to_string().contains("error: boom"));
    }

    #[test]
    fn test_rebuild_from_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Builder::new(shell_toolchain());
        let bundle = merge_files(&[SourceFile::new("m.cpp", "int m;")]).unwrap();
        let binary = builder
            .rebuild("_proc_p", ArtifactKind::MultiFile, &bundle, dir.path())
            .unwrap();
        assert_eq!(binary, b"int m;");
        assert_eq!(
            builder
                .rebuild("_proc_p", ArtifactKind::Compiled, b"raw", dir.path())
                .unwrap(),
            b"raw"
        );
    }
}
