//! External toolchain invocation
//!
//! Runs compilers, transpilers and archive tools as child processes with a
//! wall-clock deadline.
//!
//! # Design Notes
//!
//! - stdout and stderr are drained by dedicated reader threads into shared
//!   buffers, so a chatty child never blocks on a full pipe and whatever it
//!   wrote before a timeout is still available
//! - the deadline is enforced by polling `try_wait`; on expiry the child is
//!   killed and reaped before the error is returned
//! - commands are argv templates (see [`crate::config`]); programs without a
//!   path separator are resolved on `PATH` up front so a missing tool is
//!   reported as such rather than as an opaque spawn failure

use graphproc_core::ProcedureError;
use parking_lot::Mutex;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const READER_GRACE: Duration = Duration::from_millis(500);

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Everything written to stdout
    pub stdout: String,
    /// Everything written to stderr
    pub stderr: String,
}

/// Toolchain failures
#[derive(Debug, Error)]
pub enum ToolchainError {
    /// Deadline exceeded; the process was killed
    #[error("`{program}` timed out after {timeout:?}")]
    Timeout {
        /// Program that was run
        program: String,
        /// Deadline that elapsed
        timeout: Duration,
        /// stdout captured before the kill
        stdout: String,
        /// stderr captured before the kill
        stderr: String,
    },

    /// Process exited unsuccessfully
    #[error("`{program}` exited with {}", describe_code(*.code))]
    NonZeroExit {
        /// Program that was run
        program: String,
        /// Exit code, `None` when terminated by a signal
        code: Option<i32>,
        /// Captured stdout
        stdout: String,
        /// Captured stderr
        stderr: String,
    },

    /// Process could not be started
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        /// Program that was run
        program: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Template could not be turned into a command line
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("status {}", c),
        None => "a signal".to_string(),
    }
}

impl ToolchainError {
    /// Convert into the error reported to callers, prefixed with `context`
    ///
    /// Timeouts stay timeouts; every other failure is bad input from the
    /// caller's point of view. Captured output is attached verbatim.
    pub fn into_procedure_error(self, context: &str) -> ProcedureError {
        match self {
            ToolchainError::Timeout {
                stdout, stderr, ..
            } => ProcedureError::timeout(ProcedureError::with_output(
                &format!("{}: {}", context, "command timed out"),
                &stdout,
                &stderr,
            )),
            ToolchainError::NonZeroExit {
                ref stdout,
                ref stderr,
                ..
            } => ProcedureError::input(ProcedureError::with_output(
                &format!("{}: {}", context, self),
                stdout,
                stderr,
            )),
            other => ProcedureError::input(format!("{}: {}", context, other)),
        }
    }
}

/// Values substituted into a command template
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    /// `{name}`
    pub name: Option<String>,
    /// `{source}`
    pub source: Option<PathBuf>,
    /// `{sources}`
    pub sources: Vec<PathBuf>,
    /// `{output}`
    pub output: Option<PathBuf>,
    /// `{archive}`
    pub archive: Option<PathBuf>,
    /// `{dir}`
    pub dir: Option<PathBuf>,
}

/// Expand a command template into an argv
///
/// `{sources}` must stand alone as an argument and expands to one argument
/// per source. Other placeholders may appear anywhere inside an argument.
pub fn expand_template(
    template: &[String],
    subs: &Substitutions,
) -> Result<Vec<String>, ToolchainError> {
    if template.is_empty() {
        return Err(ToolchainError::InvalidCommand("empty command".into()));
    }
    let mut argv = Vec::with_capacity(template.len() + subs.sources.len());
    for arg in template {
        if arg == "{sources}" {
            if subs.sources.is_empty() {
                return Err(missing("sources"));
            }
            argv.extend(subs.sources.iter().map(|p| p.display().to_string()));
            continue;
        }
        if arg.contains("{sources}") {
            return Err(ToolchainError::InvalidCommand(format!(
                "{{sources}} must be a whole argument, found in [{}]",
                arg
            )));
        }
        let mut expanded = arg.clone();
        let scalar: [(&str, Option<String>); 5] = [
            ("{name}", subs.name.clone()),
            ("{source}", subs.source.as_ref().map(|p| p.display().to_string())),
            ("{output}", subs.output.as_ref().map(|p| p.display().to_string())),
            ("{archive}", subs.archive.as_ref().map(|p| p.display().to_string())),
            ("{dir}", subs.dir.as_ref().map(|p| p.display().to_string())),
        ];
        for (placeholder, value) in scalar {
            if expanded.contains(placeholder) {
                let value = value.ok_or_else(|| missing(&placeholder[1..placeholder.len() - 1]))?;
                expanded = expanded.replace(placeholder, &value);
            }
        }
        argv.push(expanded);
    }
    Ok(argv)
}

fn missing(placeholder: &str) -> ToolchainError {
    ToolchainError::InvalidCommand(format!(
        "placeholder {{{}}} has no value for this step",
        placeholder
    ))
}

/// Run `argv` in `cwd` with a deadline
pub fn run(
    argv: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<ToolOutput, ToolchainError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ToolchainError::InvalidCommand("empty command".into()))?;
    let resolved = resolve_program(program)?;

    debug!(
        target: "graphproc::toolchain",
        program = %resolved.display(),
        args = ?args,
        cwd = ?cwd,
        "Running toolchain command"
    );

    let mut command = Command::new(&resolved);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    let mut child = command.spawn().map_err(|e| ToolchainError::Spawn {
        program: program.clone(),
        source: e,
    })?;

    let stdout = OutputCollector::start(child.stdout.take());
    let stderr = OutputCollector::start(child.stderr.take());

    let status = match wait_with_deadline(&mut child, timeout) {
        Ok(status) => status,
        Err(e) => {
            return Err(ToolchainError::Spawn {
                program: program.clone(),
                source: e,
            })
        }
    };

    match status {
        Some(status) if status.success() => Ok(ToolOutput {
            stdout: stdout.finish(),
            stderr: stderr.finish(),
        }),
        Some(status) => Err(ToolchainError::NonZeroExit {
            program: program.clone(),
            code: status.code(),
            stdout: stdout.finish(),
            stderr: stderr.finish(),
        }),
        None => {
            warn!(
                target: "graphproc::toolchain",
                program = %program,
                timeout = ?timeout,
                "Toolchain command timed out, killed"
            );
            Err(ToolchainError::Timeout {
                program: program.clone(),
                timeout,
                stdout: stdout.finish(),
                stderr: stderr.finish(),
            })
        }
    }
}

fn resolve_program(program: &str) -> Result<PathBuf, ToolchainError> {
    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        return Ok(PathBuf::from(program));
    }
    which::which(program).map_err(|e| ToolchainError::Spawn {
        program: program.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
    })
}

/// Returns `Ok(None)` when the deadline passed (child killed and reaped).
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Drains one pipe on a background thread
struct OutputCollector {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: Option<JoinHandle<()>>,
}

impl OutputCollector {
    fn start<R: Read + Send + 'static>(pipe: Option<R>) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let handle = pipe.map(|mut pipe| {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                let mut chunk = [0u8; 8192];
                loop {
                    match pipe.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => buf.lock().extend_from_slice(&chunk[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
            })
        });
        OutputCollector { buf, handle }
    }

    /// Wait briefly for the pipe to drain, then return what was read.
    ///
    /// Descendants of the child may keep the pipe open after it exits;
    /// the wait is bounded so they cannot hold the caller.
    fn finish(mut self) -> String {
        if let Some(handle) = self.handle.take() {
            let start = Instant::now();
            while !handle.is_finished() && start.elapsed() < READER_GRACE {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn test_success_captures_both_streams() {
        let out = run(&sh("printf out; printf err >&2"), None, Duration::from_secs(10)).unwrap();
        assert_eq!(out.stdout, "out");
        assert_eq!(out.stderr, "err");
    }

    #[test]
    fn test_non_zero_exit_carries_output() {
        let err = run(
            &sh("echo compiling; echo 'error: missing ;' >&2; exit 3"),
            None,
            Duration::from_secs(10),
        )
        .unwrap_err();
        match err {
            ToolchainError::NonZeroExit {
                code,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(code, Some(3));
                assert!(stdout.contains("compiling"));
                assert!(stderr.contains("missing ;"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_timeout_kills() {
        let start = Instant::now();
        let err = run(
            &sh("echo started; exec sleep 10"),
            None,
            Duration::from_millis(300),
        )
        .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        match err {
            ToolchainError::Timeout { stdout, .. } => assert!(stdout.contains("started")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_timeout_keeps_all_output_written_before_kill() {
        let err = run(
            &sh("head -c 200000 /dev/zero | tr '\\0' e >&2; exec sleep 10"),
            None,
            Duration::from_millis(800),
        )
        .unwrap_err();
        match err {
            ToolchainError::Timeout { stderr, .. } => assert_eq!(stderr.len(), 200000),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_program() {
        let err = run(
            &["graphproc-no-such-tool-xyz".to_string()],
            None,
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, ToolchainError::Spawn { .. }));
    }

    #[test]
    fn test_runs_in_cwd() {
        let dir = tempfile::tempdir().unwrap();
        run(&sh("touch marker"), Some(dir.path()), Duration::from_secs(10)).unwrap();
        assert!(dir.path().join("marker").exists());
    }

    #[test]
    fn test_large_output_does_not_stall() {
        let out = run(
            &sh("i=0; while [ $i -lt 20000 ]; do echo line-$i; i=$((i+1)); done"),
            None,
            Duration::from_secs(30),
        )
        .unwrap();
        assert!(out.stdout.contains("line-19999"));
    }

    #[test]
    fn test_expand_template() {
        let template: Vec<String> = ["cc", "{sources}", "-o", "{output}", "-DNAME={name}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let subs = Substitutions {
            name: Some("_proc_echo".into()),
            sources: vec![PathBuf::from("/s/a.cpp"), PathBuf::from("/s/b.cpp")],
            output: Some(PathBuf::from("/s/out.so")),
            ..Default::default()
        };
        assert_eq!(
            expand_template(&template, &subs).unwrap(),
            vec!["cc", "/s/a.cpp", "/s/b.cpp", "-o", "/s/out.so", "-DNAME=_proc_echo"]
        );
    }

    #[test]
    fn test_expand_template_missing_value() {
        let template = vec!["unzip".to_string(), "{archive}".to_string()];
        let err = expand_template(&template, &Substitutions::default()).unwrap_err();
        assert!(err.to_string().contains("{archive}"));
    }

    #[test]
    fn test_embedded_sources_rejected() {
        let template = vec!["cc".to_string(), "x{sources}".to_string()];
        let subs = Substitutions {
            sources: vec![PathBuf::from("a.cpp")],
            ..Default::default()
        };
        assert!(expand_template(&template, &subs).is_err());
    }

    #[test]
    fn test_error_mapping() {
        let timeout = ToolchainError::Timeout {
            program: "g++".into(),
            timeout: Duration::from_secs(1),
            stdout: String::new(),
            stderr: "partial".into(),
        };
        let err = timeout.into_procedure_error("Failed to compile procedure [echo]");
        assert_eq!(err.kind(), graphproc_core::ErrorKind::Timeout);
        assert!(err.to_string().contains("partial"));

        let exit = ToolchainError::NonZeroExit {
            program: "g++".into(),
            code: Some(1),
            stdout: "o".into(),
            stderr: "e".into(),
        };
        let err = exit.into_procedure_error("Failed to compile procedure [echo]");
        assert_eq!(err.kind(), graphproc_core::ErrorKind::Input);
        assert!(err.to_string().contains("Stderr:----\ne"));
    }

    mod props {
        use super::super::*;
        use proptest::prelude::*;
        use std::path::PathBuf;

        proptest! {
            #[test]
            fn sources_expand_in_place(
                before in proptest::collection::vec("[a-z-]{1,8}", 0..4),
                after in proptest::collection::vec("[a-z-]{1,8}", 0..4),
                files in proptest::collection::vec("[a-z]{1,8}\\.cpp", 1..6),
            ) {
                let mut template = before.clone();
                template.push("{sources}".to_string());
                template.extend(after.iter().cloned());
                let subs = Substitutions {
                    sources: files.iter().map(PathBuf::from).collect(),
                    ..Default::default()
                };
                let argv = expand_template(&template, &subs).unwrap();
                prop_assert_eq!(argv.len(), before.len() + files.len() + after.len());
                prop_assert_eq!(&argv[..before.len()], &before[..]);
                prop_assert_eq!(&argv[before.len()..before.len() + files.len()], &files[..]);
                prop_assert_eq!(&argv[before.len() + files.len()..], &after[..]);
            }
        }
    }
}
