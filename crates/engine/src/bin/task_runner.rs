//! Interpreter worker process.
//!
//! Reads `TaskInput` messages from its request queue (stdin) and answers each
//! with one `TaskOutput` on its response queue (stdout). Every task runs
//! `<interpreter> <plugin_dir>/<module>.py` as a child process:
//!
//! - the task input is written to the child's stdin
//! - the child's stdout is the procedure output
//! - `GRAPHPROC_MODE` is `load` when the host is validating the module and
//!   `call` otherwise; in load mode a module may print its signature as JSON
//!
//! Logs go to stderr, filtered by `GRAPHPROC_LOG` (default `warn`).

use clap::Parser;
use graphproc_core::{ProcedureError, ProcedureName, SigSpec, MAX_TASK_OUTPUT};
use graphproc_wire::{
    QueueReader, QueueWriter, TaskInput, TaskOutput, TaskStatus, LOAD_MODULE_FUNCTION,
};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode, ExitStatus, Stdio};
use std::thread;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

/// Worker command line, as passed by the worker pool.
#[derive(Parser, Debug)]
#[command(name = "graphproc-task-runner")]
#[command(about = "Runs interpreted graphproc procedures for a worker pool")]
struct Args {
    /// Name of the request queue (read from stdin)
    #[arg(long)]
    request_queue: String,

    /// Name of the response queue (written to stdout)
    #[arg(long)]
    response_queue: String,

    /// Database directory exposed to procedures
    #[arg(long, value_name = "PATH")]
    db_dir: PathBuf,

    /// Interpreter modules are run with
    #[arg(long, default_value = "python3")]
    interpreter: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("GRAPHPROC_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .try_init();

    match serve(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(
                target: "graphproc::worker",
                queue = %args.request_queue,
                error = %e,
                "Worker stopped"
            );
            ExitCode::FAILURE
        }
    }
}

fn serve(args: &Args) -> graphproc_wire::WireResult<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut requests = QueueReader::new(args.request_queue.clone(), stdin.lock());
    let mut responses = QueueWriter::new(args.response_queue.clone(), stdout.lock());
    while let Some(task) = requests.recv::<TaskInput>()? {
        debug!(
            target: "graphproc::worker",
            function = %task.function,
            user = %task.user,
            "Running task"
        );
        let output = run_task(args, &task);
        responses.send(&output)?;
    }
    Ok(())
}

fn run_task(args: &Args, task: &TaskInput) -> TaskOutput {
    if task.function == LOAD_MODULE_FUNCTION {
        let module = String::from_utf8_lossy(&task.input).into_owned();
        load_module(args, task, &module)
    } else {
        call_module(args, task)
    }
}

fn module_path(plugin_dir: &str, module: &str) -> Option<PathBuf> {
    let name = ProcedureName::from_internal(module)?;
    ProcedureName::validate(name.as_str()).ok()?;
    Some(Path::new(plugin_dir).join(format!("{}.py", module)))
}

fn load_module(args: &Args, task: &TaskInput, module: &str) -> TaskOutput {
    let Some(path) = module_path(&task.plugin_dir, module).filter(|p| p.is_file()) else {
        return failure(
            TaskStatus::InputErr,
            format!("Module [{}] not found in {}.", module, task.plugin_dir),
        );
    };
    let run = match run_interpreter(args, task, &path, "load", &[]) {
        Ok(run) => run,
        Err(e) => {
            return failure(
                TaskStatus::InternalErr,
                format!("Failed to start interpreter: {}", e),
            )
        }
    };
    if !run.status.success() {
        return failure(
            TaskStatus::InputErr,
            run.describe(&format!("Module [{}] failed to load.", module)),
        );
    }
    if run.stdout.iter().all(u8::is_ascii_whitespace) {
        return TaskOutput::success(Vec::new());
    }
    match SigSpec::from_json(&run.stdout) {
        Ok(_) => TaskOutput::new(TaskStatus::SuccessWithSignature, run.stdout),
        Err(e) => failure(TaskStatus::InputErr, e.to_string()),
    }
}

fn call_module(args: &Args, task: &TaskInput) -> TaskOutput {
    let Some(path) = module_path(&task.plugin_dir, &task.function).filter(|p| p.is_file()) else {
        return failure(
            TaskStatus::InternalErr,
            format!("Module [{}] not found in {}.", task.function, task.plugin_dir),
        );
    };
    let run = match run_interpreter(args, task, &path, "call", &task.input) {
        Ok(run) => run,
        Err(e) => {
            return failure(
                TaskStatus::InternalErr,
                format!("Failed to start interpreter: {}", e),
            )
        }
    };
    if run.status.success() {
        return TaskOutput::success(run.stdout);
    }
    match run.status.code() {
        // The procedure reported a failure: its message is its output.
        Some(_) => {
            let message = if run.stdout.is_empty() {
                run.stderr.trim_end().to_string()
            } else {
                String::from_utf8_lossy(&run.stdout).into_owned()
            };
            failure(TaskStatus::InputErr, message)
        }
        None => failure(
            TaskStatus::InternalErr,
            run.describe(&format!("Procedure [{}] was terminated by a signal.", task.function)),
        ),
    }
}

fn failure(status: TaskStatus, message: String) -> TaskOutput {
    TaskOutput::new(status, message.into_bytes())
}

struct InterpreterRun {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: String,
}

impl InterpreterRun {
    fn describe(&self, msg: &str) -> String {
        ProcedureError::with_output(msg, &String::from_utf8_lossy(&self.stdout), &self.stderr)
    }
}

fn run_interpreter(
    args: &Args,
    task: &TaskInput,
    module: &Path,
    mode: &str,
    input: &[u8],
) -> io::Result<InterpreterRun> {
    let mut child = Command::new(&args.interpreter)
        .arg(module)
        .env("GRAPHPROC_MODE", mode)
        .env("GRAPHPROC_USER", &task.user)
        .env("GRAPHPROC_GRAPH", &task.graph)
        .env("GRAPHPROC_DB_DIR", &args.db_dir)
        .env("GRAPHPROC_READ_ONLY", if task.read_only { "1" } else { "0" })
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdin = child.stdin.take();
    let input = input.to_vec();
    let feeder = thread::spawn(move || {
        if let Some(pipe) = stdin.as_mut() {
            // The module may exit without reading its input.
            let _ = pipe.write_all(&input);
        }
    });
    let stderr_pipe = child.stderr.take();
    let stderr_reader = thread::spawn(move || {
        let mut text = Vec::new();
        if let Some(mut pipe) = stderr_pipe {
            let _ = pipe.read_to_end(&mut text);
        }
        String::from_utf8_lossy(&text).into_owned()
    });

    let mut stdout = Vec::new();
    if let Some(pipe) = child.stdout.take() {
        let mut limited = pipe.take(MAX_TASK_OUTPUT as u64 + 1);
        limited.read_to_end(&mut stdout)?;
        if stdout.len() > MAX_TASK_OUTPUT {
            stdout.truncate(MAX_TASK_OUTPUT);
            warn!(
                target: "graphproc::worker",
                module = %module.display(),
                limit = MAX_TASK_OUTPUT,
                "Procedure output truncated"
            );
            io::copy(&mut limited.into_inner(), &mut io::sink())?;
        }
    }

    let status = child.wait()?;
    let _ = feeder.join();
    let stderr = stderr_reader.join().unwrap_or_default();
    Ok(InterpreterRun {
        status,
        stdout,
        stderr,
    })
}
