//! One interpreter worker process
//!
//! A worker is a child process speaking the task protocol over two queues:
//! requests go to its stdin, responses come back on its stdout. Its stderr is
//! kept as diagnostics for the task in flight.
//!
//! # Design Notes
//!
//! - responses are decoded by a reader thread and handed over through a
//!   bounded channel, so a dispatch can wait in bounded ticks
//! - every failed dispatch kills the process; a killed worker is never reused
//! - on unix each worker leads its own process group, and a kill signals the
//!   whole group so interpreters started by the worker die with it
//! - dropping a worker kills and reaps it

use super::pool::PoolConfig;
use graphproc_core::{ProcedureError, ProcedureResult};
use graphproc_wire::{QueueReader, QueueWriter, TaskInput, TaskOutput, WireResult};
use parking_lot::Mutex;
use std::io::Read;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Deadline used when a dispatch has no timeout
pub const NO_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const STDERR_CAPACITY: usize = 64 * 1024;

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Idle in the free list
    Free,
    /// Running a task
    Busy,
    /// Asked to stop; killed at the next opportunity
    ShouldKill,
    /// Process has been killed and reaped
    Killed,
}

/// A running worker process
pub struct Worker {
    id: u64,
    child: Child,
    requests: QueueWriter<ChildStdin>,
    request_queue: String,
    responses: Receiver<WireResult<TaskOutput>>,
    stderr: Arc<Mutex<String>>,
    should_kill: Arc<AtomicBool>,
    state: WorkerState,
    started: Instant,
    last_used: Instant,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("pid", &self.child.id())
            .field("state", &self.state)
            .finish()
    }
}

impl Worker {
    /// Start a worker process
    pub fn spawn(config: &PoolConfig, id: u64) -> ProcedureResult<Self> {
        let (request_queue, response_queue) = queue_names(&config.queue_prefix, id);
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .arg("--request-queue")
            .arg(&request_queue)
            .arg("--response-queue")
            .arg(&response_queue)
            .arg("--db-dir")
            .arg(&config.db_dir)
            .arg("--interpreter")
            .arg(&config.interpreter)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn().map_err(|e| {
            ProcedureError::internal(format!(
                "Failed to start worker {}: {}",
                config.program.display(),
                e
            ))
        })?;

        let (stdin, stdout, stderr_pipe) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(i), Some(o), Some(e)) => (i, o, e),
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ProcedureError::internal("Worker pipes were not captured."));
                }
            };

        let (tx, rx) = mpsc::sync_channel(1);
        let mut reader = QueueReader::new(response_queue, stdout);
        thread::spawn(move || loop {
            match reader.recv::<TaskOutput>() {
                Ok(Some(output)) => {
                    if tx.send(Ok(output)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        });

        let stderr = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&stderr);
        thread::spawn(move || collect_stderr(stderr_pipe, sink));

        let now = Instant::now();
        debug!(
            target: "graphproc::worker",
            worker = id,
            pid = child.id(),
            queue = %request_queue,
            "Spawned worker"
        );
        Ok(Worker {
            id,
            child,
            requests: QueueWriter::new(request_queue.clone(), stdin),
            request_queue,
            responses: rx,
            stderr,
            should_kill: Arc::new(AtomicBool::new(false)),
            state: WorkerState::Free,
            started: now,
            last_used: now,
        })
    }

    /// Pool-assigned identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// OS process id
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        if self.state != WorkerState::Killed && self.should_kill.load(Ordering::Acquire) {
            return WorkerState::ShouldKill;
        }
        self.state
    }

    /// Flag other threads raise to stop this worker
    pub fn kill_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.should_kill)
    }

    /// Time since the process started
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time since the worker last finished (or started) a task
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Whether the process is still running
    pub fn is_alive(&mut self) -> bool {
        self.state != WorkerState::Killed && matches!(self.child.try_wait(), Ok(None))
    }

    pub(crate) fn mark_free(&mut self) {
        self.state = WorkerState::Free;
        self.last_used = Instant::now();
    }

    /// Send `task` and wait for its response
    ///
    /// Waits in ticks of at most `tick`. Between ticks, `cancelled` and the
    /// worker's own kill flag are checked. Any error leaves the worker killed.
    pub fn dispatch(
        &mut self,
        task: &TaskInput,
        timeout: Option<Duration>,
        tick: Duration,
        cancelled: &dyn Fn() -> bool,
    ) -> ProcedureResult<TaskOutput> {
        self.state = WorkerState::Busy;
        self.stderr.lock().clear();
        let timeout = timeout.unwrap_or(NO_DEADLINE);
        let deadline = Instant::now() + timeout;

        if let Err(e) = self.requests.send(task) {
            self.kill();
            return Err(ProcedureError::internal(self.with_stderr(&format!(
                "Failed to send task to worker on {}: {}",
                self.request_queue, e
            ))));
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.kill();
                return Err(ProcedureError::timeout(self.with_stderr(&format!(
                    "Task [{}] timed out after {:.1}s.",
                    task.function,
                    timeout.as_secs_f64()
                ))));
            }
            match self.responses.recv_timeout(tick.min(remaining)) {
                Ok(Ok(output)) => {
                    self.mark_free();
                    return Ok(output);
                }
                Ok(Err(e)) => {
                    self.kill();
                    return Err(ProcedureError::internal(
                        self.with_stderr(&format!("Worker sent a malformed response: {}", e)),
                    ));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if cancelled() {
                        self.kill();
                        return Err(ProcedureError::cancelled(
                            self.with_stderr(&format!("Task [{}] was cancelled.", task.function)),
                        ));
                    }
                    if self.should_kill.load(Ordering::Acquire) {
                        self.kill();
                        return Err(ProcedureError::cancelled(self.with_stderr(&format!(
                            "Task [{}] was stopped because its worker is shutting down.",
                            task.function
                        ))));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let status = self.child.try_wait().ok().flatten();
                    self.kill();
                    warn!(
                        target: "graphproc::worker",
                        worker = self.id,
                        status = ?status,
                        "Worker exited during a task"
                    );
                    return Err(ProcedureError::internal(self.with_stderr(&format!(
                        "Worker exited unexpectedly while running [{}].",
                        task.function
                    ))));
                }
            }
        }
    }

    /// Kill and reap the process along with anything it started
    pub fn kill(&mut self) {
        if self.state == WorkerState::Killed {
            return;
        }
        self.kill_group();
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.state = WorkerState::Killed;
        debug!(target: "graphproc::worker", worker = self.id, "Killed worker");
    }

    #[cfg(unix)]
    fn kill_group(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(self.pid() as i32), Signal::SIGKILL) {
            // ESRCH: the group is already gone
            if e != nix::errno::Errno::ESRCH {
                warn!(
                    target: "graphproc::worker",
                    worker = self.id,
                    error = %e,
                    "Failed to kill worker process group"
                );
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self) {}

    fn with_stderr(&self, msg: &str) -> String {
        let stderr = self.stderr.lock();
        ProcedureError::with_output(msg, "", &stderr)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.kill();
    }
}

fn queue_names(prefix: &str, id: u64) -> (String, String) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let thread: String = format!("{:?}", thread::current().id())
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    let base = format!(
        "_pipe_{}_{}_{}_{}_{}",
        prefix,
        std::process::id(),
        thread,
        id,
        nanos
    );
    (format!("{}_req", base), format!("{}_resp", base))
}

fn collect_stderr(mut pipe: impl Read, sink: Arc<Mutex<String>>) {
    let mut buf = [0u8; 4096];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut text = sink.lock();
                text.push_str(&String::from_utf8_lossy(&buf[..n]));
                if text.len() > STDERR_CAPACITY {
                    let mut cut = text.len() - STDERR_CAPACITY;
                    while !text.is_char_boundary(cut) {
                        cut += 1;
                    }
                    text.drain(..cut);
                }
            }
        }
    }
}
