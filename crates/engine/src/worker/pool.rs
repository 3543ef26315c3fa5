//! Interpreter worker pool
//!
//! Workers are checked out for exactly one task and returned afterwards.
//!
//! # Design Notes
//!
//! - free workers sit in a deque, most recently used at the front, so the
//!   back holds the longest-idle workers and sweeping pops from there
//! - a busy worker is owned by the thread running its task; the pool only
//!   keeps its kill flag, so shutdown can stop it without taking it back
//! - processes are spawned and killed outside the pool lock
//! - a background sweeper evicts idle workers every `max_idle`, stopped by an
//!   atomic flag when the pool drops

use super::process::Worker;
use crate::tracker::TaskTracker;
use graphproc_core::{ProcedureError, ProcedureResult};
use graphproc_wire::{TaskInput, TaskOutput};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How a pool starts and retires workers
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker executable
    pub program: PathBuf,
    /// Arguments placed before the queue arguments
    pub args: Vec<String>,
    /// Database directory passed to workers
    pub db_dir: PathBuf,
    /// Interpreter workers run modules with
    pub interpreter: String,
    /// Idle time after which a free worker is killed
    pub max_idle: Option<Duration>,
    /// Age after which a worker is retired on release
    pub max_lifetime: Option<Duration>,
    /// Dispatch wait tick
    pub poll_interval: Duration,
    /// Distinguishes queue names of different pools
    pub queue_prefix: String,
}

/// Worker counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle workers
    pub free: usize,
    /// Workers running a task
    pub busy: usize,
    /// Workers started since creation
    pub spawned: u64,
    /// Workers killed since creation
    pub killed: u64,
}

struct PoolState {
    free: VecDeque<Worker>,
    busy: HashMap<u64, Arc<AtomicBool>>,
    last_request: Instant,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    shutdown: AtomicBool,
    next_id: AtomicU64,
    spawned: AtomicU64,
    killed: AtomicU64,
}

impl PoolInner {
    fn retire(&self, workers: Vec<Worker>) {
        for mut worker in workers {
            worker.kill();
            self.killed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn take_idle(&self, state: &mut PoolState) -> Vec<Worker> {
        let mut expired = Vec::new();
        if let Some(max_idle) = self.config.max_idle {
            while state.free.back().map_or(false, |w| w.idle_for() >= max_idle) {
                if let Some(worker) = state.free.pop_back() {
                    expired.push(worker);
                }
            }
        }
        expired
    }

    fn sweep_idle(&self) -> usize {
        let expired = {
            let mut state = self.state.lock();
            self.take_idle(&mut state)
        };
        let count = expired.len();
        if count > 0 {
            debug!(target: "graphproc::worker", count, "Evicting idle workers");
        }
        self.retire(expired);
        count
    }
}

/// Pool of interpreter worker processes
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    sweeper: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("program", &self.inner.config.program)
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    /// Create an empty pool; starts the idle sweeper when `max_idle` is set
    pub fn new(config: PoolConfig) -> Self {
        let max_idle = config.max_idle;
        let inner = Arc::new(PoolInner {
            config,
            state: Mutex::new(PoolState {
                free: VecDeque::new(),
                busy: HashMap::new(),
                last_request: Instant::now(),
            }),
            shutdown: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            spawned: AtomicU64::new(0),
            killed: AtomicU64::new(0),
        });
        let sweeper = max_idle.map(|interval| {
            let inner = Arc::clone(&inner);
            thread::spawn(move || {
                while !inner.shutdown.load(Ordering::Relaxed) {
                    let slice = Duration::from_millis(100).min(interval);
                    let mut elapsed = Duration::ZERO;
                    while elapsed < interval {
                        if inner.shutdown.load(Ordering::Relaxed) {
                            return;
                        }
                        thread::sleep(slice);
                        elapsed += slice;
                    }
                    inner.sweep_idle();
                }
            })
        });
        WorkerPool { inner, sweeper }
    }

    /// Pool settings
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a live worker, spawning one when none is free
    pub fn acquire(&self) -> ProcedureResult<Worker> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(ProcedureError::internal("Worker pool is shut down."));
        }
        let mut dead = Vec::new();
        let reused = {
            let mut state = self.inner.state.lock();
            state.last_request = Instant::now();
            let mut found = None;
            while let Some(mut worker) = state.free.pop_front() {
                if worker.is_alive() {
                    state.busy.insert(worker.id(), worker.kill_flag());
                    found = Some(worker);
                    break;
                }
                dead.push(worker);
            }
            found
        };
        if !dead.is_empty() {
            debug!(target: "graphproc::worker", count = dead.len(), "Discarding dead workers");
            self.inner.retire(dead);
        }
        if let Some(worker) = reused {
            return Ok(worker);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let worker = Worker::spawn(&self.inner.config, id)?;
        self.inner.spawned.fetch_add(1, Ordering::Relaxed);
        self.inner.state.lock().busy.insert(id, worker.kill_flag());
        Ok(worker)
    }

    /// Return a worker after a successful task
    ///
    /// The worker is killed instead of freed when it was asked to stop, the
    /// pool is shutting down, it outlived `max_lifetime`, or the pool has been
    /// idle longer than `max_idle`.
    pub fn release(&self, mut worker: Worker) {
        let config = &self.inner.config;
        let mut retired = Vec::new();
        {
            let mut state = self.inner.state.lock();
            state.busy.remove(&worker.id());
            let flagged = worker.kill_flag().load(Ordering::Acquire);
            let too_old = config.max_lifetime.map_or(false, |l| worker.age() >= l);
            let pool_idle = config
                .max_idle
                .map_or(false, |i| state.last_request.elapsed() >= i);
            if flagged || too_old || pool_idle || self.inner.shutdown.load(Ordering::Acquire) {
                retired.push(worker);
            } else {
                worker.mark_free();
                state.free.push_front(worker);
            }
            retired.extend(self.inner.take_idle(&mut state));
        }
        self.inner.retire(retired);
    }

    /// Drop a worker whose task failed
    pub fn discard(&self, worker: Worker) {
        self.inner.state.lock().busy.remove(&worker.id());
        self.inner.retire(vec![worker]);
    }

    /// Kill every free worker and ask every busy one to stop
    pub fn kill_all(&self) {
        let free: Vec<Worker> = {
            let mut state = self.inner.state.lock();
            for flag in state.busy.values() {
                flag.store(true, Ordering::Release);
            }
            state.free.drain(..).collect()
        };
        if !free.is_empty() {
            info!(target: "graphproc::worker", count = free.len(), "Killing free workers");
        }
        self.inner.retire(free);
    }

    /// Stop accepting work and kill everything
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.kill_all();
    }

    /// Evict free workers idle for at least `max_idle`; returns how many
    pub fn sweep_idle(&self) -> usize {
        self.inner.sweep_idle()
    }

    /// Current counts
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            free: state.free.len(),
            busy: state.busy.len(),
            spawned: self.inner.spawned.load(Ordering::Relaxed),
            killed: self.inner.killed.load(Ordering::Relaxed),
        }
    }

    /// Run one task on a pooled worker
    ///
    /// The wait honors `timeout` and the calling thread's task cancellation.
    pub fn run_task(
        &self,
        task: &TaskInput,
        timeout: Option<Duration>,
    ) -> ProcedureResult<TaskOutput> {
        let mut worker = self.acquire()?;
        let tick = self.inner.config.poll_interval;
        match worker.dispatch(task, timeout, tick, &TaskTracker::should_kill_current_task) {
            Ok(output) => {
                self.release(worker);
                Ok(output)
            }
            Err(e) => {
                self.discard(worker);
                Err(e)
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.sweeper.take() {
            let _ = handle.join();
        }
    }
}
