//! Process-wide registry of running tasks
//!
//! A thread running a cancellable operation enters a task with
//! [`TaskTracker::begin`] and keeps the returned guard alive for the duration.
//! Any other thread may raise the task's kill flag with [`TaskTracker::kill`];
//! long-running waits poll [`TaskTracker::should_kill_current_task`].

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

/// Identifier of a running task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TaskId(Uuid::parse_str(s)?))
    }
}

/// Snapshot of a running task
#[derive(Debug, Clone)]
pub struct TaskInfo {
    /// Task identifier
    pub id: TaskId,
    /// What the task is doing
    pub description: String,
    /// Time since the task began
    pub elapsed: Duration,
    /// Whether a kill has been requested
    pub kill_requested: bool,
}

struct TaskEntry {
    description: String,
    started: Instant,
    kill: Arc<AtomicBool>,
}

static TASKS: Lazy<DashMap<TaskId, TaskEntry>> = Lazy::new(DashMap::new);

thread_local! {
    static CURRENT: RefCell<Option<(TaskId, Arc<AtomicBool>)>> = RefCell::new(None);
}

/// Keeps a task registered; unregisters it when dropped
#[must_use = "the task ends when the guard is dropped"]
pub struct TaskGuard {
    id: TaskId,
    previous: Option<(TaskId, Arc<AtomicBool>)>,
}

impl TaskGuard {
    /// Identifier of the task
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        TASKS.remove(&self.id);
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}

/// Entry points of the task registry
pub struct TaskTracker;

impl TaskTracker {
    /// Register a task and make it current on this thread
    pub fn begin(description: impl Into<String>) -> TaskGuard {
        let id = TaskId(Uuid::new_v4());
        let kill = Arc::new(AtomicBool::new(false));
        TASKS.insert(
            id,
            TaskEntry {
                description: description.into(),
                started: Instant::now(),
                kill: Arc::clone(&kill),
            },
        );
        let previous = CURRENT.with(|c| c.borrow_mut().replace((id, kill)));
        TaskGuard { id, previous }
    }

    /// Task current on this thread, if any
    pub fn current() -> Option<TaskId> {
        CURRENT.with(|c| c.borrow().as_ref().map(|(id, _)| *id))
    }

    /// Whether the current task has been asked to stop
    pub fn should_kill_current_task() -> bool {
        CURRENT.with(|c| {
            c.borrow()
                .as_ref()
                .map_or(false, |(_, kill)| kill.load(Ordering::Acquire))
        })
    }

    /// Ask a task to stop; returns whether the task exists
    pub fn kill(id: TaskId) -> bool {
        match TASKS.get(&id) {
            Some(entry) => {
                entry.kill.store(true, Ordering::Release);
                info!(
                    target: "graphproc::tracker",
                    task = %id,
                    description = %entry.description,
                    "Kill requested"
                );
                true
            }
            None => false,
        }
    }

    /// Every registered task
    pub fn list() -> Vec<TaskInfo> {
        TASKS
            .iter()
            .map(|e| TaskInfo {
                id: *e.key(),
                description: e.description.clone(),
                elapsed: e.started.elapsed(),
                kill_requested: e.kill.load(Ordering::Acquire),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_task_by_default() {
        std::thread::spawn(|| {
            assert!(TaskTracker::current().is_none());
            assert!(!TaskTracker::should_kill_current_task());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_kill_reaches_current_thread() {
        let guard = TaskTracker::begin("call echo");
        let id = guard.id();
        assert_eq!(TaskTracker::current(), Some(id));
        assert!(!TaskTracker::should_kill_current_task());

        let killer = std::thread::spawn(move || TaskTracker::kill(id));
        assert!(killer.join().unwrap());
        assert!(TaskTracker::should_kill_current_task());
        assert!(TaskTracker::list().iter().any(|t| t.id == id && t.kill_requested));

        drop(guard);
        assert!(TaskTracker::current().is_none());
        assert!(!TaskTracker::kill(id));
    }

    #[test]
    fn test_nested_tasks_restore_outer() {
        let outer = TaskTracker::begin("outer");
        {
            let inner = TaskTracker::begin("inner");
            assert_eq!(TaskTracker::current(), Some(inner.id()));
        }
        assert_eq!(TaskTracker::current(), Some(outer.id()));
    }

    #[test]
    fn test_task_id_parses() {
        let guard = TaskTracker::begin("parse");
        let parsed: TaskId = guard.id().to_string().parse().unwrap();
        assert_eq!(parsed, guard.id());
        assert!("not-a-uuid".parse::<TaskId>().is_err());
    }
}
