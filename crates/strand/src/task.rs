//! Task descriptor and the capability traits invoked at task boundaries.

use std::any::Any;
use std::fmt;

/// Hint describing whether a dispatched work item may block its thread.
///
/// The scheduler uses the mode purely for capacity decisions: running a
/// [`TaskMode::ProbablyBlocking`] task releases the worker's CPU permit so
/// another thread can pick up non-blocking work in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    /// CPU-bound work that will not block the thread.
    NonBlocking,
    /// Work that may perform IO, system calls or locking.
    ProbablyBlocking,
}

/// The executable payload of a task.
pub(crate) type WorkItem = Box<dyn FnOnce() + Send + 'static>;

/// Immutable work descriptor: the payload, its submission timestamp and
/// its blocking-mode tag.
///
/// A task is owned by exactly one queue at a time; ownership transfers on
/// dequeue and the payload is invoked exactly once.
pub(crate) struct Task {
    pub(crate) block: WorkItem,
    pub(crate) submission_time: u64,
    pub(crate) mode: TaskMode,
}

impl Task {
    pub(crate) fn new(block: WorkItem, submission_time: u64, mode: TaskMode) -> Self {
        Self {
            block,
            submission_time,
            mode,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("submission_time", &self.submission_time)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Receives task panics instead of letting them kill the worker thread.
pub trait UncaughtHandler: Send + Sync {
    /// Called on the worker thread whose task panicked, after the panic has
    /// been caught. `worker_name` identifies the executing worker.
    fn on_task_panic(&self, worker_name: &str, payload: Box<dyn Any + Send>);
}

/// Default [`UncaughtHandler`]: reports the panic on stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrUncaughtHandler;

impl UncaughtHandler for StderrUncaughtHandler {
    fn on_task_panic(&self, worker_name: &str, payload: Box<dyn Any + Send>) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        eprintln!("{worker_name}: uncaught task panic: {message}");
    }
}

/// Capability interface invoked on the worker thread around every task
/// execution, e.g. to install and tear down thread-local context.
///
/// Hooks are registered explicitly via
/// [`SchedulerConfig::hooks`](crate::SchedulerConfig::hooks); the scheduler
/// core has no knowledge of any particular implementation.
pub trait WorkerHook: Send + Sync {
    /// Runs immediately before a task's payload is invoked.
    fn before_task(&self) {}

    /// Runs after the task's payload returned or panicked.
    fn after_task(&self) {}
}
