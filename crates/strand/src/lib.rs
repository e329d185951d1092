//! Strand — a work-stealing thread pool for mixed CPU-bound and blocking
//! workloads.
//!
//! The pool executes a continuous stream of short-lived tasks while sizing
//! itself dynamically:
//! - **Semi-FIFO local queues**: a task dispatched from within a worker
//!   lands at the head of that worker's queue, displacing the previous
//!   head to the tail. Request/response-style task chains stay on one
//!   thread with minimal scheduling latency.
//! - **Work stealing with affinity**: idle workers steal batches from
//!   their peers, but only tasks older than a configurable resolution, so
//!   tightly communicating tasks are not torn away from their producer.
//! - **CPU permits**: at most `core_pool_size` workers run non-blocking
//!   work at once. A worker starting a [`TaskMode::ProbablyBlocking`] task
//!   releases its permit, letting the pool wake or create another thread
//!   instead of dedicating a separate blocking pool.
//! - **Self-tuning idle behavior**: idle workers spin, then yield, then
//!   park with exponential backoff; surplus workers terminate themselves
//!   after a keep-alive period.
//!
//! Submission never blocks: [`Scheduler::dispatch`] stamps the work item
//! and enqueues it, and the capacity machinery wakes or creates workers as
//! needed. Task panics are caught per task and routed to an
//! [`UncaughtHandler`]; the worker thread survives.
//!
//! See [`Scheduler`] for a usage example and [`SchedulerConfig`] for the
//! tunables.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod config;
mod global_queue;
mod queue;
mod scheduler;
mod task;
mod worker;

pub use config::{
    ConfigError, MonotonicClock, SchedulerConfig, TimeSource, MAX_SUPPORTED_POOL_SIZE,
};
pub use scheduler::{Scheduler, SchedulerSnapshot};
pub use task::{StderrUncaughtHandler, TaskMode, UncaughtHandler, WorkerHook};
