//! Scheduler configuration and the injectable time source.
//!
//! All tunables live in an explicit [`SchedulerConfig`] passed to
//! [`Scheduler::with_config`](crate::Scheduler::with_config); there is no
//! ambient process-wide configuration. Invalid parameters are rejected at
//! construction time, before any thread is spawned.

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::task::{StderrUncaughtHandler, UncaughtHandler, WorkerHook};

/// Hard upper bound on `max_pool_size`, limited by the bit width reserved
/// for the created-worker count in the packed control state.
pub const MAX_SUPPORTED_POOL_SIZE: usize = 1 << 21;

/// Ceiling for the exponential idle-park backoff.
pub(crate) const MAX_PARK_TIME_NS: u64 = 1_000_000_000;

/// Monotonic clock used for task submission timestamps and idle deadlines.
///
/// The scheduler reads time frequently on hot paths (every dispatch stamps
/// the task, every steal attempt checks staleness), so implementations
/// should be cheap. Tests may substitute a manually advanced clock.
pub trait TimeSource: Send + Sync {
    /// Current monotonic time in nanoseconds.
    fn nanos(&self) -> u64;
}

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Default [`TimeSource`] backed by [`Instant`], anchored to a process-wide
/// epoch so timestamps are comparable across scheduler instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl TimeSource for MonotonicClock {
    fn nanos(&self) -> u64 {
        EPOCH.elapsed().as_nanos() as u64
    }
}

/// Errors detected while validating a [`SchedulerConfig`].
///
/// Construction fails fast: no worker thread or queue is created when any
/// of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Core pool size must be at least 1.
    #[error("core pool size ({0}) should be positive")]
    CorePoolSize(usize),

    /// Max pool size must not be smaller than the core pool size.
    #[error("max pool size ({max}) should be greater than or equal to core pool size ({core})")]
    MaxPoolSize {
        /// Configured core pool size.
        core: usize,
        /// Configured max pool size.
        max: usize,
    },

    /// Max pool size is limited by the packed control-state representation.
    #[error("max pool size ({0}) should not exceed maximal supported number of threads ({MAX_SUPPORTED_POOL_SIZE})")]
    UnsupportedPoolSize(usize),

    /// The work-stealing staleness resolution must be positive.
    #[error("work stealing resolution should be positive")]
    ZeroStealResolution,

    /// The idle keep-alive duration must be positive.
    #[error("idle keep-alive should be positive")]
    ZeroKeepAlive,
}

/// Construction parameters for a [`Scheduler`](crate::Scheduler).
///
/// `Default` mirrors the sizing a general-purpose runtime would pick:
/// one CPU worker per core (at least two) and a generous thread ceiling
/// for blocking work.
pub struct SchedulerConfig {
    /// Human-readable pool name, used for thread names and diagnostics only.
    pub name: String,

    /// Number of CPU permits, i.e. how many workers may concurrently run
    /// non-blocking tasks or steal work.
    pub core_pool_size: usize,

    /// Upper bound on lazily created worker threads, including workers
    /// currently executing blocking tasks.
    pub max_pool_size: usize,

    /// Minimum age a task must reach before another worker may steal it.
    /// Preserves producer-thread affinity for tightly communicating tasks.
    pub steal_resolution: Duration,

    /// Local queue occupancy above which a successful local submit still
    /// requests help from another worker.
    pub offload_threshold: u32,

    /// How long an idle worker above `core_pool_size` lingers before it
    /// terminates itself.
    pub keep_alive: Duration,

    /// Clock used for submission timestamps, staleness checks and idle
    /// deadlines.
    pub time_source: Arc<dyn TimeSource>,

    /// Receives (worker name, panic payload) for every task that panics.
    /// The worker itself survives.
    pub uncaught_handler: Arc<dyn UncaughtHandler>,

    /// Capability hooks invoked on the worker thread around every task
    /// execution, registered explicitly at construction.
    pub hooks: Vec<Arc<dyn WorkerHook>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let core = num_cpus::get().max(2);
        let max = (core * 128).clamp(core, MAX_SUPPORTED_POOL_SIZE);
        Self {
            name: "strand".to_string(),
            core_pool_size: core,
            max_pool_size: max,
            steal_resolution: Duration::from_micros(100),
            offload_threshold: 96,
            keep_alive: Duration::from_secs(5),
            time_source: Arc::new(MonotonicClock),
            uncaught_handler: Arc::new(StderrUncaughtHandler),
            hooks: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    /// Checks all invariants the scheduler relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core_pool_size < 1 {
            return Err(ConfigError::CorePoolSize(self.core_pool_size));
        }
        if self.max_pool_size < self.core_pool_size {
            return Err(ConfigError::MaxPoolSize {
                core: self.core_pool_size,
                max: self.max_pool_size,
            });
        }
        if self.max_pool_size > MAX_SUPPORTED_POOL_SIZE {
            return Err(ConfigError::UnsupportedPoolSize(self.max_pool_size));
        }
        if self.steal_resolution.is_zero() {
            return Err(ConfigError::ZeroStealResolution);
        }
        if self.keep_alive.is_zero() {
            return Err(ConfigError::ZeroKeepAlive);
        }
        Ok(())
    }

    /// Minimum park duration, derived from the staleness resolution.
    pub(crate) fn min_park_time_ns(&self) -> u64 {
        (self.steal_resolution.as_nanos() as u64 / 4).clamp(10, MAX_PARK_TIME_NS)
    }
}
