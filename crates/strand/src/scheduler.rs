//! The scheduler: dispatch entry point, CPU-permit capacity control,
//! worker lifecycle and the parked-worker stack.
//!
//! Structurally the pool consists of up to `core_pool_size` workers
//! executing CPU-bound tasks and up to `max_pool_size` lazily created
//! threads to absorb blocking tasks. Externally submitted tasks go through
//! the global queue; tasks dispatched from worker threads land in the
//! dispatching worker's local queue, and work stealing evens out the load
//! on top of that.
//!
//! All shared state is lock-free except a single coarse lock around the
//! worker array, taken only for worker creation and termination.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::config::{ConfigError, SchedulerConfig, TimeSource, MAX_PARK_TIME_NS};
use crate::global_queue::GlobalQueue;
use crate::task::{Task, TaskMode, UncaughtHandler, WorkItem, WorkerHook};
use crate::worker::{current_worker_on, Worker, WorkerState, NOT_IN_STACK};

// Control-state layout: the low 21 bits count created workers, the next
// 21 bits count workers currently executing blocking tasks.
const BLOCKING_SHIFT: u32 = 21;
const CREATED_MASK: u64 = (1 << BLOCKING_SHIFT) - 1;
const BLOCKING_MASK: u64 = CREATED_MASK << BLOCKING_SHIFT;
const BLOCKING_ONE: u64 = 1 << BLOCKING_SHIFT;

fn created_of(state: u64) -> usize {
    (state & CREATED_MASK) as usize
}

fn blocking_of(state: u64) -> usize {
    ((state & BLOCKING_MASK) >> BLOCKING_SHIFT) as usize
}

/// Counting semaphore bounding how many workers may concurrently run
/// non-blocking work. Never blocks; workers that fail to acquire fall back
/// to blocking-only duty.
pub(crate) struct CpuPermits {
    available: AtomicU32,
    capacity: u32,
}

impl CpuPermits {
    fn new(capacity: usize) -> Self {
        Self {
            available: AtomicU32::new(capacity as u32),
            capacity: capacity as u32,
        }
    }

    pub(crate) fn try_acquire(&self) -> bool {
        let mut current = self.available.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.available.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn release(&self) {
        let previous = self.available.fetch_add(1, Ordering::Release);
        assert!(previous < self.capacity, "CPU permit released twice");
    }

    pub(crate) fn available(&self) -> u32 {
        self.available.load(Ordering::Acquire)
    }
}

/// Resolved tunables, in nanoseconds where applicable.
pub(crate) struct Tunables {
    pub(crate) name: String,
    pub(crate) core_pool_size: usize,
    pub(crate) max_pool_size: usize,
    pub(crate) steal_resolution_ns: u64,
    pub(crate) offload_threshold: u32,
    pub(crate) keep_alive_ns: u64,
    pub(crate) min_park_time_ns: u64,
    pub(crate) max_park_time_ns: u64,
}

/// One entry per worker ever created. Keeps the join handle for shutdown
/// and pins the worker allocation so raw links in the parked stack stay
/// valid for the scheduler's whole lifetime.
struct WorkerHandle {
    worker: Arc<Worker>,
    join: Option<thread::JoinHandle<()>>,
}

/// Result of attempting to place a task on the current worker's queue.
enum LocalSubmit {
    Added,
    /// Added, but the pool should wake or create another worker.
    AddedNeedsHelp,
    /// Not a worker thread (or no permit); the task goes to the global
    /// queue instead.
    Rejected(Task),
}

/// State shared between the scheduler handle and all worker threads.
pub(crate) struct Shared {
    tunables: Tunables,
    time_source: Arc<dyn TimeSource>,
    uncaught_handler: Arc<dyn UncaughtHandler>,
    hooks: Vec<Arc<dyn WorkerHook>>,

    pub(crate) global_queue: GlobalQueue,
    pub(crate) cpu_permits: CpuPermits,

    /// Top of the intrusive Treiber stack of parked workers, as a raw
    /// worker address; 0 when empty.
    parked_workers: AtomicUsize,

    /// Packed created/blocking worker counts.
    control_state: AtomicU64,

    /// Live workers, index == position. Structural changes only under the
    /// write lock; reads tolerate transient staleness.
    pub(crate) workers: RwLock<Vec<Arc<Worker>>>,

    /// Every worker ever created, for shutdown and lifetime pinning.
    registry: Mutex<Vec<WorkerHandle>>,

    is_terminated: AtomicBool,
}

impl Shared {
    pub(crate) fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub(crate) fn pool_name(&self) -> &str {
        &self.tunables.name
    }

    pub(crate) fn nanos(&self) -> u64 {
        self.time_source.nanos()
    }

    pub(crate) fn hooks(&self) -> &[Arc<dyn WorkerHook>] {
        &self.hooks
    }

    pub(crate) fn uncaught_handler(&self) -> &dyn UncaughtHandler {
        &*self.uncaught_handler
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.is_terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn created_workers(&self) -> usize {
        created_of(self.control_state.load(Ordering::Acquire))
    }

    fn increment_created_workers(&self) {
        self.control_state.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement_created_workers(&self) {
        let old = self.control_state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(created_of(old) > 0);
    }

    pub(crate) fn increment_blocking_workers(&self) {
        self.control_state.fetch_add(BLOCKING_ONE, Ordering::AcqRel);
    }

    pub(crate) fn decrement_blocking_workers(&self) {
        let old = self.control_state.fetch_sub(BLOCKING_ONE, Ordering::AcqRel);
        debug_assert!(blocking_of(old) > 0);
    }

    // ------------------------------------------------------------------
    // Parked-worker stack
    // ------------------------------------------------------------------

    /// Pushes a worker onto the parked stack. A no-op if the worker is
    /// still physically linked. Called only by the worker itself, always
    /// immediately before it parks.
    pub(crate) fn parked_workers_push(&self, worker: &Worker) {
        if worker.next_parked.load(Ordering::Acquire) != NOT_IN_STACK {
            return;
        }
        // Only the worker itself pushes, so the link cannot change under
        // this loop.
        let worker_addr = worker as *const Worker as usize;
        loop {
            let top = self.parked_workers.load(Ordering::Acquire);
            worker.next_parked.store(top, Ordering::Relaxed);
            if self
                .parked_workers
                .compare_exchange(top, worker_addr, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pops the most recently parked worker, callable from any thread
    /// looking for help.
    fn parked_workers_pop(&self) -> Option<&Worker> {
        loop {
            let top = self.parked_workers.load(Ordering::Acquire);
            if top == 0 {
                return None;
            }
            // The address stays valid for the scheduler's lifetime: every
            // created worker is pinned by the registry.
            let worker = unsafe { &*(top as *const Worker) };
            let next = worker.next_parked.load(Ordering::Acquire);
            if next == NOT_IN_STACK {
                // A racing pop already unlinked this worker; reread the top.
                continue;
            }
            // No ABA here: while the link still reads as popped, the top
            // worker cannot push itself again.
            if self
                .parked_workers
                .compare_exchange(top, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Reset the link so a concurrent push by this same worker
                // is neither dropped nor duplicated.
                worker.next_parked.store(NOT_IN_STACK, Ordering::Release);
                return Some(worker);
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    pub(crate) fn dispatch(self: &Arc<Self>, block: WorkItem, mode: TaskMode, fair: bool) {
        let task = Task::new(block, self.nanos(), mode);
        match self.submit_to_local_queue(task, fair) {
            LocalSubmit::Added => {}
            LocalSubmit::AddedNeedsHelp => self.request_cpu_worker(),
            LocalSubmit::Rejected(task) => {
                self.global_queue.add_last(task);
                self.request_cpu_worker();
            }
        }
    }

    fn submit_to_local_queue(self: &Arc<Self>, task: Task, fair: bool) -> LocalSubmit {
        let worker_ptr = current_worker_on(Arc::as_ptr(self));
        if worker_ptr.is_null() {
            return LocalSubmit::Rejected(task);
        }
        // The current thread's own worker; alive for the duration of this
        // call.
        let worker = unsafe { &*worker_ptr };

        let mut requires_help = false;
        if task.mode == TaskMode::NonBlocking {
            if worker.is_blocking() {
                // A blocking worker resuming non-blocking work keeps the
                // affinity benefit of its local queue, but it is not
                // available itself any time soon, so ask for help.
                requires_help = true;
            } else if !worker.try_acquire_cpu_permit(self) {
                // A permit-less worker is trying to retire; do not feed it
                // non-blocking work it may never get to run.
                return LocalSubmit::Rejected(task);
            }
        }

        let offloaded = if fair {
            worker.local_queue.add_last(task, &self.global_queue)
        } else {
            worker.local_queue.add(task, &self.global_queue)
        };
        if offloaded {
            return LocalSubmit::AddedNeedsHelp;
        }
        // Close to capacity: wake someone to steal. The non-atomic size
        // read is fine, this is only an optimization.
        if worker.local_queue.buffer_size() > self.tunables.offload_threshold {
            return LocalSubmit::AddedNeedsHelp;
        }
        if requires_help {
            LocalSubmit::AddedNeedsHelp
        } else {
            LocalSubmit::Added
        }
    }

    // ------------------------------------------------------------------
    // Capacity control
    // ------------------------------------------------------------------

    /// Unparks or creates a worker for non-blocking work if there is CPU
    /// capacity for it.
    pub(crate) fn request_cpu_worker(self: &Arc<Self>) {
        // No permit available: creating threads cannot add CPU
        // parallelism, so only try to wake someone.
        if self.cpu_permits.available() == 0 {
            self.try_unpark();
            return;
        }
        // Fast path: an existing parked or retired worker.
        if self.try_unpark() {
            return;
        }
        // When most created workers are busy blocking, add a thread for
        // the non-blocking side.
        let state = self.control_state.load(Ordering::Acquire);
        let cpu_workers = created_of(state).saturating_sub(blocking_of(state));
        if cpu_workers < self.tunables.core_pool_size && self.create_worker() {
            return;
        }
        // Covers the race between a permit release and parking.
        self.try_unpark();
    }

    fn try_unpark(&self) -> bool {
        loop {
            let Some(worker) = self.parked_workers_pop() else {
                return false;
            };
            // The popped worker may be parked, already hunting for work,
            // busy, or terminated; resetting its backoff is harmless in
            // every case.
            worker.idle_reset_before_unpark(self.tunables.min_park_time_ns);
            if !worker.is_parking() {
                continue;
            }
            worker.unpark();
            // A terminated worker (or one we lost the forbid race for) is
            // no help; pick another.
            if !worker.try_forbid_termination() {
                continue;
            }
            return true;
        }
    }

    fn create_worker(self: &Arc<Self>) -> bool {
        let mut workers = self.workers.write();
        if self.is_terminated() {
            return false;
        }
        // Re-check capacity under the lock to avoid overprovisioning.
        let state = self.control_state.load(Ordering::Acquire);
        let created = created_of(state);
        let cpu_workers = created.saturating_sub(blocking_of(state));
        if cpu_workers >= self.tunables.core_pool_size {
            return false;
        }
        if created >= self.tunables.max_pool_size || self.cpu_permits.available() == 0 {
            return false;
        }
        self.spawn_worker_locked(&mut workers);
        true
    }

    /// Creates, registers and starts one worker. Caller holds the worker
    /// array write lock.
    fn spawn_worker_locked(self: &Arc<Self>, workers: &mut Vec<Arc<Worker>>) {
        let index = workers.len();
        self.increment_created_workers();
        let worker = Arc::new(Worker::new(
            index,
            rand::thread_rng().gen::<u32>(),
            self.tunables.min_park_time_ns,
        ));
        workers.push(worker.clone());
        debug_assert_eq!(workers.len(), self.created_workers());

        let shared = Arc::clone(self);
        let thread_worker = worker.clone();
        let join = thread::Builder::new()
            .name(format!("{}-worker-{}", self.tunables.name, index))
            .spawn(move || thread_worker.run(&shared))
            .expect("failed to spawn worker thread");
        self.registry.lock().push(WorkerHandle {
            worker,
            join: Some(join),
        });
    }

    /// Self-termination of an idle worker above the core size. Loses
    /// gracefully to concurrent wake requests and to freshly arrived
    /// blocking work.
    pub(crate) fn try_terminate_worker(&self, worker: &Worker) {
        let mut workers = self.workers.write();
        // Someone else shrank the pool to core size first.
        if self.created_workers() <= self.tunables.core_pool_size {
            return;
        }
        // A blocking task slipped in; claim it instead of dying.
        if !worker.blocking_quiescence(self) {
            return;
        }
        // Losing this CAS means a helper just unparked us; keep running.
        if !worker.try_commit_termination() {
            return;
        }
        // Compact the live set: the last worker takes over this slot.
        let index = worker.index();
        debug_assert!(index < workers.len());
        let removed = workers.swap_remove(index);
        debug_assert!(std::ptr::eq(Arc::as_ptr(&removed), worker));
        if index < workers.len() {
            workers[index].set_index(index);
        }
        self.decrement_created_workers();
        worker.finish_termination(self);
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Signals termination, repeatedly unparks stragglers and joins every
    /// worker thread. Unconditional unparking is unsafe in general but
    /// acceptable for orderly teardown.
    fn close(&self) {
        if self.is_terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let current = thread::current().id();
        loop {
            let registry = self.registry.lock();
            let mut pending = false;
            for handle in registry.iter() {
                let alive = handle
                    .join
                    .as_ref()
                    .is_some_and(|join| join.thread().id() != current && !join.is_finished());
                if alive {
                    pending = true;
                    handle.worker.unpark();
                }
            }
            drop(registry);
            if !pending {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let handles: Vec<_> = self
            .registry
            .lock()
            .iter_mut()
            .filter_map(|handle| handle.join.take())
            .collect();
        for join in handles {
            if join.thread().id() != current {
                let _ = join.join();
            }
        }
    }
}

/// Pool of shared worker threads executing dispatched tasks, both
/// CPU-intensive and blocking.
///
/// Tasks dispatched from within a worker land at the head of that worker's
/// local queue (semi-FIFO, see [`dispatch_fair`](Self::dispatch_fair) for
/// the strict variant); tasks from external threads go through the global
/// queue. The pool resizes dynamically: executing a
/// [`TaskMode::ProbablyBlocking`] task releases the worker's CPU permit so
/// an extra thread can be woken or created for non-blocking work, and idle
/// surplus workers retire on their own after the keep-alive period.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use strand::{Scheduler, TaskMode};
///
/// let scheduler = Scheduler::new(2, 8).unwrap();
/// let done = Arc::new(AtomicUsize::new(0));
///
/// let counter = done.clone();
/// scheduler.dispatch(TaskMode::NonBlocking, move || {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
///
/// while done.load(Ordering::SeqCst) == 0 {
///     std::thread::yield_now();
/// }
/// scheduler.shutdown();
/// ```
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Creates a scheduler with the given pool sizes and default tunables.
    pub fn new(core_pool_size: usize, max_pool_size: usize) -> Result<Self, ConfigError> {
        Self::with_config(SchedulerConfig {
            core_pool_size,
            max_pool_size,
            ..SchedulerConfig::default()
        })
    }

    /// Creates a scheduler from a full configuration. Fails fast on
    /// invalid parameters, before any thread is spawned.
    pub fn with_config(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let tunables = Tunables {
            name: config.name.clone(),
            core_pool_size: config.core_pool_size,
            max_pool_size: config.max_pool_size,
            steal_resolution_ns: config.steal_resolution.as_nanos() as u64,
            offload_threshold: config.offload_threshold,
            keep_alive_ns: config.keep_alive.as_nanos() as u64,
            min_park_time_ns: config.min_park_time_ns(),
            max_park_time_ns: MAX_PARK_TIME_NS,
        };
        let shared = Arc::new(Shared {
            tunables,
            time_source: config.time_source,
            uncaught_handler: config.uncaught_handler,
            hooks: config.hooks,
            global_queue: GlobalQueue::new(),
            cpu_permits: CpuPermits::new(config.core_pool_size),
            parked_workers: AtomicUsize::new(0),
            control_state: AtomicU64::new(0),
            workers: RwLock::new(Vec::new()),
            registry: Mutex::new(Vec::new()),
            is_terminated: AtomicBool::new(false),
        });

        // Eagerly create at most two workers; the rest come on demand.
        {
            let mut workers = shared.workers.write();
            for _ in 0..config.core_pool_size.min(2) {
                shared.spawn_worker_locked(&mut workers);
            }
        }
        Ok(Self { shared })
    }

    /// Dispatches `block` for execution, hinting whether it may perform
    /// blocking operations. Returns immediately after enqueueing; never
    /// blocks the caller.
    ///
    /// Dispatched from a worker thread, the task is placed semi-fairly at
    /// the head of that worker's local queue; from any other thread it
    /// goes to the global queue.
    pub fn dispatch<F>(&self, mode: TaskMode, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.dispatch(Box::new(block), mode, false);
    }

    /// Like [`dispatch`](Self::dispatch), but with strict-FIFO placement
    /// even when called from a worker thread.
    pub fn dispatch_fair<F>(&self, mode: TaskMode, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.dispatch(Box::new(block), mode, true);
    }

    /// Number of CPU permits.
    pub fn core_pool_size(&self) -> usize {
        self.shared.tunables.core_pool_size
    }

    /// Upper bound on created worker threads.
    pub fn max_pool_size(&self) -> usize {
        self.shared.tunables.max_pool_size
    }

    /// Number of currently created workers.
    pub fn created_workers(&self) -> usize {
        self.shared.created_workers()
    }

    /// Whether [`shutdown`](Self::shutdown) has been invoked.
    pub fn is_terminated(&self) -> bool {
        self.shared.is_terminated()
    }

    /// Signals termination, forcibly wakes all workers and waits for them
    /// to exit. Tasks still queued at that point are dropped unexecuted.
    /// Intended for orderly teardown, not a hot-path operation; invoking
    /// it again has no effect.
    pub fn shutdown(&self) {
        self.shared.close();
    }

    /// Rough, non-atomic view of the pool state, for observability only.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let shared = &self.shared;
        let mut cpu_workers = 0;
        let mut blocking_workers = 0;
        let mut parked_workers = 0;
        let mut retiring_workers = 0;
        let mut terminated_workers = 0;
        let mut local_queue_sizes = Vec::new();
        let live = {
            let workers = shared.workers.read();
            for worker in workers.iter() {
                let queue_size = worker.local_queue.size();
                match worker.state() {
                    WorkerState::Parking => parked_workers += 1,
                    WorkerState::Blocking => {
                        blocking_workers += 1;
                        local_queue_sizes.push(format!("{queue_size}b"));
                    }
                    WorkerState::CpuAcquired => {
                        cpu_workers += 1;
                        local_queue_sizes.push(format!("{queue_size}c"));
                    }
                    WorkerState::Retiring => {
                        retiring_workers += 1;
                        if queue_size > 0 {
                            local_queue_sizes.push(format!("{queue_size}r"));
                        }
                    }
                    WorkerState::Terminated => terminated_workers += 1,
                }
            }
            workers.len()
        };
        terminated_workers += shared.registry.lock().len().saturating_sub(live);

        let state = shared.control_state.load(Ordering::Acquire);
        SchedulerSnapshot {
            name: shared.tunables.name.clone(),
            core_pool_size: shared.tunables.core_pool_size,
            max_pool_size: shared.tunables.max_pool_size,
            cpu_workers,
            blocking_workers,
            parked_workers,
            retiring_workers,
            terminated_workers,
            local_queue_sizes,
            global_queue_size: shared.global_queue.len(),
            created_workers: created_of(state),
            counted_blocking_workers: blocking_of(state),
        }
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        write!(
            f,
            "{}[Pool Size {{core = {}, max = {}}}, \
             Worker States {{CPU = {}, blocking = {}, parked = {}, retiring = {}, terminated = {}}}, \
             running workers queues = {:?}, \
             global queue size = {}, \
             Control State Workers {{created = {}, blocking = {}}}]",
            snapshot.name,
            snapshot.core_pool_size,
            snapshot.max_pool_size,
            snapshot.cpu_workers,
            snapshot.blocking_workers,
            snapshot.parked_workers,
            snapshot.retiring_workers,
            snapshot.terminated_workers,
            snapshot.local_queue_sizes,
            snapshot.global_queue_size,
            snapshot.created_workers,
            snapshot.counted_blocking_workers,
        )
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Rough state of the pool at one instant; see
/// [`Scheduler::snapshot`]. Not a stable machine-readable format.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    /// Pool name.
    pub name: String,
    /// Configured number of CPU permits.
    pub core_pool_size: usize,
    /// Configured worker ceiling.
    pub max_pool_size: usize,
    /// Workers currently holding a CPU permit.
    pub cpu_workers: usize,
    /// Workers currently executing a probably-blocking task.
    pub blocking_workers: usize,
    /// Workers currently parked.
    pub parked_workers: usize,
    /// Workers draining their own queue before going idle.
    pub retiring_workers: usize,
    /// Workers that have terminated over the pool's lifetime.
    pub terminated_workers: usize,
    /// Local queue sizes of running workers, tagged `c` (CPU), `b`
    /// (blocking) or `r` (retiring).
    pub local_queue_sizes: Vec<String>,
    /// Approximate global queue occupancy.
    pub global_queue_size: usize,
    /// Created-worker count from the packed control state.
    pub created_workers: usize,
    /// Blocking-worker count from the packed control state.
    pub counted_blocking_workers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn test_control_state_packing() {
        let state = 5u64 | (3u64 << BLOCKING_SHIFT);
        assert_eq!(created_of(state), 5);
        assert_eq!(blocking_of(state), 3);
        assert_eq!(created_of(BLOCKING_ONE - 1), (1 << BLOCKING_SHIFT) - 1);
        assert_eq!(blocking_of(BLOCKING_ONE - 1), 0);
    }

    #[test]
    fn test_cpu_permits_bounded() {
        let permits = CpuPermits::new(2);
        assert!(permits.try_acquire());
        assert!(permits.try_acquire());
        assert!(!permits.try_acquire());
        permits.release();
        assert_eq!(permits.available(), 1);
        assert!(permits.try_acquire());
    }

    #[test]
    #[should_panic(expected = "CPU permit released twice")]
    fn test_cpu_permit_double_release_panics() {
        let permits = CpuPermits::new(1);
        permits.release();
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        assert!(Scheduler::new(0, 4).is_err());
        assert!(Scheduler::new(4, 2).is_err());
    }

    #[test]
    fn test_eager_creation_capped_at_two() {
        let scheduler = Scheduler::new(4, 8).unwrap();
        assert_eq!(scheduler.created_workers(), 2);
        scheduler.shutdown();

        let single = Scheduler::new(1, 1).unwrap();
        assert_eq!(single.created_workers(), 1);
        single.shutdown();
    }

    #[test]
    fn test_dispatch_executes_task() {
        let scheduler = Scheduler::new(2, 4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        scheduler.dispatch(TaskMode::NonBlocking, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait_until(Duration::from_secs(5), || {
            counter.load(Ordering::SeqCst) == 1
        }));
        scheduler.shutdown();
    }

    #[test]
    fn test_display_mentions_pool_shape() {
        let scheduler = Scheduler::with_config(SchedulerConfig {
            name: "display-test".to_string(),
            core_pool_size: 2,
            max_pool_size: 4,
            ..SchedulerConfig::default()
        })
        .unwrap();
        let rendered = scheduler.to_string();
        assert!(rendered.contains("display-test"));
        assert!(rendered.contains("core = 2"));
        assert!(rendered.contains("max = 4"));
        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let scheduler = Scheduler::new(1, 2).unwrap();
        scheduler.shutdown();
        assert!(scheduler.is_terminated());
        scheduler.shutdown();
    }

    #[test]
    fn test_no_execution_after_shutdown() {
        let scheduler = Scheduler::new(1, 2).unwrap();
        scheduler.shutdown();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        scheduler.dispatch(TaskMode::NonBlocking, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_task_panic_reported_and_worker_survives() {
        use std::any::Any;

        struct CountingHandler(AtomicUsize);
        impl UncaughtHandler for CountingHandler {
            fn on_task_panic(&self, worker_name: &str, _payload: Box<dyn Any + Send>) {
                assert!(worker_name.contains("worker"));
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let scheduler = Scheduler::with_config(SchedulerConfig {
            core_pool_size: 1,
            max_pool_size: 2,
            uncaught_handler: handler.clone(),
            ..SchedulerConfig::default()
        })
        .unwrap();

        scheduler.dispatch(TaskMode::NonBlocking, || panic!("boom"));
        assert!(wait_until(Duration::from_secs(5), || {
            handler.0.load(Ordering::SeqCst) == 1
        }));

        // The worker is still alive and runs subsequent tasks.
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        scheduler.dispatch(TaskMode::NonBlocking, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait_until(Duration::from_secs(5), || {
            counter.load(Ordering::SeqCst) == 1
        }));
        scheduler.shutdown();
    }

    #[test]
    fn test_hooks_wrap_every_task() {
        struct Recorder {
            before: AtomicUsize,
            after: AtomicUsize,
        }
        impl WorkerHook for Recorder {
            fn before_task(&self) {
                self.before.fetch_add(1, Ordering::SeqCst);
            }
            fn after_task(&self) {
                self.after.fetch_add(1, Ordering::SeqCst);
            }
        }

        let recorder = Arc::new(Recorder {
            before: AtomicUsize::new(0),
            after: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::with_config(SchedulerConfig {
            core_pool_size: 1,
            max_pool_size: 2,
            hooks: vec![recorder.clone()],
            ..SchedulerConfig::default()
        })
        .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = counter.clone();
            scheduler.dispatch(TaskMode::NonBlocking, move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(wait_until(Duration::from_secs(5), || {
            counter.load(Ordering::SeqCst) == 10
        }));
        assert!(wait_until(Duration::from_secs(1), || {
            recorder.after.load(Ordering::SeqCst) == 10
        }));
        assert_eq!(recorder.before.load(Ordering::SeqCst), 10);
        scheduler.shutdown();
    }
}
