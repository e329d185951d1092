//! Worker thread: the main execution loop and its state machine.
//!
//! Every worker owns a local [`WorkQueue`] and moves through five states:
//! `CpuAcquired` while it holds a CPU permit and runs (or hunts for)
//! non-blocking work, `Blocking` while it executes a probably-blocking task
//! with its permit released, `Retiring` while it drains its own queue
//! without polling global work, `Parking` while idle, and the terminal
//! `Terminated`. Idle workers back off in three phases: spin, yield, then
//! exponentially growing timed parks.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI8, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::queue::WorkQueue;
use crate::scheduler::Shared;
use crate::task::{Task, TaskMode};

/// Spin iterations before the idle loop starts yielding.
const MAX_SPINS: u32 = 1000;
/// Spin + yield iterations before the idle loop starts parking.
const MAX_YIELDS: u32 = MAX_SPINS + 500;

/// `next_parked` value marking a worker as physically outside the parked
/// stack. Distinct from 0, which links the bottom of the stack.
pub(crate) const NOT_IN_STACK: usize = usize::MAX;

/// `index` value of a terminated worker.
pub(crate) const INVALID_INDEX: usize = usize::MAX;

// Termination tri-state.
const ALLOWED: i8 = 0;
const FORBIDDEN: i8 = -1;
const TERMINATED: i8 = 1;

/// Worker lifecycle states. Updated only by the owning worker thread;
/// read by anyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WorkerState {
    /// Holds a CPU permit; executing or seeking non-blocking work.
    CpuAcquired = 0,
    /// Executing a probably-blocking task, permit released.
    Blocking = 1,
    /// Idle with a timed park pending or in progress.
    Parking = 2,
    /// Draining its own local queue without taking on global work.
    Retiring = 3,
    /// Terminal state; the thread exits and the pool slot is reclaimed.
    Terminated = 4,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::CpuAcquired,
            1 => Self::Blocking,
            2 => Self::Parking,
            3 => Self::Retiring,
            4 => Self::Terminated,
            other => unreachable!("invalid worker state {other}"),
        }
    }
}

thread_local! {
    /// (scheduler identity, worker identity) of the worker running on this
    /// thread, as raw addresses. Zeroes outside worker threads.
    static CURRENT_WORKER: Cell<(usize, usize)> = const { Cell::new((0, 0)) };
}

/// Returns the worker running on the current thread if it belongs to the
/// scheduler identified by `shared`.
pub(crate) fn current_worker_on(shared: *const Shared) -> *const Worker {
    let (owner, worker) = CURRENT_WORKER.with(Cell::get);
    if owner == shared as usize {
        worker as *const Worker
    } else {
        std::ptr::null()
    }
}

pub(crate) struct Worker {
    /// Position in the live worker array; stable while the worker is
    /// alive, recycled on termination. Written under the scheduler's
    /// worker-array lock.
    index: AtomicUsize,

    pub(crate) local_queue: WorkQueue,

    state: AtomicU8,

    /// Allowed / Forbidden / Terminated. A thread about to unpark this
    /// worker flips Allowed to Forbidden so the worker cannot concurrently
    /// decide to self-terminate.
    termination_state: AtomicI8,

    /// Deadline for idle self-termination; 0 while unset. Also guards
    /// against spurious park wakeups.
    termination_deadline: AtomicU64,

    /// Intrusive link for the parked-worker stack: [`NOT_IN_STACK`], 0 for
    /// the stack bottom, or the address of the next parked worker.
    pub(crate) next_parked: AtomicUsize,

    /// Idle backoff progress; concurrently reset by unparking threads.
    spins: AtomicU32,
    park_time_ns: AtomicU64,

    /// Throttles help requests triggered by stale tasks.
    last_exhaustion_time: AtomicU64,

    /// Xorshift state for steal-victim selection; never zero.
    rng_state: AtomicU32,

    /// Set once by the worker thread itself before it can ever park.
    thread: OnceCell<thread::Thread>,
}

impl Worker {
    pub(crate) fn new(index: usize, rng_seed: u32, min_park_time_ns: u64) -> Self {
        Self {
            index: AtomicUsize::new(index),
            local_queue: WorkQueue::new(),
            state: AtomicU8::new(WorkerState::Retiring as u8),
            termination_state: AtomicI8::new(ALLOWED),
            termination_deadline: AtomicU64::new(0),
            next_parked: AtomicUsize::new(NOT_IN_STACK),
            spins: AtomicU32::new(0),
            park_time_ns: AtomicU64::new(min_park_time_ns),
            last_exhaustion_time: AtomicU64::new(0),
            rng_state: AtomicU32::new(rng_seed | 1),
            thread: OnceCell::new(),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::Relaxed);
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_parking(&self) -> bool {
        self.state() == WorkerState::Parking
    }

    pub(crate) fn is_blocking(&self) -> bool {
        self.state() == WorkerState::Blocking
    }

    /// Wakes the worker's OS thread if it is parked. A no-op before the
    /// worker thread has started, which is fine: such a worker has never
    /// parked and will find work on its own.
    pub(crate) fn unpark(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    /// Flips the termination state to Forbidden on behalf of a thread that
    /// chose this worker to help. Fails only if the worker already
    /// terminated.
    pub(crate) fn try_forbid_termination(&self) -> bool {
        loop {
            match self.termination_state.load(Ordering::Acquire) {
                TERMINATED => return false,
                FORBIDDEN => return true,
                ALLOWED => {
                    if self
                        .termination_state
                        .compare_exchange(ALLOWED, FORBIDDEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                }
                other => unreachable!("invalid termination state {other}"),
            }
        }
    }

    /// Commits termination. Losing this race to a concurrent
    /// [`Self::try_forbid_termination`] aborts the termination attempt.
    pub(crate) fn try_commit_termination(&self) -> bool {
        self.termination_state
            .compare_exchange(ALLOWED, TERMINATED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Resets backoff counters on behalf of the thread that is about to
    /// unpark this worker, so it retries stealing from the fast end.
    pub(crate) fn idle_reset_before_unpark(&self, min_park_time_ns: u64) {
        self.park_time_ns.store(min_park_time_ns, Ordering::Relaxed);
        self.spins.store(0, Ordering::Relaxed);
    }

    /// Acquires a CPU permit unless the worker already holds one. Returns
    /// whether the worker now holds a permit.
    pub(crate) fn try_acquire_cpu_permit(&self, shared: &Shared) -> bool {
        if self.state() == WorkerState::CpuAcquired {
            return true;
        }
        if shared.cpu_permits.try_acquire() {
            self.set_state(WorkerState::CpuAcquired);
            return true;
        }
        false
    }

    /// Moves to `new_state`, releasing the CPU permit if one is held.
    /// Returns whether a permit was held. The state is cleared before the
    /// permit is released so the count of CPU-acquired workers never
    /// exceeds the permit capacity.
    fn try_release_cpu(&self, shared: &Shared, new_state: WorkerState) -> bool {
        let previous = self.state();
        let had_permit = previous == WorkerState::CpuAcquired;
        if previous != new_state {
            self.set_state(new_state);
        }
        if had_permit {
            shared.cpu_permits.release();
        }
        had_permit
    }

    /// Marks this worker as terminated for bookkeeping. Called under the
    /// scheduler's worker-array lock.
    pub(crate) fn finish_termination(&self, shared: &Shared) {
        self.set_index(INVALID_INDEX);
        self.try_release_cpu(shared, WorkerState::Terminated);
    }

    /// Thread entry point.
    pub(crate) fn run(self: &Arc<Self>, shared: &Arc<Shared>) {
        self.thread
            .set(thread::current())
            .expect("worker thread started twice");
        CURRENT_WORKER.with(|current| {
            current.set((Arc::as_ptr(shared) as usize, Arc::as_ptr(self) as usize))
        });

        let mut was_idle = false;
        while !shared.is_terminated() && self.state() != WorkerState::Terminated {
            match self.find_task(shared) {
                Some(task) => {
                    if was_idle {
                        self.idle_reset(shared, task.mode);
                        was_idle = false;
                    }
                    let mode = task.mode;
                    let submission_time = task.submission_time;
                    self.before_task(shared, mode, submission_time);
                    self.run_safely(shared, task);
                    self.after_task(shared, mode);
                }
                None => {
                    if self.state() == WorkerState::CpuAcquired {
                        self.cpu_worker_idle(shared);
                    } else {
                        self.blocking_worker_idle(shared);
                    }
                    was_idle = true;
                }
            }
        }

        self.try_release_cpu(shared, WorkerState::Terminated);
        CURRENT_WORKER.with(|current| current.set((0, 0)));

        #[cfg(debug_assertions)]
        eprintln!("{} worker exiting", shared.pool_name());
    }

    /// Executes a task, catching panics and reporting them to the
    /// uncaught handler. The worker itself survives.
    fn run_safely(&self, shared: &Shared, task: Task) {
        for hook in shared.hooks() {
            hook.before_task();
        }
        let block = task.block;
        let result = catch_unwind(AssertUnwindSafe(block));
        for hook in shared.hooks().iter().rev() {
            hook.after_task();
        }
        if let Err(payload) = result {
            let name = format!("{}-worker-{}", shared.pool_name(), self.index());
            shared.uncaught_handler().on_task_panic(&name, payload);
        }
    }

    fn before_task(&self, shared: &Arc<Shared>, mode: TaskMode, submission_time: u64) {
        if mode != TaskMode::NonBlocking {
            // The blocking counter must grow before the permit is released
            // so a concurrent capacity request counts this thread as
            // blocking.
            shared.increment_blocking_workers();
            if self.try_release_cpu(shared, WorkerState::Blocking) {
                shared.request_cpu_worker();
            }
            return;
        }
        if shared.cpu_permits.available() == 0 {
            return;
        }
        // The task sat queued past the steal resolution while CPU permits
        // were idle: wake one more worker, throttled per worker.
        let now = shared.nanos();
        let resolution = shared.tunables().steal_resolution_ns;
        if now.saturating_sub(submission_time) >= resolution
            && now.saturating_sub(self.last_exhaustion_time.load(Ordering::Relaxed))
                >= resolution * 5
        {
            self.last_exhaustion_time.store(now, Ordering::Relaxed);
            shared.request_cpu_worker();
        }
    }

    fn after_task(&self, shared: &Shared, mode: TaskMode) {
        if mode != TaskMode::NonBlocking {
            shared.decrement_blocking_workers();
            let state = self.state();
            assert!(
                state == WorkerState::Blocking,
                "expected Blocking state after a blocking task, got {state:?}"
            );
            self.set_state(WorkerState::Retiring);
        }
    }

    /// Task discovery. With a permit: global/local queues with an
    /// anti-starvation coin flip, then stealing. Without: local leftovers,
    /// then pending blocking work from the global queue.
    fn find_task(&self, shared: &Arc<Shared>) -> Option<Task> {
        if self.try_acquire_cpu_permit(shared) {
            return self.find_task_with_cpu_permit(shared);
        }
        self.local_queue
            .poll()
            .or_else(|| shared.global_queue.remove_first_blocking())
    }

    fn find_task_with_cpu_permit(&self, shared: &Arc<Shared>) -> Option<Task> {
        // Poll the global queue first once per 2 * core_pool_size calls on
        // average, so neither global nor local work can starve the other.
        let global_first = self.next_int(2 * shared.tunables().core_pool_size as u32) == 0;
        if global_first {
            if let Some(task) = shared.global_queue.remove_first() {
                return Some(task);
            }
        }
        if let Some(task) = self.local_queue.poll() {
            return Some(task);
        }
        if !global_first {
            if let Some(task) = shared.global_queue.remove_first() {
                return Some(task);
            }
        }
        self.try_steal(shared)
    }

    fn try_steal(&self, shared: &Shared) -> Option<Task> {
        let created = shared.created_workers();
        // Nothing worth stealing with fewer than two workers.
        if created < 2 {
            return None;
        }
        let victim = {
            let workers = shared.workers.read();
            workers.get(self.next_int(created as u32) as usize).cloned()
        };
        if let Some(victim) = victim {
            if !std::ptr::eq(Arc::as_ptr(&victim), self)
                && self.local_queue.try_steal(
                    &victim.local_queue,
                    &shared.global_queue,
                    shared.nanos(),
                    shared.tunables().steal_resolution_ns,
                )
            {
                return self.local_queue.poll();
            }
        }
        None
    }

    /// Adaptive idle for permit holders: spin, then yield, then release
    /// the permit and park for exponentially increasing intervals.
    fn cpu_worker_idle(&self, shared: &Arc<Shared>) {
        let spins = self.spins.load(Ordering::Relaxed);
        if spins <= MAX_YIELDS {
            self.spins.store(spins + 1, Ordering::Relaxed);
            if spins >= MAX_SPINS {
                thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        } else {
            let max_park = shared.tunables().max_park_time_ns;
            let park = self.park_time_ns.load(Ordering::Relaxed);
            if park < max_park {
                // Grow by 1.5x up to the ceiling.
                self.park_time_ns
                    .store((park.saturating_mul(3) >> 1).min(max_park), Ordering::Relaxed);
            }
            self.try_release_cpu(shared, WorkerState::Parking);
            self.do_park(shared, self.park_time_ns.load(Ordering::Relaxed));
        }
    }

    /// Idle for permit-less workers: one last check for pending blocking
    /// work, then a keep-alive park and, past the deadline, an attempt to
    /// self-terminate.
    fn blocking_worker_idle(&self, shared: &Arc<Shared>) {
        self.try_release_cpu(shared, WorkerState::Parking);
        if !self.blocking_quiescence(shared) {
            return;
        }
        self.termination_state.store(ALLOWED, Ordering::Release);
        let keep_alive = shared.tunables().keep_alive_ns;
        if self.termination_deadline.load(Ordering::Relaxed) == 0 {
            self.termination_deadline
                .store(shared.nanos() + keep_alive, Ordering::Relaxed);
        }
        self.do_park(shared, keep_alive);
        let deadline = self.termination_deadline.load(Ordering::Relaxed);
        // Wraparound-safe deadline comparison.
        if deadline != 0 && (shared.nanos().wrapping_sub(deadline) as i64) >= 0 {
            // Reset first: if the termination attempt fails, the next idle
            // cycle extends the deadline again.
            self.termination_deadline.store(0, Ordering::Relaxed);
            shared.try_terminate_worker(self);
        }
    }

    /// Checks whether blocking work arrived while this worker was deciding
    /// to go idle, and claims it into the local queue if so. Returns `true`
    /// when no blocking work is pending.
    pub(crate) fn blocking_quiescence(&self, shared: &Shared) -> bool {
        if let Some(task) = shared.global_queue.remove_first_blocking() {
            self.local_queue.add(task, &shared.global_queue);
            return false;
        }
        true
    }

    /// Registers in the parked stack and parks the OS thread. Always
    /// called by the worker itself, with registration strictly before the
    /// park so an unparker cannot miss it.
    fn do_park(&self, shared: &Shared, nanos: u64) {
        shared.parked_workers_push(self);
        thread::park_timeout(Duration::from_nanos(nanos));
    }

    /// Invoked by this worker when it finds a task after being idle.
    fn idle_reset(&self, shared: &Shared, mode: TaskMode) {
        self.termination_deadline.store(0, Ordering::Relaxed);
        if self.state() == WorkerState::Parking {
            // A parking worker holds no permit, so the task must have come
            // from the blocking-mode paths.
            debug_assert!(mode == TaskMode::ProbablyBlocking);
            self.set_state(WorkerState::Blocking);
            self.park_time_ns
                .store(shared.tunables().min_park_time_ns, Ordering::Relaxed);
        }
        self.spins.store(0, Ordering::Relaxed);
    }

    /// Marsaglia xorshift with a fast path for power-of-two bounds.
    fn next_int(&self, upper_bound: u32) -> u32 {
        let mut state = self.rng_state.load(Ordering::Relaxed);
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        self.rng_state.store(state, Ordering::Relaxed);
        let mask = upper_bound - 1;
        if mask & upper_bound == 0 {
            return state & mask;
        }
        (state & i32::MAX as u32) % upper_bound
    }
}
