//! Bounded work queue owned by a single worker.
//!
//! The queue is a fixed-capacity ring buffer plus a dedicated
//! "last scheduled" slot. A worker dispatching from within one of its own
//! tasks lands in that slot, displacing the previous occupant to the ring's
//! tail. This keeps request/response-style task chains on the same thread
//! with minimal latency while the head-to-tail rotation preserves semi-FIFO
//! order overall.
//!
//! Only the owning worker may `add`/`add_last`/`poll`; any other worker may
//! `try_steal` a batch from the consumer end or query the size. When the
//! ring fills up, half of it is offloaded to the global queue so the buffer
//! never grows.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::global_queue::GlobalQueue;
use crate::task::Task;

/// Ring capacity. Power of two so indices wrap by masking.
const BUFFER_CAPACITY: usize = 128;
const MASK: u32 = BUFFER_CAPACITY as u32 - 1;

/// One ring cell. The submission timestamp is mirrored next to the task
/// pointer so stealers can apply the staleness gate without dereferencing
/// a task they do not yet own.
struct Slot {
    task: AtomicPtr<Task>,
    submission_time: AtomicU64,
}

pub(crate) struct WorkQueue {
    buffer: Box<[Slot; BUFFER_CAPACITY]>,
    /// Head-insert slot for tasks dispatched by the owner itself.
    last_scheduled: AtomicPtr<Task>,
    /// Written only by the owner.
    producer_index: AtomicU32,
    /// Advanced by CAS from the owner and from stealers.
    consumer_index: AtomicU32,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self {
            buffer: Box::new(std::array::from_fn(|_| Slot {
                task: AtomicPtr::new(ptr::null_mut()),
                submission_time: AtomicU64::new(0),
            })),
            last_scheduled: AtomicPtr::new(ptr::null_mut()),
            producer_index: AtomicU32::new(0),
            consumer_index: AtomicU32::new(0),
        }
    }

    /// Ring occupancy, excluding the last-scheduled slot. Non-atomic
    /// snapshot; callers use it only as a soft threshold.
    pub(crate) fn buffer_size(&self) -> u32 {
        self.producer_index
            .load(Ordering::Acquire)
            .wrapping_sub(self.consumer_index.load(Ordering::Acquire))
    }

    /// Total queued tasks, including the last-scheduled slot.
    pub(crate) fn size(&self) -> u32 {
        let extra = u32::from(!self.last_scheduled.load(Ordering::Acquire).is_null());
        self.buffer_size() + extra
    }

    /// Inserts at the producer head: the new task takes the last-scheduled
    /// slot and the displaced task is re-enqueued at the tail. Returns
    /// `true` if the insertion offloaded tasks to the global queue.
    ///
    /// Owner only.
    pub(crate) fn add(&self, task: Task, overflow: &GlobalQueue) -> bool {
        let new = Box::into_raw(Box::new(task));
        let previous = self.last_scheduled.swap(new, Ordering::AcqRel);
        if previous.is_null() {
            return false;
        }
        self.add_last_ptr(previous, overflow)
    }

    /// Fair variant: inserts at the tail, bypassing the last-scheduled
    /// slot. Returns `true` if the insertion offloaded tasks.
    ///
    /// Owner only.
    pub(crate) fn add_last(&self, task: Task, overflow: &GlobalQueue) -> bool {
        self.add_last_ptr(Box::into_raw(Box::new(task)), overflow)
    }

    fn add_last_ptr(&self, task: *mut Task, overflow: &GlobalQueue) -> bool {
        let mut offloaded = false;
        while !self.try_add_last(task) {
            self.offload(overflow);
            offloaded = true;
        }
        offloaded
    }

    /// Removes the next task for the owning worker: the last-scheduled slot
    /// first, then the ring head.
    ///
    /// Owner only.
    pub(crate) fn poll(&self) -> Option<Task> {
        let last = self.last_scheduled.swap(ptr::null_mut(), Ordering::AcqRel);
        if !last.is_null() {
            return Some(*unsafe { Box::from_raw(last) });
        }
        self.poll_buffer(|_| true)
    }

    /// Moves a batch (half the victim's ring, at least one) of sufficiently
    /// stale tasks from `victim` into this queue. A task is stealable once
    /// `now - submission_time >= resolution_ns`. Returns whether anything
    /// was stolen.
    ///
    /// Called by the owner of `self`, never of `victim`.
    pub(crate) fn try_steal(
        &self,
        victim: &WorkQueue,
        overflow: &GlobalQueue,
        now: u64,
        resolution_ns: u64,
    ) -> bool {
        let buffer_size = victim.buffer_size();
        if buffer_size == 0 {
            return false;
        }
        let mut stolen = false;
        for _ in 0..(buffer_size / 2).max(1) {
            match victim.poll_buffer(|submitted| now.saturating_sub(submitted) >= resolution_ns) {
                Some(task) => {
                    self.add(task, overflow);
                    stolen = true;
                }
                None => break,
            }
        }
        stolen
    }

    fn try_add_last(&self, task: *mut Task) -> bool {
        if self.buffer_size() == BUFFER_CAPACITY as u32 - 1 {
            return false;
        }
        let producer = self.producer_index.load(Ordering::Relaxed);
        let slot = &self.buffer[(producer & MASK) as usize];
        // A non-null cell means a consumer that already claimed this index
        // has not yet taken its task; treat the ring as full.
        if !slot.task.load(Ordering::Acquire).is_null() {
            return false;
        }
        slot.submission_time
            .store(unsafe { (*task).submission_time }, Ordering::Relaxed);
        slot.task.store(task, Ordering::Release);
        self.producer_index
            .store(producer.wrapping_add(1), Ordering::Release);
        true
    }

    /// Moves half of the ring into the global queue to make room.
    fn offload(&self, overflow: &GlobalQueue) {
        for _ in 0..(self.buffer_size() / 2).max(1) {
            match self.poll_buffer(|_| true) {
                Some(task) => overflow.add_last(task),
                None => return,
            }
        }
    }

    /// Claims the ring head by CAS on the consumer index. Shared by the
    /// owner's poll, stealers and overflow offloading; `eligible` sees the
    /// mirrored submission timestamp of the head task.
    fn poll_buffer(&self, eligible: impl Fn(u64) -> bool) -> Option<Task> {
        loop {
            let consumer = self.consumer_index.load(Ordering::Acquire);
            if consumer == self.producer_index.load(Ordering::Acquire) {
                return None;
            }
            let slot = &self.buffer[(consumer & MASK) as usize];
            // Stable while our CAS below can still succeed: the producer
            // rewrites a cell only after the consumer index passed it.
            if !eligible(slot.submission_time.load(Ordering::Relaxed)) {
                return None;
            }
            if self
                .consumer_index
                .compare_exchange(
                    consumer,
                    consumer.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let task = slot.task.swap(ptr::null_mut(), Ordering::AcqRel);
                assert!(!task.is_null(), "claimed an empty work queue cell");
                return Some(*unsafe { Box::from_raw(task) });
            }
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        while self.poll().is_some() {}
    }
}
