//! Unbounded lock-free MPMC queue for externally submitted tasks and
//! local-queue overflow.
//!
//! A Michael-Scott linked queue with epoch-based node reclamation.
//! Besides the usual append/pop operations it supports a conditional
//! pop-first used by permit-less workers to extract a pending blocking
//! task before they commit to parking or terminating.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::epoch::{self, Atomic, Owned, Shared};
use crossbeam::utils::CachePadded;

use crate::task::{Task, TaskMode};

struct Node {
    /// Payload, taken exactly once by the consumer that wins the head CAS.
    task: UnsafeCell<Option<Task>>,
    /// Mode mirror so predicates never dereference a payload they do not
    /// yet own. Meaningless on the sentinel.
    mode: TaskMode,
    next: Atomic<Node>,
}

impl Node {
    fn sentinel() -> Self {
        Self {
            task: UnsafeCell::new(None),
            mode: TaskMode::NonBlocking,
            next: Atomic::null(),
        }
    }
}

/// Shared FIFO-ish task queue. FIFO order holds among operations that do
/// not race; concurrent producers may interleave arbitrarily.
pub(crate) struct GlobalQueue {
    head: CachePadded<Atomic<Node>>,
    tail: CachePadded<Atomic<Node>>,
    /// Approximate occupancy, maintained for diagnostics and soft checks.
    len: AtomicUsize,
}

// Payloads are `Send`; the queue hands each task to exactly one consumer.
unsafe impl Send for GlobalQueue {}
unsafe impl Sync for GlobalQueue {}

impl GlobalQueue {
    pub(crate) fn new() -> Self {
        let queue = Self {
            head: CachePadded::new(Atomic::null()),
            tail: CachePadded::new(Atomic::null()),
            len: AtomicUsize::new(0),
        };
        unsafe {
            let guard = epoch::unprotected();
            let sentinel = Owned::new(Node::sentinel()).into_shared(guard);
            queue.head.store(sentinel, Ordering::Relaxed);
            queue.tail.store(sentinel, Ordering::Relaxed);
        }
        queue
    }

    /// Appends a task at the tail.
    pub(crate) fn add_last(&self, task: Task) {
        let mode = task.mode;
        let guard = epoch::pin();
        let node = Owned::new(Node {
            task: UnsafeCell::new(Some(task)),
            mode,
            next: Atomic::null(),
        })
        .into_shared(&guard);

        loop {
            let tail = self.tail.load(Ordering::Acquire, &guard);
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, &guard);
            if !next.is_null() {
                // Tail is lagging; help it along and retry.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
                continue;
            }
            if tail_ref
                .next
                .compare_exchange(
                    Shared::null(),
                    node,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                )
                .is_ok()
            {
                let _ = self.tail.compare_exchange(
                    tail,
                    node,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
                self.len.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Removes and returns the first task, or `None` if the queue is empty.
    pub(crate) fn remove_first(&self) -> Option<Task> {
        self.remove_first_if(|_| true)
    }

    /// Removes the first task only if it is probably-blocking.
    pub(crate) fn remove_first_blocking(&self) -> Option<Task> {
        self.remove_first_if(|mode| mode == TaskMode::ProbablyBlocking)
    }

    fn remove_first_if(&self, take: impl Fn(TaskMode) -> bool) -> Option<Task> {
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            let head_ref = unsafe { head.deref() };
            let next = head_ref.next.load(Ordering::Acquire, &guard);
            let next_ref = unsafe { next.as_ref() }?;
            if !take(next_ref.mode) {
                return None;
            }
            let tail = self.tail.load(Ordering::Relaxed, &guard);
            if head == tail {
                // Help a lagging tail past the node we are about to unlink.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
            }
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed, &guard)
                .is_ok()
            {
                // Winning the head CAS grants exclusive payload access;
                // `next` becomes the new sentinel.
                let task = unsafe { (*next_ref.task.get()).take() };
                unsafe { guard.defer_destroy(head) };
                self.len.fetch_sub(1, Ordering::Relaxed);
                return Some(task.expect("dequeued a node without a payload"));
            }
        }
    }

    /// Approximate number of queued tasks.
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

impl Drop for GlobalQueue {
    fn drop(&mut self) {
        // Exclusive access: walk the chain and free nodes, dropping any
        // tasks that were never executed.
        unsafe {
            let guard = epoch::unprotected();
            let mut node = self.head.load(Ordering::Relaxed, guard);
            while !node.is_null() {
                let next = node.deref().next.load(Ordering::Relaxed, guard);
                drop(node.into_owned());
                node = next;
            }
        }
    }
}
