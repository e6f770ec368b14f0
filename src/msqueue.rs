//! Michael-Scott lock-free FIFO queue.
//!
//! A linked-list multi-producer/multi-consumer queue where both
//! `enqueue` and `dequeue` are single-CAS operations, linearizing at the
//! successful `next`-CAS (enqueue) and the successful `head`-CAS
//! (dequeue) respectively. Memory is reclaimed through
//! [`crate::hp::HazardDomain`] (component B) — no predicate is needed
//! here since a dequeued node is never referenced again once unlinked.

use core::sync::atomic::{AtomicPtr, Ordering};
use std::ptr;

use crate::hp::{HazardDomain, HpThread};
use crate::QueueError;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    item: Option<T>,
}

impl<T> Node<T> {
    fn sentinel() -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            item: None,
        }))
    }

    fn with_item(item: T) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            item: Some(item),
        }))
    }
}

/// A lock-free multi-producer/multi-consumer queue (Michael & Scott, 1996).
pub struct MsQueue<T> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    hazards: HazardDomain<Node<T>>,
}

// SAFETY: all shared fields are atomics or behind the hazard domain's own
// synchronization; `T` crossing threads is the caller's `Send` bound.
unsafe impl<T: Send> Send for MsQueue<T> {}
unsafe impl<T: Send> Sync for MsQueue<T> {}

impl<T: 'static> MsQueue<T> {
    /// Create an empty queue sized for up to `max_threads` concurrent workers.
    pub fn new(max_threads: usize) -> Self {
        let sentinel = Node::sentinel();
        Self {
            head: AtomicPtr::new(sentinel),
            tail: AtomicPtr::new(sentinel),
            hazards: HazardDomain::new(max_threads, 1, 0),
        }
    }

    /// Register the calling thread, returning a handle for `enqueue`/`dequeue`.
    pub fn worker(&self) -> MsQueueWorker<'_, T> {
        MsQueueWorker {
            queue: self,
            hp: self.hazards.register(),
        }
    }

    /// A class-name string, as benchmark drivers in the source library expect.
    pub fn class_name() -> &'static str {
        "ms-queue"
    }

    /// `true` iff the queue currently holds no items. Racy under
    /// concurrent mutation; intended for tests and diagnostics.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        next.is_null()
    }
}

impl<T> Drop for MsQueue<T> {
    fn drop(&mut self) {
        let mut current = self.head.load(Ordering::Relaxed);
        while !current.is_null() {
            // SAFETY: sole owner during drop; every node on the list was
            // allocated with `Box::into_raw` and never freed elsewhere.
            unsafe {
                let next = (*current).next.load(Ordering::Relaxed);
                drop(Box::from_raw(current));
                current = next;
            }
        }
    }
}

/// A thread's registered handle for operating on an [`MsQueue`].
pub struct MsQueueWorker<'a, T: 'static> {
    queue: &'a MsQueue<T>,
    hp: HpThread<'a, Node<T>>,
}

impl<'a, T: 'static> MsQueueWorker<'a, T> {
    const TAIL_SLOT: usize = 0;
    const HEAD_SLOT: usize = 0;

    /// Enqueue `item`. Always succeeds for this unbounded queue.
    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        let node = Node::with_item(item);
        loop {
            let tail = self.hp.protect(Self::TAIL_SLOT, &self.queue.tail);
            // SAFETY: `tail` is hazard-protected and therefore not retired.
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };

            if self.queue.tail.load(Ordering::Acquire) != tail {
                continue;
            }

            if next.is_null() {
                // SAFETY: tail is protected; CAS linearizes the enqueue.
                let cas = unsafe {
                    (*tail).next.compare_exchange(
                        ptr::null_mut(),
                        node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                };
                if cas.is_ok() {
                    let _ = self.queue.tail.compare_exchange(
                        tail,
                        node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    self.hp.clear(Self::TAIL_SLOT);
                    return Ok(());
                }
            } else {
                // Another enqueuer linked a node but hadn't swung tail yet; help.
                let _ = self.queue.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
    }

    /// Dequeue the oldest item, or `None` if the queue is empty.
    pub fn dequeue(&self) -> Option<T> {
        loop {
            let head = self.hp.protect(Self::HEAD_SLOT, &self.queue.head);
            let tail = self.queue.tail.load(Ordering::Acquire);
            // SAFETY: head is hazard-protected.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };

            if self.queue.head.load(Ordering::Acquire) != head {
                continue;
            }

            if next.is_null() {
                self.hp.clear(Self::HEAD_SLOT);
                return None;
            }

            if head == tail {
                let _ = self.queue.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }

            // SAFETY: `next` is reachable from a protected `head`; read the
            // item before the CAS that may hand `head` to the reclaimer.
            let item = unsafe { (*next).item.take() };

            if self
                .queue
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.hp.clear(Self::HEAD_SLOT);
                // SAFETY: `head` is now unreachable from the queue; no
                // predicate is needed, only hazard-pointer freedom.
                unsafe { self.hp.retire(head) };
                return item;
            }
            // Lost the CAS race; put the item back and retry.
            // SAFETY: `next` has not been retired (the CAS above failed).
            unsafe {
                (*next).item = item;
            }
        }
    }
}
