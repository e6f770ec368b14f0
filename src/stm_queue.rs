//! A FIFO queue built directly on the [`crate::stm`] runtime, as a
//! baseline to compare the hand-rolled lock-free queues against: every
//! operation is a single atomic block, correctness follows from the STM's
//! conflict detection rather than from a bespoke CAS protocol.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::stm::{AbortReason, Stm, TxAttrs};
use crate::QueueError;

/// A transactional node. The queue stores items in a `Vec` guarded by
/// a plain `Mutex`, with the STM used only to manage `head`/`tail`/`len`
/// as transactional words; this mirrors how the source library's
/// benchmarks build an "STM queue" atop a fixed ring rather than a
/// transactional linked list, since word-STM does not itself provide
/// transactional heap allocation for arbitrary `T`.
struct Ring<T> {
    slots: Mutex<Vec<Option<T>>>,
    capacity: usize,
}

/// A bounded multi-producer/multi-consumer queue whose `enqueue` and
/// `dequeue` are STM atomic blocks over `head`, `tail`, and `len`.
pub struct StmQueue<T> {
    stm: Stm,
    head: AtomicU64,
    tail: AtomicU64,
    len: AtomicU64,
    ring: Ring<T>,
}

impl<T> StmQueue<T> {
    /// Create a bounded queue of `capacity` slots, sharing `stm` with
    /// whatever other transactional state the caller maintains.
    pub fn new(stm: Stm, capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::InvalidArgument);
        }
        Ok(Self {
            stm,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            len: AtomicU64::new(0),
            ring: Ring {
                slots: Mutex::new((0..capacity).map(|_| None).collect()),
                capacity,
            },
        })
    }

    pub fn class_name() -> &'static str {
        "stm-queue"
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    /// Register the calling thread with the underlying STM. Required
    /// once per thread before `enqueue`/`dequeue`, matching
    /// [`Stm::init_thread`].
    pub fn init_thread(&self) {
        self.stm.init_thread();
    }

    pub fn exit_thread(&self) {
        self.stm.exit_thread();
    }

    /// Enqueue `item`, retrying the transaction until it commits.
    /// Returns `Err(QueueError::Full)` once the atomic block observes the
    /// ring at capacity (not retried — a full queue is not a transient
    /// conflict).
    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        let capacity = self.ring.capacity as u64;
        let mut slot_to_fill: Option<usize> = None;
        let mut rejected = false;

        self.stm.atomically(TxAttrs::default(), |tx| -> Result<(), AbortReason> {
            let len = tx.load(&self.len)?;
            if len >= capacity {
                rejected = true;
                return Ok(());
            }
            let tail = tx.load(&self.tail)?;
            let idx = (tail % capacity) as usize;
            slot_to_fill = Some(idx);
            tx.store(&self.tail, (tail + 1) % capacity)?;
            tx.store(&self.len, len + 1)?;
            Ok(())
        });

        if rejected {
            return Err(QueueError::Full);
        }
        let idx = slot_to_fill.expect("committed enqueue always picks a slot");
        self.ring.slots.lock().unwrap()[idx] = Some(item);
        Ok(())
    }

    /// Dequeue the oldest item, or `None` if the queue was empty at the
    /// moment the transaction committed.
    pub fn dequeue(&self) -> Option<T> {
        let mut slot_to_take: Option<usize> = None;

        self.stm.atomically(TxAttrs::default(), |tx| -> Result<(), AbortReason> {
            let len = tx.load(&self.len)?;
            if len == 0 {
                slot_to_take = None;
                return Ok(());
            }
            let head = tx.load(&self.head)?;
            let capacity = self.ring.capacity as u64;
            let idx = (head % capacity) as usize;
            slot_to_take = Some(idx);
            tx.store(&self.head, (head + 1) % capacity)?;
            tx.store(&self.len, len - 1)?;
            Ok(())
        });

        slot_to_take.and_then(|idx| self.ring.slots.lock().unwrap()[idx].take())
    }

    pub fn is_empty(&self) -> bool {
        self.len.load(Ordering::Acquire) == 0
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stm::Stm;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_rejects_zero_capacity() {
        let stm = Stm::init();
        assert!(StmQueue::<i32>::new(stm, 0).is_err());
    }

    #[test]
    fn test_enqueue_dequeue_order() {
        let stm = Stm::init();
        let q = StmQueue::new(stm, 4).unwrap();
        q.init_thread();

        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        q.enqueue(3).unwrap();

        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn test_enqueue_full_returns_err() {
        let stm = Stm::init();
        let q = StmQueue::new(stm, 2).unwrap();
        q.init_thread();

        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        assert_eq!(q.enqueue(3), Err(QueueError::Full));
    }

    #[test]
    fn test_mpmc_multiset_preserved() {
        const PRODUCERS: i32 = 4;
        const PER_PRODUCER: i32 = 100;

        let stm = Stm::init();
        let q = Arc::new(StmQueue::<i32>::new(stm, 64).unwrap());
        let mut handles = Vec::new();

        for p in 0..PRODUCERS {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                q.init_thread();
                for i in 0..PER_PRODUCER {
                    loop {
                        if q.enqueue(p * PER_PRODUCER + i).is_ok() {
                            break;
                        }
                        thread::yield_now();
                    }
                }
                q.exit_thread();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        q.init_thread();
        let mut collected = Vec::new();
        while collected.len() < (PRODUCERS * PER_PRODUCER) as usize {
            if let Some(v) = q.dequeue() {
                collected.push(v);
            } else {
                thread::yield_now();
            }
        }

        collected.sort_unstable();
        let mut expected: Vec<i32> = (0..PRODUCERS * PER_PRODUCER).collect();
        expected.sort_unstable();
        assert_eq!(collected, expected);
    }
}
