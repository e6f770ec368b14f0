//! Hazard pointer memory reclamation.
//!
//! Hazard pointers give a reader a way to announce "I am dereferencing
//! this address" so that a concurrent reclaimer knows not to free it.
//! Each registered thread owns a fixed-size row of announce slots in a
//! `[thread][slot]` table; retirement scans every row before freeing a
//! node.
//!
//! This module also implements the hazard-pointer-with-predicate variant
//! SimQueue needs (component C of the design): a node is only freed once
//! no slot names it *and* a caller-supplied `still_referenced` check
//! returns false. Plain hazard-pointer reclamation (component B, used by
//! the Michael-Scott queue) is the same domain with the predicate check
//! omitted — [`HpThread::retire`] is [`HpThread::retire_with`] with an
//! always-false predicate.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::ptr;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::cc;

/// A retired node awaiting reclamation, with its optional liveness predicate.
struct Retired<T> {
    ptr: *mut T,
    /// `Some(f)` iff the retiring call was [`HpThread::retire_with`]; `f(ptr)`
    /// returning `true` means some non-hazard-pointer structure still
    /// references the node and it must not be freed yet.
    still_referenced: Option<Box<dyn Fn(*const T) -> bool + Send>>,
}

// SAFETY: `ptr` is a raw pointer to a heap node this domain exclusively
// owns once retired; it is never dereferenced except by the single thread
// running `scan`, and only after confirming no hazard pointer names it.
unsafe impl<T> Send for Retired<T> {}

/// One thread's row of hazard slots, cache-line isolated from its neighbours.
struct Row<T> {
    slots: Box<[AtomicPtr<T>]>,
    active: AtomicBool,
}

impl<T> Row<T> {
    fn new(max_slots: usize) -> Self {
        Self {
            slots: (0..max_slots).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            active: AtomicBool::new(false),
        }
    }
}

/// A hazard-pointer reclamation domain for nodes of type `T`.
///
/// `max_threads` bounds the number of concurrently registered threads
/// (construction-time, per the design note that a hard-coded 128-thread
/// cap should instead be a parameter); `max_slots` bounds the number of
/// hazard slots a single thread may hold at once.
pub struct HazardDomain<T> {
    rows: Box<[CachePadded<Row<T>>]>,
    retired: Box<[Mutex<Vec<Retired<T>>>]>,
    free_mask: Vec<AtomicU64>,
    max_slots: usize,
    /// Scan threshold `R`; the spec permits `R = 0` (scan on every retire).
    scan_threshold: usize,
}

impl<T> HazardDomain<T> {
    /// Create a new domain sized for `max_threads` threads with `max_slots`
    /// hazard slots each, scanning a thread's retire list once it reaches
    /// `scan_threshold` entries (`0` scans on every retirement).
    pub fn new(max_threads: usize, max_slots: usize, scan_threshold: usize) -> Self {
        let words = max_threads.div_ceil(64).max(1);
        Self {
            rows: (0..max_threads)
                .map(|_| CachePadded::new(Row::new(max_slots)))
                .collect(),
            retired: (0..max_threads).map(|_| Mutex::new(Vec::new())).collect(),
            free_mask: (0..words).map(|_| AtomicU64::new(u64::MAX)).collect(),
            max_slots,
            scan_threshold,
        }
    }

    /// Register the current thread, returning a handle bound to a freshly
    /// allocated thread id in `[0, max_threads)`.
    ///
    /// Panics if every thread id is in use; callers should size
    /// `max_threads` to the maximum concurrency they intend to run.
    pub fn register(&self) -> HpThread<'_, T> {
        let max_threads = self.rows.len();
        for (word_idx, word) in self.free_mask.iter().enumerate() {
            let mut observed = word.load(Ordering::Acquire);
            while observed != 0 {
                let bit = cc::ctz_u64(observed);
                let mask = 1u64 << bit;
                match word.compare_exchange_weak(
                    observed,
                    observed & !mask,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let tid = word_idx * 64 + bit as usize;
                        if tid < max_threads {
                            self.rows[tid].active.store(true, Ordering::Release);
                            return HpThread { domain: self, tid };
                        }
                        // Slot belongs to padding past max_threads; give it back.
                        word.fetch_or(mask, Ordering::AcqRel);
                        observed &= !mask;
                    }
                    Err(new_observed) => observed = new_observed,
                }
            }
        }
        panic!("HazardDomain::register: no free thread slot (max_threads exhausted)");
    }

    fn release(&self, tid: usize) {
        self.rows[tid].active.store(false, Ordering::Release);
        let word = tid / 64;
        let bit = tid % 64;
        self.free_mask[word].fetch_or(1 << bit, Ordering::AcqRel);
    }

    fn is_hazardous(&self, candidate: *mut T) -> bool {
        self.rows.iter().any(|row| {
            row.active.load(Ordering::Acquire)
                && row
                    .slots
                    .iter()
                    .any(|slot| slot.load(Ordering::Acquire) == candidate)
        })
    }
}

/// A registered thread's handle into a [`HazardDomain`].
///
/// Dropping the handle clears every hazard slot and releases the thread
/// id back to the domain; it does not drain the retire list, since
/// another thread may still be consulting this thread's row before its
/// nodes are fully unreferenced.
pub struct HpThread<'a, T: 'static> {
    domain: &'a HazardDomain<T>,
    tid: usize,
}

impl<'a, T: 'static> HpThread<'a, T> {
    /// The thread id this handle owns, in `[0, max_threads)`.
    pub fn id(&self) -> usize {
        self.tid
    }

    /// Protect `atomic_ref`'s current value in `slot`, re-validating
    /// against the source until the announced value is confirmed current.
    ///
    /// Lock-free: the loop only retries if the source genuinely changed
    /// out from under us.
    pub fn protect(&self, slot: usize, atomic_ref: &AtomicPtr<T>) -> *mut T {
        loop {
            let candidate = atomic_ref.load(Ordering::Acquire);
            self.protect_ptr(slot, candidate);
            let confirm = atomic_ref.load(Ordering::Acquire);
            if confirm == candidate {
                return candidate;
            }
        }
    }

    /// Unconditionally announce `p` as hazardous in `slot`.
    ///
    /// Wait-free. The caller vouches that `p` was valid at some point
    /// and that re-validation against a source is unnecessary (e.g. `p`
    /// was just allocated, or was already protected by another slot).
    pub fn protect_ptr(&self, slot: usize, p: *mut T) {
        assert!(slot < self.domain.max_slots, "hazard slot out of range");
        self.domain.rows[self.tid].slots[slot].store(p, Ordering::Release);
    }

    /// Clear a single hazard slot.
    pub fn clear(&self, slot: usize) {
        if slot < self.domain.max_slots {
            self.domain.rows[self.tid].slots[slot].store(ptr::null_mut(), Ordering::Release);
        }
    }

    /// Clear every hazard slot held by this thread.
    pub fn clear_all(&self) {
        for slot in self.domain.rows[self.tid].slots.iter() {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
    }

    /// Retire `ptr`, freeing it once no hazard pointer names it.
    ///
    /// # Safety
    ///
    /// `ptr` must be a unique, valid allocation that will not be accessed
    /// again except through a hazard-protected read that predates this call.
    pub unsafe fn retire(&self, ptr: *mut T) {
        self.retire_with(ptr, None::<fn(*const T) -> bool>);
    }

    /// Retire `ptr`, freeing it once no hazard pointer names it **and**
    /// `still_referenced(ptr)` returns `false`.
    ///
    /// This is the predicate SimQueue needs: a node may still be named by
    /// `EnqState.tail` in the currently installed state even after no
    /// thread holds a hazard pointer to it.
    ///
    /// # Safety
    ///
    /// Same contract as [`retire`](Self::retire).
    pub unsafe fn retire_with<F>(&self, ptr: *mut T, still_referenced: Option<F>)
    where
        F: Fn(*const T) -> bool + Send + 'static,
    {
        let mut list = self.domain.retired[self.tid].lock();
        list.push(Retired {
            ptr,
            still_referenced: still_referenced
                .map(|f| Box::new(f) as Box<dyn Fn(*const T) -> bool + Send>),
        });
        let scan_now = self.domain.scan_threshold == 0 || list.len() >= self.domain.scan_threshold;
        drop(list);
        if scan_now {
            self.scan();
        }
    }

    /// Scan this thread's retire list and free every node that is no
    /// longer hazardous and no longer claimed by `still_referenced`.
    ///
    /// Wait-free bounded: linear in `threads * slots * retired.len()`.
    pub fn scan(&self) {
        let mut list = self.domain.retired[self.tid].lock();
        list.retain(|node| {
            if self.domain.is_hazardous(node.ptr) {
                return true;
            }
            if let Some(pred) = &node.still_referenced {
                if pred(node.ptr as *const T) {
                    return true;
                }
            }
            // SAFETY: not hazardous, not claimed live, retired exactly once.
            unsafe {
                drop(Box::from_raw(node.ptr));
            }
            false
        });
    }
}

impl<'a, T: 'static> Drop for HpThread<'a, T> {
    fn drop(&mut self) {
        self.clear_all();
        self.domain.release(self.tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_clear() {
        let domain: HazardDomain<i32> = HazardDomain::new(4, 2, 0);
        let hp = domain.register();
        hp.clear_all();
    }

    #[test]
    fn test_protect_and_clear() {
        let domain: HazardDomain<i32> = HazardDomain::new(4, 2, 0);
        let hp = domain.register();

        let mut value = 42;
        let atomic = AtomicPtr::new(&mut value as *mut i32);
        let p = hp.protect(0, &atomic);
        assert_eq!(p, &mut value as *mut i32);
        hp.clear(0);
    }

    #[test]
    fn test_retire_without_hazard_frees_immediately() {
        let domain: HazardDomain<i32> = HazardDomain::new(4, 2, 0);
        let hp = domain.register();

        let ptr = Box::into_raw(Box::new(7));
        unsafe { hp.retire(ptr) };
        // R=0 scans immediately; the node had no protecting slot.
    }

    #[test]
    fn test_retire_with_live_hazard_is_kept() {
        let domain: HazardDomain<i32> = HazardDomain::new(4, 2, 0);
        let hp = domain.register();

        let ptr = Box::into_raw(Box::new(7));
        let atomic = AtomicPtr::new(ptr);
        hp.protect(0, &atomic);

        unsafe { hp.retire(ptr) };
        // still protected -> must not have been freed; clear and rescan.
        hp.clear(0);
        hp.scan();
    }

    #[test]
    fn test_retire_with_predicate_blocks_reclamation() {
        let domain: HazardDomain<i32> = HazardDomain::new(4, 2, 0);
        let hp = domain.register();

        let ptr = Box::into_raw(Box::new(7));
        let claimed = std::sync::Arc::new(AtomicBool::new(true));
        let claimed_clone = claimed.clone();

        unsafe {
            hp.retire_with(ptr, Some(move |_: *const i32| claimed_clone.load(Ordering::Acquire)));
        }
        // Still claimed: node must survive the scan.
        hp.scan();

        claimed.store(false, Ordering::Release);
        hp.scan();
    }

    #[test]
    fn test_thread_ids_are_reused_after_drop() {
        let domain: HazardDomain<i32> = HazardDomain::new(2, 1, 0);
        let first_id = {
            let hp = domain.register();
            hp.id()
        };
        let hp2 = domain.register();
        assert_eq!(hp2.id(), first_id);
    }

    #[test]
    #[should_panic(expected = "no free thread slot")]
    fn test_register_exhaustion_panics() {
        let domain: HazardDomain<i32> = HazardDomain::new(1, 1, 0);
        let _hp = domain.register();
        let _hp2 = domain.register();
    }
}
