//! Atomic primitives and memory barriers.
//!
//! This module provides portable atomic operations and memory barriers for
//! concurrent programming. It wraps Rust's `core::sync::atomic` types to
//! provide a CK-compatible API.
//!
//! # Memory Ordering
//!
//! The module provides several fence operations with different ordering guarantees:
//! - [`barrier`]: Compiler barrier only (no hardware fence)
//! - [`fence_acquire`]: Acquire fence
//! - [`fence_release`]: Release fence
//! - [`fence_acqrel`]: Acquire-release fence
//! - [`fence_memory`]: Full memory fence (sequentially consistent)
//!
//! # Thread Safety
//!
//! All operations in this module are atomic and thread-safe by definition.
//! CAS-based operations are lock-free, while load/store operations are wait-free.
//!
//! # Progress Guarantees
//!
//! - **Wait-free**: load, store, fence operations
//! - **Lock-free**: CAS, FAA, FAS, and other read-modify-write operations

use core::sync::atomic::{AtomicU64, Ordering, fence, compiler_fence};

// ============================================================================
// Memory Fences
// ============================================================================

/// Compiler barrier - prevents compiler reordering, no hardware fence.
///
/// This is useful when you need to prevent the compiler from reordering
/// memory operations, but don't need a hardware fence.
#[inline(always)]
pub fn barrier() {
    compiler_fence(Ordering::SeqCst);
}

/// Acquire fence - prevents reordering of reads before this fence.
///
/// Operations before the fence cannot be reordered after it.
#[inline(always)]
pub fn fence_acquire() {
    fence(Ordering::Acquire);
}

/// Release fence - prevents reordering of writes after this fence.
///
/// Operations after the fence cannot be reordered before it.
#[inline(always)]
pub fn fence_release() {
    fence(Ordering::Release);
}

/// Acquire-release fence - combines acquire and release semantics.
#[inline(always)]
pub fn fence_acqrel() {
    fence(Ordering::AcqRel);
}

/// Full memory fence - sequentially consistent ordering.
///
/// This is the strongest memory ordering guarantee.
#[inline(always)]
pub fn fence_memory() {
    fence(Ordering::SeqCst);
}

/// Load fence - prevents load-load reordering.
#[inline(always)]
pub fn fence_load() {
    fence(Ordering::Acquire);
}

/// Store fence - prevents store-store reordering.
#[inline(always)]
pub fn fence_store() {
    fence(Ordering::Release);
}

/// Store-load fence - prevents store-load reordering.
///
/// This is the most expensive fence on x86 (requires mfence).
#[inline(always)]
pub fn fence_store_load() {
    fence(Ordering::SeqCst);
}

/// Load-store fence - prevents load-store reordering.
#[inline(always)]
pub fn fence_load_store() {
    fence(Ordering::AcqRel);
}

/// Fence for atomic operations.
#[inline(always)]
pub fn fence_atomic() {
    fence(Ordering::SeqCst);
}

/// Fence for lock acquisition.
#[inline(always)]
pub fn fence_lock() {
    fence(Ordering::Acquire);
}

/// Fence for lock release.
#[inline(always)]
pub fn fence_unlock() {
    fence(Ordering::Release);
}

/// CPU stall/pause hint for spin loops.
///
/// This reduces power consumption and improves performance in spin-wait loops.
#[inline(always)]
pub fn stall() {
    core::hint::spin_loop();
}

/// A packed `(seq: 48, index: 16)` value treated as a single atomic.
///
/// SimQueue's `enqPtr`/`deqPtr` need a seq-counter-tagged pointer but no
/// double-wide CAS: the sequence (monotonic, ABA-proof) and the pool index
/// both fit in one 64-bit word, so a native [`AtomicU64`] suffices.
pub mod seq_index {
    use super::*;

    const INDEX_BITS: u32 = 16;
    const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

    /// Pack a 48-bit sequence and 16-bit index into one word.
    #[inline]
    pub const fn pack(seq: u64, index: u16) -> u64 {
        (seq << INDEX_BITS) | (index as u64 & INDEX_MASK)
    }

    /// Unpack a word into `(seq, index)`.
    #[inline]
    pub const fn unpack(word: u64) -> (u64, u16) {
        (word >> INDEX_BITS, (word & INDEX_MASK) as u16)
    }

    /// Load the current `(seq, index)` pair with acquire ordering.
    #[inline]
    pub fn load(target: &AtomicU64) -> (u64, u16) {
        unpack(target.load(Ordering::Acquire))
    }

    /// Compare-and-swap on the packed word. `compare`/`set` are `(seq, index)` pairs.
    #[inline]
    pub fn cas(target: &AtomicU64, compare: (u64, u16), set: (u64, u16)) -> bool {
        target
            .compare_exchange(
                pack(compare.0, compare.1),
                pack(set.0, set.1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
