//! Memory allocator abstraction.
//!
//! This module defines the [`Allocator`] trait which allows CK data structures
//! to use custom memory allocators. This enables integration with application-specific
//! memory management strategies, memory pools, or specialized allocators for
//! NUMA-aware allocation.
//!
//! # Design
//!
//! The allocator interface differs from the standard library's `Allocator` trait
//! in several ways:
//!
//! - **Sized deletes**: The `free` method receives the size of the allocation,
//!   enabling allocators that benefit from sized delete operations.
//!
//! - **In-place reallocation**: The `realloc` method has a `may_move` parameter
//!   that, when false, requires the allocator to resize in place or fail.
//!   This is essential for some concurrent algorithms.
//!
//! - **Deferred deallocation**: The `free` method has a `defer` parameter
//!   that allows batching deallocations for performance.
//!
//! # Example
//!
//! ```
//! use ck_core::malloc::{Allocator, GlobalAllocator};
//!
//! // Use the global allocator
//! let alloc = GlobalAllocator;
//!
//! // Allocate memory
//! let ptr = alloc.malloc(1024).expect("allocation failed");
//!
//! // Use the memory...
//!
//! // Free with size hint
//! unsafe { alloc.free(ptr, 1024, false); }
//! ```

use core::ptr::NonNull;
use std::alloc::{alloc, dealloc, realloc as std_realloc, Layout};

/// A memory allocator for CK data structures.
///
/// This trait defines the interface that custom allocators must implement
/// to be used with CK's concurrent data structures.
///
/// # Safety
///
/// Implementations must ensure that:
/// - `malloc` returns properly aligned memory for any type
/// - `realloc` preserves data up to `min(old_size, new_size)`
/// - `free` only deallocates memory previously allocated by this allocator
/// - All operations are thread-safe if used with concurrent data structures
pub trait Allocator {
    /// Allocate a new memory block.
    ///
    /// # Arguments
    ///
    /// * `size` - The number of bytes to allocate
    ///
    /// # Returns
    ///
    /// - `Some(ptr)` - A non-null pointer to at least `size` bytes of memory
    /// - `None` - If allocation fails
    ///
    /// # Notes
    ///
    /// The returned memory is not guaranteed to be initialized.
    fn malloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Resize an existing memory block.
    ///
    /// # Arguments
    ///
    /// * `ptr` - Pointer to the existing allocation
    /// * `old_size` - The current size of the allocation
    /// * `new_size` - The desired new size
    /// * `may_move` - If true, the allocation may be relocated. If false,
    ///   the allocator must resize in place or return `None`.
    ///
    /// # Returns
    ///
    /// - `Some(ptr)` - Pointer to the (possibly relocated) allocation
    /// - `None` - If reallocation fails (original allocation remains valid)
    ///
    /// # Safety
    ///
    /// - `ptr` must have been allocated by this allocator
    /// - `old_size` must match the size of the original allocation
    ///
    /// # Notes
    ///
    /// Data is preserved up to `min(old_size, new_size)` bytes.
    fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        may_move: bool,
    ) -> Option<NonNull<u8>>;

    /// Deallocate a memory block.
    ///
    /// # Arguments
    ///
    /// * `ptr` - Pointer to the allocation to free
    /// * `size` - The size of the allocation
    /// * `defer` - If true, deallocation may be batched for performance.
    ///   If false, memory is freed immediately.
    ///
    /// # Safety
    ///
    /// - `ptr` must have been allocated by this allocator
    /// - `size` must match the size of the original allocation
    /// - `ptr` must not be used after this call
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, defer: bool);

    /// Allocate `size` zero-initialized bytes.
    ///
    /// Default implementation calls [`malloc`](Allocator::malloc) and
    /// zeroes the result; an allocator backed by `mmap`/`calloc` can
    /// override this to skip the redundant zero-fill.
    fn calloc(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.malloc(size)?;
        if size > 0 {
            // SAFETY: malloc guarantees `size` writable bytes at `ptr`.
            unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, size) };
        }
        Some(ptr)
    }
}

/// A wrapper around the global allocator.
///
/// This provides an [`Allocator`] implementation that uses Rust's global
/// allocator (typically the system allocator).
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalAllocator;

impl Allocator for GlobalAllocator {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            // Return a dangling but aligned pointer for zero-size allocations
            return NonNull::new(core::mem::align_of::<usize>() as *mut u8);
        }

        // Use maximum alignment to be safe for any type
        let layout = Layout::from_size_align(size, core::mem::align_of::<usize>())
            .ok()?;

        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc(layout) };
        NonNull::new(ptr)
    }

    fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        may_move: bool,
    ) -> Option<NonNull<u8>> {
        if old_size == 0 {
            return self.malloc(new_size);
        }
        if new_size == 0 {
            // SAFETY: ptr was allocated by us with old_size
            unsafe { self.free(ptr, old_size, false) };
            return NonNull::new(core::mem::align_of::<usize>() as *mut u8);
        }

        let old_layout = Layout::from_size_align(old_size, core::mem::align_of::<usize>())
            .ok()?;

        if !may_move {
            // Standard realloc doesn't guarantee in-place resize
            // For now, we can only succeed if new_size <= old_size
            if new_size <= old_size {
                // In-place shrink is always possible
                return Some(ptr);
            }
            // Cannot grow in place
            return None;
        }

        // SAFETY: ptr was allocated with old_layout, new_size is non-zero
        let new_ptr = unsafe { std_realloc(ptr.as_ptr(), old_layout, new_size) };
        NonNull::new(new_ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, _defer: bool) {
        if size == 0 {
            return; // Nothing to free for zero-size allocations
        }

        let layout = match Layout::from_size_align(size, core::mem::align_of::<usize>()) {
            Ok(l) => l,
            Err(_) => return, // Invalid layout, nothing we can do
        };

        // SAFETY: caller guarantees ptr was allocated with size
        dealloc(ptr.as_ptr(), layout);
    }
}
