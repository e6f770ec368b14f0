//! Global version clock.
//!
//! A single monotonic counter shared by every transaction. Every
//! committed transaction's end-timestamp is strictly greater than any
//! transaction that committed before it; the only exception is the
//! quiescence-gated rollover back to zero when the clock approaches
//! [`VERSION_MAX`].

use core::sync::atomic::{AtomicU64, Ordering};
use crossbeam_utils::CachePadded;

/// Highest value the clock may reach before a quiescence barrier resets it.
///
/// Kept well below `u64::MAX` so that lock-word version fields (which
/// share bits with the owned flag, see [`crate::stm::lock_table`]) never
/// overflow even under a burst of commits between the clock crossing the
/// threshold and the rollover barrier completing.
pub const VERSION_MAX: u64 = 1 << 60;

/// The global version clock.
pub struct GlobalClock {
    value: CachePadded<AtomicU64>,
}

impl GlobalClock {
    /// Create a clock starting at zero.
    pub fn new() -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Acquire-load the current clock value.
    #[inline]
    pub fn read(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Atomically increment the clock and return the new value.
    #[inline]
    pub fn bump(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// `true` once the clock has crossed [`VERSION_MAX`] and a quiescence
    /// rollover should be requested before the next commit.
    #[inline]
    pub fn needs_rollover(&self) -> bool {
        self.read() >= VERSION_MAX
    }

    /// Reset the clock to zero. Callers must hold the quiescence barrier
    /// (every other transaction parked) before calling this.
    pub(crate) fn reset(&self) {
        self.value.store(0, Ordering::Release);
    }
}

impl Default for GlobalClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_zero() {
        let clock = GlobalClock::new();
        assert_eq!(clock.read(), 0);
    }

    #[test]
    fn test_bump_is_monotonic() {
        let clock = GlobalClock::new();
        let a = clock.bump();
        let b = clock.bump();
        assert!(b > a);
        assert_eq!(clock.read(), b);
    }

    #[test]
    fn test_reset_returns_to_zero() {
        let clock = GlobalClock::new();
        clock.bump();
        clock.reset();
        assert_eq!(clock.read(), 0);
    }

    #[test]
    fn test_needs_rollover_threshold() {
        let clock = GlobalClock::new();
        assert!(!clock.needs_rollover());
        clock.value.store(VERSION_MAX, Ordering::Relaxed);
        assert!(clock.needs_rollover());
    }
}
