//! Per-transaction state: status, read set, write set.

use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Lifecycle state of a transaction, mirrored in an atomic so a killer
/// thread (clock-overflow quiescence, or an explicit `kill`) can signal
/// a running transaction without taking a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxStatus {
    Inactive = 0,
    Active = 1,
    Committed = 2,
    Aborted = 3,
    Irrevocable = 4,
}

impl TxStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TxStatus::Inactive,
            1 => TxStatus::Active,
            2 => TxStatus::Committed,
            3 => TxStatus::Aborted,
            4 => TxStatus::Irrevocable,
            _ => unreachable!("invalid TxStatus encoding"),
        }
    }
}

/// Atomic wrapper around [`TxStatus`] so another thread can observe or
/// force a transaction's state.
pub struct AtomicTxStatus(AtomicU8);

impl AtomicTxStatus {
    pub fn new(status: TxStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }
    pub fn load(&self) -> TxStatus {
        TxStatus::from_u8(self.0.load(Ordering::Acquire))
    }
    pub fn store(&self, status: TxStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
    /// Move from `Active` to `Aborted`, signalling a concurrently running
    /// transaction that it has been killed. Returns whether the kill
    /// took effect (a transaction that already finished is left alone).
    pub fn kill(&self) -> bool {
        self.0
            .compare_exchange(
                TxStatus::Active as u8,
                TxStatus::Aborted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// An entry in the read set: the address read and the stripe version
/// observed at read time, used to validate the read is still current.
#[derive(Debug, Clone, Copy)]
pub struct ReadEntry {
    pub addr: usize,
    pub version: u64,
}

/// An entry in the write set: the address, its buffered new value, and
/// (for sub-word stores) a byte mask of which bytes are actually written.
#[derive(Debug, Clone, Copy)]
pub struct WriteEntry {
    pub addr: usize,
    pub value: u64,
    pub mask: u64,
}

impl WriteEntry {
    /// Apply this entry's masked bytes onto `base`, leaving the
    /// unmasked bytes of `base` untouched.
    pub fn merge(&self, base: u64) -> u64 {
        (base & !self.mask) | (self.value & self.mask)
    }
}

/// Attributes requested when a transaction starts: read-only transactions
/// skip write-set bookkeeping and lock acquisition entirely.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxAttrs {
    pub read_only: bool,
}

/// Per-transaction running counters, surfaced through `Stm::get_stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxStats {
    pub commits: u64,
    pub aborts: u64,
    pub retries: u64,
}

/// A single thread's transaction state, reused across the thread's
/// successive `start`/`commit`/`abort` cycles.
pub struct TxDescriptor {
    pub status: AtomicTxStatus,
    pub start_version: AtomicU64,
    pub attrs: TxAttrs,
    pub reads: Vec<ReadEntry>,
    pub writes: Vec<WriteEntry>,
    /// Stripes locked by this attempt's `commit`, paired with the version
    /// that was there immediately before the lock, so `release_locks` can
    /// restore it exactly rather than re-deriving it from the read set
    /// (which a write-only `store` never populates).
    pub locked_stripes: Vec<(usize, u64)>,
    /// Transactional `malloc`/`calloc` calls made this attempt, as
    /// `(addr, size)`: undone (freed) on abort, kept on commit.
    pub mallocs: Vec<(usize, usize)>,
    /// Transactional `free` calls made this attempt, as `(addr, size)`:
    /// deferred until commit succeeds, discarded on abort.
    pub frees: Vec<(usize, usize)>,
    pub stats: TxStats,
    pub nesting: u32,
    /// Set while this transaction holds serial irrevocability, i.e. it has
    /// parked every other transaction via the thread registry's exclusive
    /// barrier.
    pub serial_irrevocable: bool,
}

impl TxDescriptor {
    pub fn new(initial_rw_set_size: usize) -> Self {
        Self {
            status: AtomicTxStatus::new(TxStatus::Inactive),
            start_version: AtomicU64::new(0),
            attrs: TxAttrs::default(),
            reads: Vec::with_capacity(initial_rw_set_size),
            writes: Vec::with_capacity(initial_rw_set_size),
            locked_stripes: Vec::with_capacity(initial_rw_set_size),
            mallocs: Vec::new(),
            frees: Vec::new(),
            stats: TxStats::default(),
            nesting: 0,
            serial_irrevocable: false,
        }
    }

    /// Reset read/write sets and locked-stripe bookkeeping for a new attempt.
    /// Preserves accumulated `stats`.
    pub fn reset_for_attempt(&mut self, attrs: TxAttrs, start_version: u64) {
        self.attrs = attrs;
        self.start_version.store(start_version, Ordering::Release);
        self.reads.clear();
        self.writes.clear();
        self.locked_stripes.clear();
        self.mallocs.clear();
        self.frees.clear();
        self.serial_irrevocable = false;
        self.status.store(TxStatus::Active);
    }

    /// Find the most recent buffered write to `addr`, if any (read-your-writes).
    pub fn find_write(&self, addr: usize) -> Option<&WriteEntry> {
        self.writes.iter().rev().find(|w| w.addr == addr)
    }

    pub fn record_read(&mut self, addr: usize, version: u64) {
        self.reads.push(ReadEntry { addr, version });
    }

    pub fn record_write(&mut self, addr: usize, value: u64, mask: u64) {
        if let Some(existing) = self.writes.iter_mut().rev().find(|w| w.addr == addr) {
            existing.value = (existing.value & !mask) | (value & mask);
            existing.mask |= mask;
            return;
        }
        self.writes.push(WriteEntry { addr, value, mask });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        let s = AtomicTxStatus::new(TxStatus::Inactive);
        assert_eq!(s.load(), TxStatus::Inactive);
        s.store(TxStatus::Active);
        assert_eq!(s.load(), TxStatus::Active);
    }

    #[test]
    fn test_kill_only_affects_active() {
        let s = AtomicTxStatus::new(TxStatus::Committed);
        assert!(!s.kill());
        assert_eq!(s.load(), TxStatus::Committed);

        let s2 = AtomicTxStatus::new(TxStatus::Active);
        assert!(s2.kill());
        assert_eq!(s2.load(), TxStatus::Aborted);
    }

    #[test]
    fn test_record_write_merges_masks() {
        let mut tx = TxDescriptor::new(4);
        tx.reset_for_attempt(TxAttrs::default(), 0);
        tx.record_write(0x100, 0x00FF, 0x00FF);
        tx.record_write(0x100, 0xFF00, 0xFF00);
        let w = tx.find_write(0x100).unwrap();
        assert_eq!(w.value, 0xFFFF);
        assert_eq!(w.mask, 0xFFFF);
    }

    #[test]
    fn test_write_entry_merge() {
        let w = WriteEntry {
            addr: 0,
            value: 0x00AB,
            mask: 0x00FF,
        };
        assert_eq!(w.merge(0x1200), 0x12AB);
    }

    #[test]
    fn test_reset_for_attempt_clears_sets_keeps_stats() {
        let mut tx = TxDescriptor::new(4);
        tx.reset_for_attempt(TxAttrs::default(), 0);
        tx.record_write(8, 1, u64::MAX);
        tx.stats.aborts = 3;
        tx.reset_for_attempt(TxAttrs::default(), 5);
        assert!(tx.writes.is_empty());
        assert_eq!(tx.stats.aborts, 3);
        assert_eq!(tx.start_version.load(Ordering::Acquire), 5);
    }
}
