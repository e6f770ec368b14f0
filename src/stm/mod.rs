//! Word-based software transactional memory.
//!
//! A TL2-style runtime: a global version clock, a striped lock table
//! mapping memory words to lock entries, and per-thread transaction
//! descriptors holding buffered reads and writes. Transactions commit
//! with encounter-time locking and write-back (the only `Design`
//! variant this runtime executes; see [`config::Design`]).
//!
//! There is no `sigsetjmp`/`siglongjmp` retry mechanism here — Rust has
//! no equivalent, and wrapping one in `unsafe` would buy nothing a
//! closure-based retry loop doesn't already give us. [`Stm::atomically`]
//! is the atomic-block primitive: it runs the closure, and if the
//! closure signals a restart (by returning `Err(AbortReason)`) the
//! runtime resets the descriptor and calls the closure again.

pub mod callbacks;
pub mod clock;
pub mod config;
pub mod contention;
pub mod descriptor;
pub mod error;
pub mod lock_table;
pub mod registry;

use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::malloc::{Allocator, GlobalAllocator};

pub use callbacks::{Callbacks, GlobalStats, StatsSnapshot};
pub use clock::GlobalClock;
pub use config::{Config, Design};
pub use contention::{CmPolicy, ContentionManager, Decision};
pub use descriptor::{TxAttrs, TxDescriptor, TxStats, TxStatus};
pub use error::AbortReason;
pub use lock_table::{LockState, LockTable};
pub use registry::{MemberId, ThreadRegistry};

const LOCK_TABLE_LOG2_SIZE: u32 = 20;

/// Default lock-table-stripe hash used to map a raw memory address
/// (`&AtomicU64 as *const _ as usize`) to a [`LockTable`] index.
fn addr_of(cell: &AtomicU64) -> usize {
    cell as *const AtomicU64 as usize
}

/// Force the transaction that owns a locked stripe into `Aborted`,
/// implementing the contention manager's `KillOther` decision.
///
/// # Safety
///
/// `owner` must be a `LockState::Locked { owner }` value, which is always
/// `&TxDescriptor as *const _ as usize` for a descriptor that is still
/// mid-commit (a stripe cannot still read `Locked` once its owning thread
/// has finished `commit`/`abort`, and a thread's `TxDescriptor` lives in
/// thread-local storage for its whole registered lifetime, so the pointer
/// is always valid while the lock is held).
fn kill_owner(owner: usize) {
    let descriptor = owner as *const TxDescriptor;
    unsafe { (*descriptor).status.kill() };
}

struct Irrevocable {
    holder: AtomicBool,
}

impl Irrevocable {
    fn new() -> Self {
        Self {
            holder: AtomicBool::new(false),
        }
    }
    fn try_acquire(&self) -> bool {
        self.holder
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
    fn release(&self) {
        self.holder.store(false, Ordering::Release);
    }
}

/// A word-based STM runtime instance. Cheap to clone (an `Arc` inside);
/// share one across every participating thread.
#[derive(Clone)]
pub struct Stm {
    inner: Arc<StmInner>,
}

struct StmInner {
    clock: GlobalClock,
    locks: LockTable,
    registry: ThreadRegistry,
    irrevocable: Irrevocable,
    config: Config,
    callbacks: Callbacks,
    stats: GlobalStats,
    allocator: GlobalAllocator,
}

thread_local! {
    static THREAD_STATE: RefCell<Option<ThreadState>> = const { RefCell::new(None) };
}

struct ThreadState {
    member: MemberId,
    tx: TxDescriptor,
    cm: Box<dyn ContentionManager>,
    cm_retries: u32,
}

impl Stm {
    /// Construct a new runtime with default configuration. Mirrors the
    /// source library's process-wide `TM_INIT` entry point, minus any
    /// global/static state: callers own the returned handle and clone
    /// it into each participating thread.
    pub fn init() -> Self {
        Self::with_config(Config::from_env())
    }

    pub fn with_config(config: Config) -> Self {
        debug!("stm: init with cm_policy={:?} design={:?}", config.cm_policy, config.design);
        Self {
            inner: Arc::new(StmInner {
                clock: GlobalClock::new(),
                locks: LockTable::new(LOCK_TABLE_LOG2_SIZE),
                registry: ThreadRegistry::new(),
                irrevocable: Irrevocable::new(),
                config,
                callbacks: Callbacks::new(),
                stats: GlobalStats::new(),
                allocator: GlobalAllocator,
            }),
        }
    }

    /// Register the calling thread. Must be called once before any
    /// transaction runs on this thread; panics if already registered.
    pub fn init_thread(&self) {
        THREAD_STATE.with(|cell| {
            let mut slot = cell.borrow_mut();
            assert!(slot.is_none(), "stm: thread already registered");
            let member = self.inner.registry.join();
            let cm = self.inner.config.cm_policy.build(member as u64 ^ 0x9E37_79B9);
            *slot = Some(ThreadState {
                member,
                tx: TxDescriptor::new(self.inner.config.initial_rw_set_size),
                cm,
                cm_retries: 0,
            });
        });
        self.inner.callbacks.fire_thread_init();
        trace!("stm: thread registered");
    }

    /// Deregister the calling thread.
    pub fn exit_thread(&self) {
        self.inner.callbacks.fire_thread_exit();
        THREAD_STATE.with(|cell| {
            if let Some(state) = cell.borrow_mut().take() {
                self.inner.registry.leave(state.member);
            }
        });
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ThreadState) -> R) -> R {
        THREAD_STATE.with(|cell| {
            let mut slot = cell.borrow_mut();
            let state = slot
                .as_mut()
                .expect("stm: thread not registered (call init_thread first)");
            f(state)
        })
    }

    /// Run `body` to completion inside a transaction, retrying on abort
    /// until it commits. `body` returns `Ok(R)` to request a commit or
    /// `Err(AbortReason::Explicit)` to voluntarily abort and retry.
    pub fn atomically<R>(&self, attrs: TxAttrs, mut body: impl FnMut(&Stm) -> Result<R, AbortReason>) -> R {
        loop {
            self.start(attrs);
            match body(self) {
                Ok(value) => {
                    if self.commit() {
                        return value;
                    }
                    // Commit validation failed after the body ran; retry.
                }
                Err(_reason) => {
                    self.abort();
                }
            }
            self.with_state(|s| {
                s.tx.stats.retries += 1;
            });
            if self.inner.config.statistics {
                self.inner.stats.record_retry();
            }
        }
    }

    /// Begin a new transaction attempt on the calling thread.
    pub fn start(&self, attrs: TxAttrs) {
        self.maybe_roll_clock();
        let start_version = self.inner.clock.read();
        self.with_state(|s| {
            s.tx.reset_for_attempt(attrs, start_version);
            s.cm.reset();
            s.cm_retries = 0;
        });
        let member = self.with_state(|s| s.member);
        self.inner.registry.enter_tx(member);
        self.inner.callbacks.fire_start();
    }

    fn maybe_roll_clock(&self) {
        if !self.inner.clock.needs_rollover() {
            return;
        }
        let member = self.with_state(|s| s.member);
        warn!("stm: global clock approaching overflow, requesting quiescence rollover");
        self.inner.registry.quiesce_and(member, || {
            self.inner.clock.reset();
        });
    }

    /// Read a transactional word at `addr`.
    pub fn load(&self, addr: &AtomicU64) -> Result<u64, AbortReason> {
        let key = addr_of(addr);
        self.with_state(|s| {
            if s.tx.status.load() == TxStatus::Aborted {
                return Err(AbortReason::Killed);
            }
            if let Some(w) = s.tx.find_write(key) {
                return Ok(w.merge(addr.load(Ordering::Relaxed)));
            }
            let idx = self.inner.locks.index_of(key);
            loop {
                let before = self.inner.locks.load(idx);
                if let LockState::Locked { owner } = before {
                    match s.cm.on_conflict(s.cm_retries) {
                        Decision::AbortSelf => return Err(AbortReason::WrConflict),
                        Decision::Retry => {
                            s.cm_retries += 1;
                            continue;
                        }
                        Decision::KillOther => {
                            kill_owner(owner);
                            s.cm_retries += 1;
                            continue;
                        }
                    }
                }
                let value = addr.load(Ordering::Acquire);
                let after = self.inner.locks.load(idx);
                match (before, after) {
                    (LockState::Unlocked { version: v1 }, LockState::Unlocked { version: v2 })
                        if v1 == v2 =>
                    {
                        if v1 > s.tx.start_version.load(Ordering::Acquire) {
                            if !Self::extend(&self.inner.locks, &mut s.tx) {
                                return Err(AbortReason::ExtendWs);
                            }
                        }
                        s.tx.record_read(key, v1);
                        return Ok(value);
                    }
                    _ => continue,
                }
            }
        })
    }

    /// Attempt to bump the transaction's snapshot (`start_version`) forward
    /// to the current global clock, re-validating every already-read
    /// stripe against the new snapshot. Succeeds only if every prior read
    /// is still current; on success the transaction may keep running
    /// without aborting on a stale-but-harmless read.
    fn extend(locks: &LockTable, tx: &mut TxDescriptor) -> bool {
        for read in &tx.reads {
            let idx = locks.index_of(read.addr);
            match locks.load(idx) {
                LockState::Unlocked { version } if version == read.version => {}
                _ => return false,
            }
        }
        true
    }

    /// Buffer a transactional write to `addr`. Not visible to other
    /// transactions (or even a plain non-transactional read) until commit.
    /// Fails with `ValWrite` if `addr` was already read by this
    /// transaction and has since been committed at a newer version by
    /// someone else — detected eagerly here rather than left for commit
    /// validation to catch.
    pub fn store(&self, addr: &AtomicU64, value: u64) -> Result<(), AbortReason> {
        self.store_masked(addr, value, u64::MAX)
    }

    /// Buffer a write of only the bytes selected by `mask`.
    pub fn store_masked(&self, addr: &AtomicU64, value: u64, mask: u64) -> Result<(), AbortReason> {
        let key = addr_of(addr);
        self.with_state(|s| {
            if let Some(read) = s.tx.reads.iter().find(|r| r.addr == key) {
                let idx = self.inner.locks.index_of(key);
                let self_id = &s.tx as *const TxDescriptor as usize;
                match self.inner.locks.load(idx) {
                    LockState::Unlocked { version } if version == read.version => {}
                    LockState::Locked { owner } if owner == self_id => {}
                    _ => return Err(AbortReason::ValWrite),
                }
            }
            s.tx.record_write(key, value, mask);
            Ok(())
        })
    }

    /// Allocate `size` bytes, undone automatically if this attempt aborts.
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.inner.allocator.malloc(size)?;
        self.with_state(|s| s.tx.mallocs.push((ptr.as_ptr() as usize, size)));
        Some(ptr)
    }

    /// Allocate `size` zero-initialized bytes, undone automatically if this
    /// attempt aborts.
    pub fn calloc(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.inner.allocator.calloc(size)?;
        self.with_state(|s| s.tx.mallocs.push((ptr.as_ptr() as usize, size)));
        Some(ptr)
    }

    /// Buffer a transactional free of an allocation of `size` bytes at
    /// `ptr`. The underlying deallocation does not happen until this
    /// attempt actually commits; on abort the buffered free is simply
    /// discarded, leaving `ptr` untouched.
    pub fn free(&self, ptr: NonNull<u8>, size: usize) {
        self.with_state(|s| s.tx.frees.push((ptr.as_ptr() as usize, size)));
    }

    /// Attempt to commit the active transaction. Returns `true` on
    /// success; on failure the descriptor's locks (if any were already
    /// taken) are released and the caller should retry via `start`.
    pub fn commit(&self) -> bool {
        self.inner.callbacks.fire_precommit();

        let outcome = self.with_state(|s| {
            if s.tx.status.load() == TxStatus::Aborted {
                return Err(AbortReason::Killed);
            }
            if s.tx.writes.is_empty() {
                for read in &s.tx.reads {
                    let idx = self.inner.locks.index_of(read.addr);
                    match self.inner.locks.load(idx) {
                        LockState::Unlocked { version } if version == read.version => {}
                        _ => return Err(AbortReason::ValRead),
                    }
                }
                return Ok(());
            }

            // Acquire every write-set stripe, encounter-time ordering by
            // address to avoid deadlocking against a transaction
            // committing the same pair of stripes in the opposite order.
            let mut addrs: Vec<usize> = s.tx.writes.iter().map(|w| w.addr).collect();
            addrs.sort_unstable();
            addrs.dedup();

            let self_id = &s.tx as *const TxDescriptor as usize;
            for addr in &addrs {
                let idx = self.inner.locks.index_of(*addr);
                loop {
                    let current_version = match self.inner.locks.load(idx) {
                        LockState::Unlocked { version } => version,
                        LockState::Locked { owner } => {
                            match s.cm.on_conflict(s.cm_retries) {
                                Decision::AbortSelf => return Err(AbortReason::WwConflict),
                                Decision::Retry => {
                                    s.cm_retries += 1;
                                    continue;
                                }
                                Decision::KillOther => {
                                    kill_owner(owner);
                                    s.cm_retries += 1;
                                    continue;
                                }
                            }
                        }
                    };
                    match self.inner.locks.try_lock(idx, current_version, self_id) {
                        Ok(_) => {
                            s.tx.locked_stripes.push((idx, current_version));
                            break;
                        }
                        Err(_) => continue,
                    }
                }
            }

            // Validate the read set against the now-frozen world: every
            // read stripe must still be at its recorded version (or, if
            // we ourselves just locked it for writing, that's fine).
            for read in &s.tx.reads {
                let idx = self.inner.locks.index_of(read.addr);
                match self.inner.locks.load(idx) {
                    LockState::Unlocked { version } if version == read.version => {}
                    LockState::Locked { owner } if owner == self_id => {}
                    _ => return Err(AbortReason::Validate),
                }
            }

            Ok(())
        });

        let was_irrevocable = self.with_state(|s| s.tx.status.load() == TxStatus::Irrevocable);

        match outcome {
            Ok(()) => {
                let has_writes = self.with_state(|s| !s.tx.writes.is_empty());
                let commit_version = if has_writes {
                    self.inner.clock.bump()
                } else {
                    self.inner.clock.read()
                };
                self.with_state(|s| {
                    for write in &s.tx.writes {
                        let target = unsafe { &*(write.addr as *const AtomicU64) };
                        let merged = write.merge(target.load(Ordering::Relaxed));
                        target.store(merged, Ordering::Relaxed);
                    }
                    for &(idx, _) in &s.tx.locked_stripes {
                        self.inner.locks.unlock(idx, commit_version);
                    }
                    for &(addr, size) in &s.tx.frees {
                        // SAFETY: `addr` was passed to `Stm::free` by the
                        // caller, who attests it was allocated by this same
                        // allocator with this same size and is not reused
                        // after the call.
                        let ptr = NonNull::new(addr as *mut u8).expect("freed pointer is never null");
                        unsafe { self.inner.allocator.free(ptr, size, false) };
                    }
                    s.tx.mallocs.clear();
                    s.tx.frees.clear();
                    s.tx.status.store(TxStatus::Committed);
                    s.tx.stats.commits += 1;
                });
                let member = self.with_state(|s| s.member);
                self.inner.registry.exit_tx(member);
                self.inner.callbacks.fire_commit();
                if self.inner.config.statistics {
                    self.inner.stats.record_commit();
                }
                self.release_irrevocable_if_held(was_irrevocable);
                true
            }
            Err(reason) => {
                self.release_locks();
                self.undo_mallocs();
                self.with_state(|s| {
                    s.tx.status.store(TxStatus::Aborted);
                    s.tx.stats.aborts += 1;
                });
                let member = self.with_state(|s| s.member);
                self.inner.registry.exit_tx(member);
                self.inner.callbacks.fire_abort();
                if self.inner.config.statistics {
                    self.inner.stats.record_abort();
                }
                self.release_irrevocable_if_held(was_irrevocable);
                trace!("stm: commit failed: {reason}");
                false
            }
        }
    }

    /// Free every allocation this attempt made, undoing them; buffered
    /// `free` calls are simply discarded (the free never happened).
    fn undo_mallocs(&self) {
        self.with_state(|s| {
            for &(addr, size) in &s.tx.mallocs {
                // SAFETY: `addr` was returned by `Stm::malloc`/`calloc` for
                // this same attempt and has not been handed to a committed
                // `Stm::free`, since this attempt is aborting.
                let ptr = NonNull::new(addr as *mut u8).expect("allocated pointer is never null");
                unsafe { self.inner.allocator.free(ptr, size, false) };
            }
            s.tx.mallocs.clear();
            s.tx.frees.clear();
        });
    }

    fn release_locks(&self) {
        self.with_state(|s| {
            for &(idx, version) in &s.tx.locked_stripes {
                // `version` is the version captured at the moment this
                // stripe was locked, so it is restored exactly regardless
                // of whether the stripe was ever also read (a write-only
                // `store` never populates the read set to recover it from).
                self.inner.locks.unlock(idx, version);
            }
            s.tx.locked_stripes.clear();
        });
    }

    /// Abort the active transaction explicitly; `atomically` will retry it.
    pub fn abort(&self) {
        let was_irrevocable = self.with_state(|s| s.tx.status.load() == TxStatus::Irrevocable);
        self.release_locks();
        self.undo_mallocs();
        self.with_state(|s| {
            s.tx.status.store(TxStatus::Aborted);
            s.tx.stats.aborts += 1;
        });
        let member = self.with_state(|s| s.member);
        self.inner.registry.exit_tx(member);
        self.inner.callbacks.fire_abort();
        if self.inner.config.statistics {
            self.inner.stats.record_abort();
        }
        self.release_irrevocable_if_held(was_irrevocable);
    }

    /// `true` if the calling thread's transaction is currently active.
    pub fn active(&self) -> bool {
        self.with_state(|s| s.tx.status.load() == TxStatus::Active)
    }

    pub fn aborted(&self) -> bool {
        self.with_state(|s| s.tx.status.load() == TxStatus::Aborted)
    }

    /// `true` if the active transaction was aborted. Named separately
    /// from [`Stm::aborted`] for API parity with implementations that
    /// distinguish a self-initiated abort from an external kill; this
    /// runtime always aborts through the same retry path, so the two
    /// are equivalent here.
    pub fn killed(&self) -> bool {
        self.aborted()
    }

    /// Enter irrevocable mode: at most one thread may hold it at a time,
    /// and while held no other thread may commit. Used to run
    /// non-transactional side effects (I/O) safely inside an atomic block.
    ///
    /// When `serial` is set, additionally drives the thread registry's
    /// exclusive barrier so no other transaction may even be *running*
    /// while this one holds irrevocability, not merely excluded from
    /// committing.
    pub fn set_irrevocable(&self, serial: bool) -> Result<(), AbortReason> {
        if !self.inner.irrevocable.try_acquire() {
            return Err(AbortReason::Irrevocable);
        }
        self.with_state(|s| s.tx.status.store(TxStatus::Irrevocable));
        if serial {
            let member = self.with_state(|s| s.member);
            self.inner.registry.begin_exclusive(member);
            self.with_state(|s| s.tx.serial_irrevocable = true);
        }
        Ok(())
    }

    pub fn irrevocable(&self) -> bool {
        self.with_state(|s| s.tx.status.load() == TxStatus::Irrevocable)
    }

    /// Release the irrevocable flag and, if held, the serial-irrevocable
    /// exclusive barrier. `was_irrevocable` must be captured *before* the
    /// caller overwrites `tx.status` with the attempt's final outcome.
    fn release_irrevocable_if_held(&self, was_irrevocable: bool) {
        if was_irrevocable {
            self.inner.irrevocable.release();
        }
        let was_serial = self.with_state(|s| std::mem::take(&mut s.tx.serial_irrevocable));
        if was_serial {
            self.inner.registry.end_exclusive();
        }
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn get_parameter_vr_threshold(&self) -> u32 {
        self.inner.config.vr_threshold
    }
}
