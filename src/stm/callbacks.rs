//! User-installable lifecycle callbacks and aggregate statistics.
//!
//! Mirrors the six hook points a host runtime typically wants from a
//! software transactional memory library: per-thread init/exit, and
//! per-transaction-attempt start/pre-commit/commit/abort.

use std::sync::atomic::{AtomicU64, Ordering};

type ThreadHook = Box<dyn Fn() + Send + Sync>;
type TxHook = Box<dyn Fn() + Send + Sync>;

/// Optional callbacks invoked at STM lifecycle events. Any slot left
/// `None` is simply skipped.
#[derive(Default)]
pub struct Callbacks {
    pub on_thread_init: Option<ThreadHook>,
    pub on_thread_exit: Option<ThreadHook>,
    pub on_start: Option<TxHook>,
    pub on_precommit: Option<TxHook>,
    pub on_commit: Option<TxHook>,
    pub on_abort: Option<TxHook>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire_thread_init(&self) {
        if let Some(f) = &self.on_thread_init {
            f();
        }
    }
    pub fn fire_thread_exit(&self) {
        if let Some(f) = &self.on_thread_exit {
            f();
        }
    }
    pub fn fire_start(&self) {
        if let Some(f) = &self.on_start {
            f();
        }
    }
    pub fn fire_precommit(&self) {
        if let Some(f) = &self.on_precommit {
            f();
        }
    }
    pub fn fire_commit(&self) {
        if let Some(f) = &self.on_commit {
            f();
        }
    }
    pub fn fire_abort(&self) {
        if let Some(f) = &self.on_abort {
            f();
        }
    }
}

/// Process-wide commit/abort/retry counters, aggregated independently of
/// any per-thread [`crate::stm::descriptor::TxStats`].
#[derive(Default)]
pub struct GlobalStats {
    commits: AtomicU64,
    aborts: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time snapshot of [`GlobalStats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub commits: u64,
    pub aborts: u64,
    pub retries: u64,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}
