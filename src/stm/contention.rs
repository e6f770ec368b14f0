//! Contention management policies.
//!
//! When a transaction cannot acquire a stripe (or loses a validation
//! race against a concurrent committer) it consults a contention
//! manager to decide whether to retry immediately, back off, or abort
//! the other side. The policy is selected per-[`crate::stm::Stm`] via
//! [`crate::stm::config::Config::cm_policy`].

use crate::backoff::Backoff;

/// What a contention manager decides to do about a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Abort our own transaction and retry from scratch.
    AbortSelf,
    /// Pause, then retry the same operation.
    Retry,
    /// Mark the conflicting owner as killed instead of backing off; used
    /// by priority-style policies once a transaction has invested enough
    /// retries that the other side should yield instead.
    KillOther,
}

/// A contention management policy.
pub trait ContentionManager: Send {
    /// Called when this transaction fails to acquire a stripe already
    /// held by another transaction. `retries` counts prior calls within
    /// the same transaction attempt.
    fn on_conflict(&mut self, retries: u32) -> Decision;

    /// Reset any per-transaction state (backoff counters, priority) at
    /// the start of a fresh attempt.
    fn reset(&mut self);
}

/// Always abort immediately and retry from scratch. Simplest policy,
/// livelock-prone under heavy contention but has no tuning parameters.
#[derive(Debug, Default)]
pub struct Suicide;

impl ContentionManager for Suicide {
    fn on_conflict(&mut self, _retries: u32) -> Decision {
        Decision::AbortSelf
    }
    fn reset(&mut self) {}
}

/// Spin briefly on the conflicting stripe before aborting, giving the
/// current owner a chance to finish instead of racing it every cycle.
pub struct Delay {
    backoff: Backoff,
}

impl Default for Delay {
    fn default() -> Self {
        Self {
            backoff: Backoff::new(),
        }
    }
}

impl ContentionManager for Delay {
    fn on_conflict(&mut self, _retries: u32) -> Decision {
        self.backoff.snooze();
        Decision::AbortSelf
    }
    fn reset(&mut self) {
        self.backoff.reset();
    }
}

/// Exponential backoff with per-transaction jitter before aborting.
/// Fans concurrent retriers out in time instead of lock-stepping them.
pub struct ExponentialBackoff {
    backoff: Backoff,
    rng: fastrand::Rng,
}

impl ExponentialBackoff {
    pub fn new(seed: u64) -> Self {
        Self {
            backoff: Backoff::new(),
            rng: fastrand::Rng::with_seed(seed),
        }
    }
}

impl ContentionManager for ExponentialBackoff {
    fn on_conflict(&mut self, _retries: u32) -> Decision {
        self.backoff.spin_jittered(&mut self.rng);
        Decision::AbortSelf
    }
    fn reset(&mut self) {
        self.backoff.reset();
    }
}

/// Priority-style policy: retry a bounded number of times, then kill the
/// conflicting owner instead of conceding, on the theory that a
/// transaction which has already invested work should not always yield
/// to a fresher one. This requires the owner expose a killable status
/// ([`crate::stm::descriptor::AtomicTxStatus::kill`]); the caller is
/// responsible for actually invoking it on `KillOther`.
pub struct Modular {
    backoff: Backoff,
    rng: fastrand::Rng,
    retry_threshold: u32,
}

impl Modular {
    pub fn new(seed: u64, retry_threshold: u32) -> Self {
        Self {
            backoff: Backoff::new(),
            rng: fastrand::Rng::with_seed(seed),
            retry_threshold,
        }
    }
}

impl ContentionManager for Modular {
    fn on_conflict(&mut self, retries: u32) -> Decision {
        if retries < self.retry_threshold {
            self.backoff.spin_jittered(&mut self.rng);
            Decision::Retry
        } else {
            Decision::KillOther
        }
    }
    fn reset(&mut self) {
        self.backoff.reset();
    }
}

/// Named selector for [`Config::cm_policy`](crate::stm::config::Config),
/// resolved into a boxed [`ContentionManager`] at thread-init time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmPolicy {
    Suicide,
    Delay,
    Backoff,
    Modular,
}

impl CmPolicy {
    pub fn build(self, seed: u64) -> Box<dyn ContentionManager> {
        match self {
            CmPolicy::Suicide => Box::new(Suicide),
            CmPolicy::Delay => Box::new(Delay::default()),
            CmPolicy::Backoff => Box::new(ExponentialBackoff::new(seed)),
            CmPolicy::Modular => Box::new(Modular::new(seed, 8)),
        }
    }
}
