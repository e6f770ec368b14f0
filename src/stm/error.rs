//! Transaction abort reasons and the top-level queue error type.

use thiserror::Error;

/// Why a transaction attempt failed to commit.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Lost a write-write race acquiring a stripe already locked by another writer.
    #[error("write-write conflict")]
    WwConflict,
    /// A stripe this transaction wants to write is locked by a reader-visible writer.
    #[error("read-write conflict")]
    RwConflict,
    /// A stripe this transaction read is now locked by a concurrent writer.
    #[error("write-read conflict")]
    WrConflict,
    /// Two readers disagree on a stripe's version during validation.
    #[error("read-read conflict")]
    RrConflict,
    /// A previously read stripe's version no longer matches the read set.
    #[error("read validation failed")]
    ValRead,
    /// Validating the write set before commit found a stale entry.
    #[error("write validation failed")]
    ValWrite,
    /// General snapshot validation failed (extend-or-abort check).
    #[error("snapshot validation failed")]
    Validate,
    /// Attempting to extend the read snapshot to a newer version failed.
    #[error("failed to extend read snapshot")]
    ExtendWs,
    /// Could not enter irrevocable mode (another thread is already irrevocable).
    #[error("cannot become irrevocable")]
    Irrevocable,
    /// Killed by another thread (e.g. a pending clock-rollover quiescence).
    #[error("transaction was killed")]
    Killed,
    /// Aborted in response to an external signal translated into an abort.
    #[error("aborted on signal")]
    Signal,
    /// The body of the transaction called `abort` explicitly.
    #[error("explicit abort")]
    Explicit,
    /// Exceeded the configured retry budget; give up without reattempting.
    #[error("retry budget exhausted")]
    NoRetry,
}

/// Errors surfaced by the lock-free queue implementations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// A caller-supplied argument (capacity, thread count, slot index) was invalid.
    #[error("invalid argument")]
    InvalidArgument,
    /// The queue has no free capacity (bounded queues only).
    #[error("queue is full")]
    Full,
}
