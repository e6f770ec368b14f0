//! Thread registry and quiescence barrier.
//!
//! Threads join and leave the STM dynamically (`init_thread`/`exit_thread`),
//! unlike a fixed hazard-pointer table. The registry tracks who is
//! currently registered and whether each is mid-transaction, so that a
//! clock-rollover (or any other global operation requiring no concurrent
//! transactions) can request a quiescence point and wait for every
//! registered thread to reach it.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberState {
    /// Registered, not currently inside a transaction.
    Idle,
    /// Registered and inside a transaction.
    InTx,
    /// Parked at a requested quiescence point.
    Quiesced,
}

struct RegistryState {
    members: Vec<MemberState>,
    rollover_requested: bool,
}

/// Tracks registered STM threads and coordinates a stop-the-world
/// quiescence barrier for clock rollover.
pub struct ThreadRegistry {
    state: Mutex<RegistryState>,
    quiesced: Condvar,
    resumed: Condvar,
}

/// A registered thread's slot index into the registry.
pub type MemberId = usize;

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                members: Vec::new(),
                rollover_requested: false,
            }),
            quiesced: Condvar::new(),
            resumed: Condvar::new(),
        }
    }

    /// Register the calling thread, returning its member id.
    pub fn join(&self) -> MemberId {
        let mut state = self.state.lock();
        state.members.push(MemberState::Idle);
        state.members.len() - 1
    }

    /// Remove `id` from the registry. Its slot is left as a tombstone
    /// rather than reused, since `MemberId`s may be cached by callers.
    pub fn leave(&self, id: MemberId) {
        let mut state = self.state.lock();
        if let Some(slot) = state.members.get_mut(id) {
            *slot = MemberState::Idle;
        }
        drop(state);
        // Leaving counts as reaching quiescence for any pending rollover.
        self.quiesced.notify_all();
    }

    /// Mark `id` as having entered a transaction. If an exclusive barrier
    /// (clock rollover or serial irrevocable) is in effect, parks until it
    /// clears before joining as `InTx` — a transaction must not be able to
    /// start mid-barrier and race whatever exclusivity the barrier exists
    /// to provide.
    pub fn enter_tx(&self, id: MemberId) {
        let mut state = self.state.lock();
        self.resumed.wait_while(&mut state, |s| s.rollover_requested);
        if let Some(slot) = state.members.get_mut(id) {
            *slot = MemberState::InTx;
        }
    }

    /// Mark `id` as having left its transaction (commit or abort). If a
    /// rollover is pending, parks at the barrier until it completes.
    pub fn exit_tx(&self, id: MemberId) {
        let mut state = self.state.lock();
        if let Some(slot) = state.members.get_mut(id) {
            *slot = MemberState::Idle;
        }
        if state.rollover_requested {
            state.members[id] = MemberState::Quiesced;
            self.quiesced.notify_all();
            self.resumed.wait_while(&mut state, |s| s.rollover_requested);
        }
    }

    /// Enter the exclusive barrier: block until every registered member
    /// other than `requester` is idle or quiesced, and mark new
    /// transaction starts (`enter_tx`) as parked until [`Self::end_exclusive`].
    /// Used both for clock rollover and for serial irrevocable execution.
    pub fn begin_exclusive(&self, requester: MemberId) {
        let mut state = self.state.lock();
        state.rollover_requested = true;
        self.quiesced.wait_while(&mut state, |s| {
            s.members
                .iter()
                .enumerate()
                .any(|(id, m)| id != requester && *m == MemberState::InTx)
        });
    }

    /// Leave the exclusive barrier, releasing any thread parked in
    /// `enter_tx` or `exit_tx`.
    pub fn end_exclusive(&self) {
        let mut state = self.state.lock();
        state.rollover_requested = false;
        self.resumed.notify_all();
    }

    /// Request a quiescence point: block until every registered member
    /// other than `requester` is idle or quiesced, then run `barrier_fn`
    /// (e.g. the clock reset) and release everyone.
    pub fn quiesce_and<F: FnOnce()>(&self, requester: MemberId, barrier_fn: F) {
        self.begin_exclusive(requester);
        barrier_fn();
        self.end_exclusive();
    }

    /// Number of currently registered members (including tombstoned slots).
    pub fn len(&self) -> usize {
        self.state.lock().members.len()
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_join_leave() {
        let reg = ThreadRegistry::new();
        let id = reg.join();
        assert_eq!(reg.len(), 1);
        reg.leave(id);
    }

    #[test]
    fn test_quiesce_with_no_other_members_runs_immediately() {
        let reg = ThreadRegistry::new();
        let id = reg.join();
        let mut ran = false;
        reg.quiesce_and(id, || ran = true);
        assert!(ran);
    }

    #[test]
    fn test_quiesce_waits_for_in_tx_member() {
        let reg = Arc::new(ThreadRegistry::new());
        let requester = reg.join();
        let other = reg.join();
        reg.enter_tx(other);

        let reg2 = reg.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            reg2.exit_tx(other);
        });

        let mut ran = false;
        reg.quiesce_and(requester, || ran = true);
        assert!(ran);
        worker.join().unwrap();
    }

    #[test]
    fn test_exit_tx_parks_during_rollover() {
        let reg = Arc::new(ThreadRegistry::new());
        let requester = reg.join();
        let other = reg.join();
        reg.enter_tx(other);

        let reg2 = reg.clone();
        let parked = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            reg2.exit_tx(other);
        });

        reg.quiesce_and(requester, || {});
        parked.join().unwrap();
    }
}
