//! Property-based tests for the packed-word encodings the STM and queues
//! rely on. These are the round-trip invariants narrow enough to state as
//! a property ("any seq/index pair survives pack/unpack") rather than a
//! fixed example.

use proptest::prelude::*;

use ck_core::pr::seq_index;
use ck_core::stm::LockTable;

proptest! {
    /// Packing and unpacking a `(seq, index)` pair must be lossless for
    /// every index and for every sequence that fits the 48-bit field.
    #[test]
    fn seq_index_pack_unpack_roundtrip(seq in 0u64..(1u64 << 48), index: u16) {
        let word = seq_index::pack(seq, index);
        let (got_seq, got_index) = seq_index::unpack(word);
        prop_assert_eq!(got_seq, seq);
        prop_assert_eq!(got_index, index);
    }

    /// A stripe that was just unlocked at `version` reports exactly that
    /// version back, for any version and any table size.
    #[test]
    fn lock_table_unlock_then_load_roundtrip(
        log2_size in 0u32..8,
        raw_idx in any::<usize>(),
        version in 0u64..(1u64 << 62),
    ) {
        let table = LockTable::new(log2_size);
        let idx = raw_idx & ((1usize << log2_size) - 1);
        table.unlock(idx, version);
        match table.load(idx) {
            ck_core::stm::LockState::Unlocked { version: v } => prop_assert_eq!(v, version),
            other => prop_assert!(false, "expected Unlocked, got {:?}", other),
        }
    }

    /// A successful `try_lock` always reports the version that was there
    /// before, and the stripe is owned by the caller until it unlocks.
    #[test]
    fn lock_table_try_lock_reports_prior_version(
        log2_size in 0u32..8,
        raw_idx in any::<usize>(),
        version in 0u64..(1u64 << 62),
        owner in (0usize..1_000_000).prop_map(|n| n * 2),
    ) {
        let table = LockTable::new(log2_size);
        let idx = raw_idx & ((1usize << log2_size) - 1);
        table.unlock(idx, version);

        let prior = table.try_lock(idx, version, owner).unwrap();
        prop_assert_eq!(prior, version);
        prop_assert!(table.is_owned_by(idx, owner));

        table.unlock(idx, version + 1);
        prop_assert!(!table.is_owned_by(idx, owner));
    }
}
