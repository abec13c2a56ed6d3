//! Property-based tests for blkrepl-storage using proptest.
//!
//! These check the bitmap weight bookkeeping against a plain recount under
//! arbitrary sequences of range operations, resizes and peer merges.

use blkrepl_storage::{BitVector, MemStore, ResyncBitmap, BM_SECT_PER_BIT};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Set(u64, u64),
    Clear(u64, u64),
    Merge(usize, u64),
    SetAll,
    ClearAll,
}

fn any_op(bits: u64) -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..bits + 10, 0..bits + 10).prop_map(|(a, b)| Op::Set(a.min(b), a.max(b))),
        (0..bits + 10, 0..bits + 10).prop_map(|(a, b)| Op::Clear(a.min(b), a.max(b))),
        (0usize..4, any::<u64>()).prop_map(|(w, v)| Op::Merge(w, v)),
        Just(Op::SetAll),
        Just(Op::ClearAll),
    ]
}

fn recount(bm: &ResyncBitmap) -> u64 {
    (0..bm.bits()).filter(|b| bm.test_bit(*b) == Some(true)).count() as u64
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().build().unwrap()
}

proptest! {
    /// The cached weight always equals the number of set bits.
    #[test]
    fn test_weight_matches_recount(
        bits in 200u64..300,
        ops in proptest::collection::vec(any_op(300), 1..40),
    ) {
        let bm = ResyncBitmap::new();
        runtime().block_on(async {
            bm.lock("prop").await.resize(bits * BM_SECT_PER_BIT).unwrap();
        });
        for op in ops {
            match op {
                Op::Set(s, e) => { bm.set_bits(s, e); }
                Op::Clear(s, e) => { bm.clear_bits(s, e); }
                Op::Merge(w, v) => { bm.merge_from_peer(w, &[v]).unwrap(); }
                Op::SetAll => bm.set_all(),
                Op::ClearAll => bm.clear_all(),
            }
            prop_assert_eq!(bm.total_weight(), recount(&bm));
        }
    }

    /// Growing then shrinking back keeps the original prefix.
    #[test]
    fn test_resize_keeps_prefix(
        bits in 1u64..5000,
        grow in 1u64..40000,
        set in proptest::collection::vec(0u64..5000, 0..30),
    ) {
        let bm = ResyncBitmap::new();
        runtime().block_on(async {
            let guard = bm.lock("prop").await;
            guard.resize(bits * BM_SECT_PER_BIT).unwrap();
            bm.clear_all();
            for b in &set {
                bm.set_bits(*b, *b);
            }
            let before: Vec<Option<bool>> = (0..bits).map(|b| bm.test_bit(b)).collect();
            guard.resize((bits + grow) * BM_SECT_PER_BIT).unwrap();
            prop_assert_eq!(bm.total_weight(), recount(&bm));
            guard.resize(bits * BM_SECT_PER_BIT).unwrap();
            let after: Vec<Option<bool>> = (0..bits).map(|b| bm.test_bit(b)).collect();
            prop_assert_eq!(before, after);
            prop_assert_eq!(bm.total_weight(), recount(&bm));
            Ok(())
        })?;
    }

    /// Merging is monotonic and idempotent.
    #[test]
    fn test_merge_monotonic_idempotent(
        base in proptest::collection::vec(any::<u64>(), 8),
        peer in proptest::collection::vec(any::<u64>(), 8),
    ) {
        let mut bv = BitVector::with_bits(8 * 64).unwrap();
        bv.load_words(0, &base).unwrap();
        let before = bv.popcount();
        let added = bv.merge_words(0, &peer).unwrap();
        prop_assert_eq!(bv.popcount(), before + added);
        prop_assert_eq!(bv.merge_words(0, &peer).unwrap(), 0);
        for (i, w) in bv.copy_words(0, 8).unwrap().iter().enumerate() {
            prop_assert_eq!(*w, base[i] | peer[i]);
        }
    }

    /// Bitmaps written to a store read back bit for bit.
    #[test]
    fn test_persist_round_trip(
        bits in 1u64..3000,
        set in proptest::collection::vec(0u64..3000, 0..50),
    ) {
        let store = MemStore::new(2048);
        let bm = ResyncBitmap::new();
        runtime().block_on(async {
            let guard = bm.lock("prop").await;
            guard.resize(bits * BM_SECT_PER_BIT).unwrap();
            bm.clear_all();
            for b in &set {
                bm.set_bits(*b, *b);
            }
            let weight = bm.total_weight();
            guard.write_to(&store, 72, false).unwrap();
            bm.set_all();
            guard.read_from(&store, 72).unwrap();
            prop_assert_eq!(bm.total_weight(), weight);
            Ok(())
        })?;
    }
}
