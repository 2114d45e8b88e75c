//! Randomized invariant checks for the ARC managers.

use std::collections::HashSet;

use proptest::prelude::*;

use kv_arc_offload::cache::adaptive::AdaptiveArcManager;
use kv_arc_offload::cache::arc::{ArcContents, ArcOffloadingManager};
use kv_arc_offload::cache::backend::SimulatedBackend;
use kv_arc_offload::cache::block::{BlockHash, Medium};
use kv_arc_offload::cache::manager::OffloadingManager;

#[derive(Debug, Clone)]
enum Op {
    /// Store blocks, completing the store unless `leave_pending`.
    Store { keys: Vec<u8>, leave_pending: bool },
    /// Look up, then pin the hit prefix until the next `Unpin`.
    Pin(Vec<u8>),
    Unpin,
    Touch(Vec<u8>),
    CompletePending,
}

fn keys() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(0u8..24, 1..5)
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (keys(), prop::bool::weighted(0.2))
            .prop_map(|(keys, leave_pending)| Op::Store { keys, leave_pending }),
        2 => keys().prop_map(Op::Pin),
        1 => Just(Op::Unpin),
        3 => keys().prop_map(Op::Touch),
        1 => Just(Op::CompletePending),
    ]
}

fn hashes(keys: &[u8]) -> Vec<BlockHash> {
    keys.iter().map(|key| BlockHash::from_raw(*key as u128)).collect()
}

fn check_lists(contents: &ArcContents, capacity: usize) {
    let t1: HashSet<_> = contents.t1.iter().collect();
    let t2: HashSet<_> = contents.t2.iter().collect();
    let b1: HashSet<_> = contents.b1.iter().collect();
    let b2: HashSet<_> = contents.b2.iter().collect();

    assert!(t1.is_disjoint(&t2), "T1 and T2 overlap");
    assert!(b1.is_disjoint(&b2), "B1 and B2 overlap");
    for ghost in b1.union(&b2) {
        assert!(!t1.contains(ghost) && !t2.contains(ghost), "ghost {ghost} is resident");
    }
    assert!(t1.len() + t2.len() <= capacity);
    assert!(b1.len() <= capacity && b2.len() <= capacity);
    assert!(contents.target_t1_size >= 0.0);
    assert!(contents.target_t1_size <= capacity as f64);
}

/// Drive `ops` through a manager, checking invariants after every step.
fn run_ops<M: OffloadingManager>(m: &M, contents: impl Fn() -> ArcContents, capacity: usize, ops: &[Op]) {
    let mut pinned: Vec<BlockHash> = Vec::new();
    let mut pending: Vec<BlockHash> = Vec::new();

    for op in ops {
        match op {
            Op::Store { keys, leave_pending } => {
                let before = contents();
                match m.prepare_store(&hashes(keys)) {
                    Some(out) => {
                        for victim in &out.evicted {
                            assert!(!pinned.contains(victim), "pinned block {victim} evicted");
                            assert!(!pending.contains(victim), "pending block {victim} evicted");
                        }
                        if *leave_pending {
                            pending.extend(out.to_store);
                        } else {
                            m.complete_store(&out.to_store);
                        }
                    }
                    None => assert_eq!(contents(), before, "rejected store changed state"),
                }
            }
            Op::Pin(keys) => {
                let hashes = hashes(keys);
                let hits = m.lookup(&hashes);
                m.prepare_load(&hashes[..hits]);
                pinned.extend_from_slice(&hashes[..hits]);
            }
            Op::Unpin => {
                m.complete_load(&pinned);
                pinned.clear();
            }
            Op::Touch(keys) => m.touch(&hashes(keys)),
            Op::CompletePending => {
                m.complete_store(&pending);
                pending.clear();
            }
        }
        check_lists(&contents(), capacity);
    }
}

proptest! {
    #[test]
    fn prop_arc_lists_stay_partitioned(capacity in 1usize..8, ops in prop::collection::vec(op(), 1..60)) {
        let m = ArcOffloadingManager::new(SimulatedBackend::new(Medium::Cpu, capacity, 64));
        run_ops(&m, || m.contents(), capacity, &ops);
    }

    #[test]
    fn prop_adaptive_lists_stay_partitioned(capacity in 1usize..8, ops in prop::collection::vec(op(), 1..60)) {
        let m = AdaptiveArcManager::new(SimulatedBackend::new(Medium::Cpu, capacity, 64));
        m.register_request_blocks("sticky", &hashes(&[0, 1, 2, 3]));
        run_ops(&m, || m.contents(), capacity, &ops);
        prop_assert!(m.adaptation_speed() >= 0.1 && m.adaptation_speed() <= 10.0);
    }

    #[test]
    fn prop_free_blocks_match_residency(capacity in 1usize..8, ops in prop::collection::vec(op(), 1..60)) {
        let m = ArcOffloadingManager::new(SimulatedBackend::new(Medium::Cpu, capacity, 64));
        run_ops(&m, || m.contents(), capacity, &ops);
        let stats = m.stats();
        prop_assert_eq!(stats.free_blocks + stats.t1_len + stats.t2_len, capacity);
    }
}
