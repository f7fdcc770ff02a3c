//! Replay-count optimality of the snapshot schedules.
//!
//! The binomial schedule must reverse `N` blocks with `S` slots using
//! exactly `extra(N, S)` replayed blocks, independently of how the slots are
//! split between tiers. The periodic schedule must write one slow-tier
//! snapshot per period and never delete it. Both keep the block 0 snapshot
//! so that the sweep can be repeated.

use proptest::prelude::*;
use tape_checkpoint::schedule::{
    extra_steps, simulate, BinomialSchedule, CheckpointSchedule, MemorySchedule, PeriodicSchedule,
};
use tape_checkpoint::{CheckpointConfig, Tier};

// ============================================================================
// Binomial
// ============================================================================

#[test]
fn test_binomial_exhaustive_small() {
    for n in 1..=60 {
        for s in 1..=8 {
            let mut schedule = BinomialSchedule::new(n, s, 0).unwrap();
            let trace = simulate(&mut schedule, n).unwrap();
            let slots = s.min(n - 1);
            assert_eq!(
                Some(trace.replayed_blocks as u64),
                extra_steps(n, slots),
                "n = {}, s = {}",
                n,
                s
            );
            assert_eq!(trace.blocks, n);
        }
    }
}

#[test]
fn test_binomial_single_slot_large() {
    let mut schedule = BinomialSchedule::new(1000, 1, 0).unwrap();
    let trace = simulate(&mut schedule, 1000).unwrap();
    assert_eq!(trace.replayed_blocks, 1000 * 999 / 2);
    assert_eq!(trace.max_live_snapshots, 1);
}

#[test]
fn test_binomial_many_slots_large() {
    let mut schedule = BinomialSchedule::new(1000, 50, 0).unwrap();
    let trace = simulate(&mut schedule, 1000).unwrap();
    assert_eq!(Some(trace.replayed_blocks as u64), extra_steps(1000, 50));
    assert!(trace.max_live_snapshots <= 50);
}

#[test]
fn test_binomial_releases_all_but_base_snapshot() {
    let mut schedule = BinomialSchedule::new(200, 6, 0).unwrap();
    let trace = simulate(&mut schedule, 200).unwrap();
    let writes: usize = trace.snapshot_writes.iter().sum();
    assert_eq!(trace.snapshots_deleted, writes - 1);
    assert_eq!(schedule.snapshots().len(), 1);
    assert_eq!(schedule.initial_snapshot().map(|s| s.block), Some(0));
}

#[test]
fn test_binomial_tier_capacities_respected() {
    let mut schedule = BinomialSchedule::new(300, 3, 4).unwrap();
    let tiers = schedule.tiers().to_vec();
    let trace = simulate(&mut schedule, 300).unwrap();
    assert_eq!(tiers.iter().filter(|&&t| t == Tier::Fast).count(), 3);
    assert_eq!(tiers.iter().filter(|&&t| t == Tier::Slow).count(), 4);
    assert_eq!(Some(trace.replayed_blocks as u64), extra_steps(300, 7));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_binomial_sampled(n in 2usize..1000, s in 1usize..50) {
        let mut schedule = BinomialSchedule::new(n, s, 0).unwrap();
        let trace = simulate(&mut schedule, n).unwrap();
        prop_assert_eq!(
            Some(trace.replayed_blocks as u64),
            extra_steps(n, s.min(n - 1))
        );
    }
}

// ============================================================================
// Periodic and memory
// ============================================================================

#[test]
fn test_periodic_snapshot_count() {
    for n in 1..40 {
        for k in 1..8 {
            let mut schedule = PeriodicSchedule::new(k).unwrap();
            let trace = simulate(&mut schedule, n).unwrap();
            assert_eq!(schedule.snapshots_in(Tier::Slow), (n + k - 1) / k);
            assert_eq!(schedule.snapshots_in(Tier::Fast), 0);
            assert_eq!(trace.snapshots_deleted, 0);
            assert_eq!(trace.replayed_blocks, n);
        }
    }
}

#[test]
fn test_memory_mode_from_config() {
    let mut schedule = CheckpointConfig::memory().build_schedule().unwrap();
    let trace = simulate(schedule.as_mut(), 17).unwrap();
    assert_eq!(trace.replayed_blocks, 0);

    let mut direct = MemorySchedule::new();
    assert_eq!(simulate(&mut direct, 17).unwrap(), trace);
}
