//! Schedule command implementation
//!
//! Simulates the binomial schedule over a tape of `blocks` blocks and prints
//! the minimal replay count, the tier of each snapshot slot and the
//! simulated snapshot traffic.

use serde::Serialize;
use tape_checkpoint::schedule::{allocate_tiers, extra_steps, simulate, BinomialSchedule};
use tape_checkpoint::Tier;
use tracing::info;

use crate::{CliError, Result};

/// Outcome of a schedule simulation.
#[derive(Debug, Serialize)]
pub struct ScheduleReport {
    pub blocks: usize,
    /// Usable snapshot slots, at most `blocks - 1`
    pub slots: usize,
    pub extra: Option<u64>,
    pub tiers: Vec<Tier>,
    pub replayed_blocks: usize,
    pub total_executions: usize,
    pub snapshot_writes: Vec<usize>,
    pub snapshot_reads: Vec<usize>,
    pub snapshots_deleted: usize,
    pub max_live_snapshots: usize,
}

/// Simulates a binomial schedule with `fast` and `slow` slots.
pub fn build_report(blocks: usize, fast: usize, slow: usize) -> Result<ScheduleReport> {
    if blocks == 0 {
        return Err(CliError::InvalidArgument(
            "--blocks must be at least 1".to_string(),
        ));
    }
    let tiers = allocate_tiers(blocks, fast, slow)?;
    let mut schedule = BinomialSchedule::new(blocks, fast, slow)?;
    let trace = simulate(&mut schedule, blocks)?;

    Ok(ScheduleReport {
        blocks,
        slots: tiers.len(),
        extra: extra_steps(blocks, tiers.len()),
        tiers,
        replayed_blocks: trace.replayed_blocks,
        total_executions: trace.total_executions(),
        snapshot_writes: trace.snapshot_writes,
        snapshot_reads: trace.snapshot_reads,
        snapshots_deleted: trace.snapshots_deleted,
        max_live_snapshots: trace.max_live_snapshots,
    })
}

/// Run the schedule command
pub fn run(blocks: usize, fast: usize, slow: usize, json: bool) -> Result<()> {
    info!(blocks, fast, slow, "Simulating binomial schedule");
    let report = build_report(blocks, fast, slow)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Blocks:              {}", report.blocks);
    println!("Snapshot slots:      {}", report.slots);
    match report.extra {
        Some(extra) => println!("extra(N, S):         {}", extra),
        None => println!("extra(N, S):         unbounded (no slots)"),
    }
    println!("Replayed blocks:     {}", report.replayed_blocks);
    println!("Forward executions:  {}", report.total_executions);
    println!("Snapshots deleted:   {}", report.snapshots_deleted);
    println!("Max live snapshots:  {}", report.max_live_snapshots);
    println!();
    println!("{:<10} {:<6} {:>8} {:>8}", "Position", "Tier", "Writes", "Reads");
    println!("--------------------------------------");
    for (position, tier) in report.tiers.iter().enumerate() {
        println!(
            "{:<10} {:<6} {:>8} {:>8}",
            position,
            tier,
            report.snapshot_writes.get(position).copied().unwrap_or(0),
            report.snapshot_reads.get(position).copied().unwrap_or(0)
        );
    }
    Ok(())
}
