//! Dry runs of a schedule.
//!
//! [`simulate`] drives a schedule through a complete forward pass and
//! reverse sweep of `n_blocks` blocks without any equations, checking that
//! the non-linear data of every block is available when the reverse sweep
//! reaches it and counting replays and snapshot traffic. Tier allocation
//! and the CLI `schedule` command are built on it.

use super::{CheckpointDriver, CheckpointSchedule, Snapshot, SnapshotLoad};
use std::collections::BTreeSet;
use std::ops::Range;
use tape_core::{TapeError, TapeResult};

/// Counters collected by [`simulate`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScheduleTrace {
    /// Blocks executed by the original forward pass
    pub blocks: usize,
    /// Blocks re-executed during the reverse sweep
    pub replayed_blocks: usize,
    /// Snapshot writes per stack position
    pub snapshot_writes: Vec<usize>,
    /// Snapshot reads per stack position
    pub snapshot_reads: Vec<usize>,
    /// Snapshots deleted after their last read
    pub snapshots_deleted: usize,
    /// Largest number of snapshots held at once
    pub max_live_snapshots: usize,
}

impl ScheduleTrace {
    /// Writes plus reads at stack position `position`.
    pub fn traffic(&self, position: usize) -> usize {
        self.snapshot_writes.get(position).copied().unwrap_or(0)
            + self.snapshot_reads.get(position).copied().unwrap_or(0)
    }

    /// Forward executions of any kind.
    pub fn total_executions(&self) -> usize {
        self.blocks + self.replayed_blocks
    }
}

/// Driver that records what a real tape would do.
#[derive(Debug, Default)]
pub(crate) struct CountingDriver {
    store_ics: bool,
    store_data: bool,
    /// Blocks whose non-linear data is currently held
    data: BTreeSet<usize>,
    /// Live snapshot blocks, indexed by stack position
    live: Vec<usize>,
    replay: Option<Range<usize>>,
    next_replay: usize,
    trace: ScheduleTrace,
}

impl CountingDriver {
    fn bump(counts: &mut Vec<usize>, position: usize) {
        if counts.len() <= position {
            counts.resize(position + 1, 0);
        }
        counts[position] += 1;
    }

    fn execute(&mut self, block: usize) {
        if self.store_data {
            self.data.insert(block);
        }
    }

    fn run_original(&mut self, block: usize) {
        self.trace.blocks += 1;
        self.execute(block);
    }

    fn has_data(&self, block: usize) -> bool {
        self.data.contains(&block)
    }
}

impl CheckpointDriver for CountingDriver {
    fn configure(&mut self, store_ics: bool, store_data: bool) {
        self.store_ics = store_ics;
        self.store_data = store_data;
    }

    fn clear(&mut self) {
        self.data.clear();
    }

    fn clear_data(&mut self) {
        self.data.clear();
    }

    fn save_snapshot(&mut self, snapshot: Snapshot) -> TapeResult<()> {
        let position = match self.live.iter().position(|&b| b == snapshot.block) {
            Some(p) => p,
            None => {
                self.live.push(snapshot.block);
                self.live.len() - 1
            }
        };
        Self::bump(&mut self.trace.snapshot_writes, position);
        self.trace.max_live_snapshots = self.trace.max_live_snapshots.max(self.live.len());
        Ok(())
    }

    fn begin_replay(&mut self, load: SnapshotLoad, end: usize) -> TapeResult<()> {
        let block = load.snapshot.block;
        let position = self
            .live
            .iter()
            .position(|&b| b == block)
            .ok_or_else(|| TapeError::missing(format!("snapshot at block {} never saved", block)))?;
        Self::bump(&mut self.trace.snapshot_reads, position);
        if load.delete {
            self.live.remove(position);
            self.trace.snapshots_deleted += 1;
        }
        self.data.clear();
        self.replay = Some(block..end);
        self.next_replay = block;
        Ok(())
    }

    fn replay_block(&mut self, block: usize) -> TapeResult<()> {
        let range = self
            .replay
            .clone()
            .ok_or_else(|| TapeError::invalid_state("replay requested outside a replay range"))?;
        if block != self.next_replay || !range.contains(&block) {
            return Err(TapeError::InvariantViolation(format!(
                "block {} replayed out of order (expected {} within {:?})",
                block, self.next_replay, range
            )));
        }
        self.next_replay += 1;
        self.trace.replayed_blocks += 1;
        self.execute(block);
        Ok(())
    }

    fn end_replay(&mut self) -> TapeResult<()> {
        self.replay = None;
        Ok(())
    }
}

/// Runs `schedule` over `n_blocks` blocks and a full reverse sweep.
///
/// # Errors
///
/// Any error from the schedule, and [`TapeError::MissingData`] if a block's
/// data is unavailable when the reverse sweep reaches it.
pub fn simulate(schedule: &mut dyn CheckpointSchedule, n_blocks: usize) -> TapeResult<ScheduleTrace> {
    if n_blocks == 0 {
        return Err(TapeError::InvalidParameter(
            "cannot simulate an empty tape".to_string(),
        ));
    }
    let mut driver = CountingDriver::default();

    schedule.start(&mut driver)?;
    for k in 1..n_blocks {
        driver.run_original(k - 1);
        schedule.checkpoint(k, false, &mut driver)?;
    }
    driver.run_original(n_blocks - 1);
    schedule.checkpoint(n_blocks, true, &mut driver)?;

    for block in (0..n_blocks).rev() {
        schedule.restore(block, &mut driver)?;
        if !driver.has_data(block) {
            return Err(TapeError::missing(format!(
                "{:?} left no data for block {} after restore",
                schedule.mode(),
                block
            )));
        }
    }
    schedule.finish_reverse(&mut driver)?;

    Ok(driver.trace)
}
