//! Snapshot scheduling.
//!
//! A schedule decides, block by block, what the checkpoint storage records
//! during the forward pass and how the reverse sweep regenerates the data
//! it did not record.
//!
//! # Overview
//!
//! All schedules share one contract:
//!
//! - [`CheckpointSchedule::snapshot`]: mark a snapshot at the current
//!   position. The snapshot is *deferred*: its contents are the initial
//!   conditions recorded while executing the blocks that follow, and it is
//!   written out when the schedule next advances past a boundary.
//! - [`CheckpointSchedule::forward`]: choose the next target position.
//! - [`CheckpointSchedule::restore`]: make the non-linear data of a block
//!   available, replaying from a snapshot if necessary.
//! - [`CheckpointSchedule::reverse`]: record that one more block has been
//!   reversed.
//!
//! Storage side effects are issued through [`CheckpointDriver`], which the
//! tape implements. This keeps the schedules free of any knowledge of
//! equations.
//!
//! # Key Components
//!
//! - [`MemorySchedule`]: record everything, never replay
//! - [`PeriodicSchedule`]: one slow-tier snapshot per period
//! - [`BinomialSchedule`]: optimal multistage (Revolve) schedule
//! - [`ExtraTable`]: memoised minimal replay counts
//! - [`simulate`]: runs a schedule against a counting driver

/// Logs a schedule event at `debug`, or `info` when verbose.
macro_rules! schedule_event {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}

mod binomial;
mod memory;
mod periodic;
mod simulate;

pub use binomial::{allocate_tiers, extra_steps, BinomialSchedule, ExtraTable};
pub use memory::MemorySchedule;
pub use periodic::PeriodicSchedule;
pub use simulate::{simulate, ScheduleTrace};

use crate::config::CheckpointMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use tape_core::TapeResult;

/// Storage tier of a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// In-memory.
    Fast,
    /// On-disk.
    Slow,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Fast => write!(f, "fast"),
            Tier::Slow => write!(f, "slow"),
        }
    }
}

/// A snapshot of the initial conditions at the start of `block`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Snapshot {
    pub block: usize,
    pub tier: Tier,
}

/// Instruction to load a snapshot at the start of a replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotLoad {
    pub snapshot: Snapshot,
    /// Remove the snapshot from its tier after loading.
    pub delete: bool,
}

/// Storage operations a schedule issues.
pub trait CheckpointDriver {
    /// Sets what the checkpoint storage records from now on.
    fn configure(&mut self, store_ics: bool, store_data: bool);

    /// Starts a new storage epoch; retained references survive.
    fn clear(&mut self);

    /// Drops non-linear data only.
    fn clear_data(&mut self);

    /// Writes the currently recorded initial conditions as `snapshot`.
    fn save_snapshot(&mut self, snapshot: Snapshot) -> TapeResult<()>;

    /// Adds to the saved `base` the initial conditions recorded since block
    /// `epoch_start` that no block before `epoch_start` writes, so that
    /// `base` holds every value read from outside the tape.
    fn extend_snapshot(&mut self, _base: Snapshot, _epoch_start: usize) -> TapeResult<()> {
        Ok(())
    }

    /// Clears storage and prepares to replay blocks `[snapshot block, end)`
    /// from the loaded snapshot.
    fn begin_replay(&mut self, load: SnapshotLoad, end: usize) -> TapeResult<()>;

    /// Re-executes one block of the prepared range.
    fn replay_block(&mut self, block: usize) -> TapeResult<()>;

    /// Completes the replay, checking all replay values were released.
    fn end_replay(&mut self) -> TapeResult<()>;
}

/// Common contract of the snapshot schedules.
pub trait CheckpointSchedule: fmt::Debug + Send {
    fn mode(&self) -> CheckpointMode;

    /// Current target position of the forward motion.
    fn n(&self) -> usize;

    /// Number of blocks reversed so far.
    fn r(&self) -> usize;

    /// Total number of blocks, when known.
    fn max_n(&self) -> Option<usize>;

    /// Marks a deferred snapshot at the current position.
    fn snapshot(&mut self) -> TapeResult<()>;

    /// Advances the forward target.
    fn forward(&mut self);

    /// Records that one more block has been reversed.
    fn reverse(&mut self);

    /// Configures storage before the first block is recorded.
    fn start(&mut self, driver: &mut dyn CheckpointDriver) -> TapeResult<()>;

    /// Whether a manager holding `n_blocks` closed blocks is in the last
    /// block, so that further block boundaries must be refused.
    fn is_final_block(&self, _n_blocks: usize) -> bool {
        false
    }

    /// Handles the boundary after `n_blocks` closed blocks.
    fn checkpoint(
        &mut self,
        n_blocks: usize,
        finalize: bool,
        driver: &mut dyn CheckpointDriver,
    ) -> TapeResult<()>;

    /// Makes the non-linear data of `block` available, then reverses it.
    fn restore(&mut self, block: usize, driver: &mut dyn CheckpointDriver) -> TapeResult<()>;

    /// Called once the reverse sweep is complete.
    fn finish_reverse(&mut self, _driver: &mut dyn CheckpointDriver) -> TapeResult<()> {
        Ok(())
    }

    /// Prepares a further reverse sweep over the same tape.
    fn rewind(&mut self, _driver: &mut dyn CheckpointDriver) -> TapeResult<()> {
        Ok(())
    }

    /// Snapshot holding the initial conditions of block 0, if one exists.
    fn initial_snapshot(&self) -> Option<Snapshot> {
        None
    }

    /// Number of snapshots currently held in `tier`.
    fn snapshots_in(&self, tier: Tier) -> usize;
}
