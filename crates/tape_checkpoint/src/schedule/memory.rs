//! All-in-memory checkpointing: every block's data is recorded during the
//! forward pass and nothing is ever replayed.

use super::{CheckpointDriver, CheckpointSchedule, Snapshot, Tier};
use crate::config::CheckpointMode;
use tape_core::{TapeError, TapeResult};

#[derive(Clone, Debug, Default)]
pub struct MemorySchedule {
    n: usize,
    r: usize,
    max_n: Option<usize>,
}

impl MemorySchedule {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointSchedule for MemorySchedule {
    fn mode(&self) -> CheckpointMode {
        CheckpointMode::AllInMemory
    }

    fn n(&self) -> usize {
        self.n
    }

    fn r(&self) -> usize {
        self.r
    }

    fn max_n(&self) -> Option<usize> {
        self.max_n
    }

    /// Nothing to mark: the storage keeps every initial condition.
    fn snapshot(&mut self) -> TapeResult<()> {
        Ok(())
    }

    fn forward(&mut self) {
        self.n += 1;
    }

    fn reverse(&mut self) {
        self.r += 1;
    }

    fn start(&mut self, driver: &mut dyn CheckpointDriver) -> TapeResult<()> {
        driver.configure(true, true);
        Ok(())
    }

    fn checkpoint(
        &mut self,
        n_blocks: usize,
        finalize: bool,
        _driver: &mut dyn CheckpointDriver,
    ) -> TapeResult<()> {
        self.n = n_blocks;
        if finalize {
            self.max_n = Some(n_blocks);
        }
        Ok(())
    }

    fn restore(&mut self, block: usize, _driver: &mut dyn CheckpointDriver) -> TapeResult<()> {
        match self.max_n {
            Some(max_n) if block < max_n => {
                self.reverse();
                Ok(())
            }
            Some(max_n) => Err(TapeError::InvalidParameter(format!(
                "block {} out of range ({} blocks recorded)",
                block, max_n
            ))),
            None => Err(TapeError::invalid_state("tape has not been finalised")),
        }
    }

    fn rewind(&mut self, _driver: &mut dyn CheckpointDriver) -> TapeResult<()> {
        self.r = 0;
        Ok(())
    }

    fn initial_snapshot(&self) -> Option<Snapshot> {
        None
    }

    fn snapshots_in(&self, _tier: Tier) -> usize {
        0
    }
}
