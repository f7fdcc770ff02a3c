//! Periodic slow-tier checkpointing.
//!
//! Only initial conditions are recorded during the forward pass. At the end
//! of every period of `K` blocks (and at finalisation) the initial
//! conditions of the period are written to the slow tier. The reverse sweep
//! replays a whole period at a time, recording its data, so each snapshot is
//! read once per period and never deleted.

use super::{CheckpointDriver, CheckpointSchedule, Snapshot, SnapshotLoad, Tier};
use crate::config::CheckpointMode;
use std::collections::BTreeSet;
use tape_core::{TapeError, TapeResult};

#[derive(Clone, Debug)]
pub struct PeriodicSchedule {
    period: usize,
    n: usize,
    r: usize,
    max_n: Option<usize>,
    deferred: Option<Snapshot>,
    saved: BTreeSet<usize>,
    loaded: BTreeSet<usize>,
    verbose: bool,
}

impl PeriodicSchedule {
    /// # Errors
    ///
    /// [`TapeError::InvalidParameter`] if `period` is zero.
    pub fn new(period: usize) -> TapeResult<Self> {
        if period == 0 {
            return Err(TapeError::InvalidParameter(
                "checkpoint period must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            period,
            n: 0,
            r: 0,
            max_n: None,
            deferred: None,
            saved: BTreeSet::new(),
            loaded: BTreeSet::new(),
            verbose: false,
        })
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Blocks whose period has been written to the slow tier.
    pub fn saved(&self) -> impl Iterator<Item = usize> + '_ {
        self.saved.iter().copied()
    }
}

impl CheckpointSchedule for PeriodicSchedule {
    fn mode(&self) -> CheckpointMode {
        CheckpointMode::Periodic
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

    fn snapshot(&mut self) -> TapeResult<()> {
        let snapshot = Snapshot {
            block: self.n,
            tier: Tier::Slow,
        };
        schedule_event!(self.verbose, block = self.n, "periodic: deferred snapshot");
        self.deferred = Some(snapshot);
        Ok(())
    }

    fn forward(&mut self) {
        self.n += self.period;
        if let Some(max_n) = self.max_n {
            self.n = self.n.min(max_n);
        }
    }

    fn reverse(&mut self) {
        self.r += 1;
    }

    fn start(&mut self, driver: &mut dyn CheckpointDriver) -> TapeResult<()> {
        driver.configure(true, false);
        self.snapshot()?;
        self.forward();
        Ok(())
    }

    fn checkpoint(
        &mut self,
        n_blocks: usize,
        finalize: bool,
        driver: &mut dyn CheckpointDriver,
    ) -> TapeResult<()> {
        if finalize {
            self.max_n = Some(n_blocks);
        }
        if n_blocks == 0 || !(finalize || n_blocks % self.period == 0) {
            return Ok(());
        }

        if let Some(snapshot) = self.deferred.take() {
            driver.save_snapshot(snapshot)?;
            self.saved.insert(snapshot.block);
        }
        driver.clear();
        driver.configure(true, false);
        if !finalize {
            self.n = n_blocks;
            self.snapshot()?;
            self.forward();
        }
        Ok(())
    }

    fn restore(&mut self, block: usize, driver: &mut dyn CheckpointDriver) -> TapeResult<()> {
        let max_n = self
            .max_n
            .ok_or_else(|| TapeError::invalid_state("tape has not been finalised"))?;
        if block >= max_n {
            return Err(TapeError::InvalidParameter(format!(
                "block {} out of range ({} blocks recorded)",
                block, max_n
            )));
        }
        if self.loaded.contains(&block) {
            self.reverse();
            return Ok(());
        }

        let start = (block / self.period) * self.period;
        let end = (start + self.period).min(max_n);
        if !self.saved.contains(&start) {
            return Err(TapeError::missing(format!(
                "no periodic snapshot for block {}",
                start
            )));
        }
        schedule_event!(self.verbose, start, end, "periodic: replaying period");

        self.loaded.clear();
        let load = SnapshotLoad {
            snapshot: Snapshot {
                block: start,
                tier: Tier::Slow,
            },
            delete: false,
        };
        driver.begin_replay(load, end)?;
        for replayed in start..end {
            driver.configure(replayed == 0, true);
            driver.replay_block(replayed)?;
            self.loaded.insert(replayed);
        }
        driver.end_replay()?;

        self.n = end;
        self.reverse();
        Ok(())
    }

    fn rewind(&mut self, _driver: &mut dyn CheckpointDriver) -> TapeResult<()> {
        self.r = 0;
        Ok(())
    }

    fn initial_snapshot(&self) -> Option<Snapshot> {
        self.saved.contains(&0).then_some(Snapshot {
            block: 0,
            tier: Tier::Slow,
        })
    }

    fn snapshots_in(&self, tier: Tier) -> usize {
        match tier {
            Tier::Fast => 0,
            Tier::Slow => self.saved.len(),
        }
    }
}
