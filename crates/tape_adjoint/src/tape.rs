//! The equation tape and its replay driver.
//!
//! [`Tape`] owns the recorded equations in an arena and groups them into
//! blocks. [`TapeDriver`] carries out the storage side effects requested by
//! a snapshot schedule: it saves and loads snapshots and replays blocks
//! against a [`ReplayStorage`], feeding the replayed values back into the
//! checkpoint store.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tape_checkpoint::{
    CheckpointDriver, CheckpointStorage, ClearScope, ReplayStorage, Snapshot, SnapshotLoad,
    SnapshotTiers,
};
use tape_core::{Equation, EquationId, EquationKey, Field, TapeError, TapeResult, VarId};

/// Replay and snapshot counters of a manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub replayed_blocks: usize,
    pub replayed_equations: usize,
    pub snapshots_saved: usize,
    pub snapshots_loaded: usize,
    pub snapshots_deleted: usize,
    /// Completed reverse sweeps
    pub reverse_sweeps: usize,
}

/// Arena of recorded equations grouped into blocks.
#[derive(Debug, Default)]
pub struct Tape {
    equations: Vec<Box<dyn Equation>>,
    /// Closed blocks, as indices into `equations`
    blocks: Vec<Vec<usize>>,
    /// The open block
    block: Vec<usize>,
    index: HashMap<EquationId, usize>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key the next pushed equation will be recorded under.
    pub fn next_key(&self) -> EquationKey {
        EquationKey::new(self.blocks.len(), self.block.len())
    }

    /// Appends `eq` to the open block.
    pub fn push(&mut self, eq: Box<dyn Equation>) {
        let slot = self.equations.len();
        self.index.insert(eq.id(), slot);
        self.equations.push(eq);
        self.block.push(slot);
    }

    /// Closes the open block, even if empty.
    pub fn close_block(&mut self) {
        let block = std::mem::take(&mut self.block);
        self.blocks.push(block);
    }

    /// Reopens the last closed block, undoing [`close_block`](Self::close_block).
    pub fn reopen_block(&mut self) {
        if let Some(mut last) = self.blocks.pop() {
            last.append(&mut self.block);
            self.block = last;
        }
    }

    /// Number of closed blocks.
    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Equations in the open block.
    pub fn open_len(&self) -> usize {
        self.block.len()
    }

    pub fn equation_count(&self) -> usize {
        self.equations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.equations.is_empty()
    }

    /// Equations of closed block `b`, in order.
    pub fn block(&self, b: usize) -> impl Iterator<Item = &dyn Equation> + '_ {
        self.blocks
            .get(b)
            .into_iter()
            .flatten()
            .map(move |&slot| self.equations[slot].as_ref())
    }

    /// Equations of the open block, in order.
    pub fn open_block(&self) -> impl Iterator<Item = &dyn Equation> + '_ {
        self.block
            .iter()
            .map(move |&slot| self.equations[slot].as_ref())
    }

    /// Every equation, closed blocks first, then the open block.
    pub fn equations(&self) -> impl Iterator<Item = &dyn Equation> + '_ {
        self.blocks
            .iter()
            .chain(std::iter::once(&self.block))
            .flatten()
            .map(move |&slot| self.equations[slot].as_ref())
    }

    pub fn get_mut(&mut self, id: EquationId) -> Option<&mut Box<dyn Equation>> {
        let slot = *self.index.get(&id)?;
        self.equations.get_mut(slot)
    }
}

/// Storage side of the snapshot schedules for a [`Tape`].
pub(crate) struct TapeDriver<'a> {
    tape: &'a Tape,
    cp: &'a mut CheckpointStorage,
    tiers: &'a mut SnapshotTiers,
    stats: &'a mut ReplayStats,
    replay: Option<ReplayStorage>,
}

impl<'a> TapeDriver<'a> {
    pub(crate) fn new(
        tape: &'a Tape,
        cp: &'a mut CheckpointStorage,
        tiers: &'a mut SnapshotTiers,
        stats: &'a mut ReplayStats,
    ) -> Self {
        Self {
            tape,
            cp,
            tiers,
            stats,
            replay: None,
        }
    }
}

impl CheckpointDriver for TapeDriver<'_> {
    fn configure(&mut self, store_ics: bool, store_data: bool) {
        self.cp.configure(store_ics, store_data);
    }

    fn clear(&mut self) {
        self.cp.clear(ClearScope::EPOCH);
    }

    fn clear_data(&mut self) {
        self.cp.clear(ClearScope::DATA);
    }

    fn save_snapshot(&mut self, snapshot: Snapshot) -> TapeResult<()> {
        let entries = self.cp.snapshot_entries();
        tracing::trace!(
            block = snapshot.block,
            tier = %snapshot.tier,
            values = entries.len(),
            "saving snapshot"
        );
        self.tiers.save(snapshot, entries)?;
        self.stats.snapshots_saved += 1;
        Ok(())
    }

    fn extend_snapshot(&mut self, base: Snapshot, epoch_start: usize) -> TapeResult<()> {
        let written: HashSet<VarId> = (0..epoch_start)
            .flat_map(|b| self.tape.block(b))
            .flat_map(|eq| eq.outputs().iter().map(|x| x.id()))
            .collect();
        let inputs: Vec<_> = self
            .cp
            .snapshot_entries()
            .into_iter()
            .filter(|(key, _)| !written.contains(&key.id))
            .collect();
        if inputs.is_empty() {
            return Ok(());
        }
        let added = self.tiers.extend(base, inputs)?;
        tracing::trace!(block = base.block, epoch_start, added, "extended snapshot");
        Ok(())
    }

    fn begin_replay(&mut self, load: SnapshotLoad, end: usize) -> TapeResult<()> {
        if self.replay.is_some() {
            return Err(TapeError::invalid_state("a replay is already in progress"));
        }
        let base = load.snapshot.block;
        self.cp.clear(ClearScope::EPOCH);

        let tape = self.tape;
        let mut replay = ReplayStorage::new(
            (base..end).flat_map(move |b| tape.block(b).map(|eq| eq.dependencies())),
        );
        replay.update(self.cp.initial_conditions(false, true));
        let entries = self.tiers.load(load, &|id| replay.tracks(id))?;
        replay.update(entries.into_iter().map(|(key, value)| (key.id, value)));

        self.stats.snapshots_loaded += 1;
        if load.delete {
            self.stats.snapshots_deleted += 1;
        }
        self.replay = Some(replay);
        Ok(())
    }

    fn replay_block(&mut self, block: usize) -> TapeResult<()> {
        let replay = self
            .replay
            .as_mut()
            .ok_or_else(|| TapeError::invalid_state("replay requested outside a replay range"))?;

        for (k, eq) in self.tape.block(block).enumerate() {
            let n_outputs = eq.outputs().len();
            let mut values: Vec<Field> = Vec::with_capacity(eq.dependencies().len());
            for (i, dep) in eq.dependencies().iter().enumerate() {
                values.push(if i < n_outputs {
                    replay.get_or_zero(dep)
                } else {
                    replay.get(dep)?
                });
            }

            if eq.has_initial_condition() {
                for (x, value) in eq.outputs().iter().zip(&values) {
                    self.cp.add_initial_condition(x, value, None);
                }
            }

            let outputs = eq.forward_solve(&values)?;
            if outputs.len() != n_outputs {
                return Err(TapeError::InvariantViolation(format!(
                    "{} returned {} values for {} outputs",
                    eq.name(),
                    outputs.len(),
                    n_outputs
                )));
            }
            for (i, (x, value)) in eq.outputs().iter().zip(outputs).enumerate() {
                replay.set(x.id(), value.clone());
                values[i] = value;
            }

            self.cp
                .add_equation(EquationKey::new(block, k), eq, &values)?;
            replay.pop();
            self.stats.replayed_equations += 1;
        }
        self.stats.replayed_blocks += 1;
        Ok(())
    }

    fn end_replay(&mut self) -> TapeResult<()> {
        match self.replay.take() {
            Some(replay) => replay.finish(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equations::{Assignment, Pointwise, PointwiseOp};
    use tape_checkpoint::Tier;
    use tape_core::{FunctionSpace, Variable};

    #[test]
    fn test_blocks_and_lookup() {
        let space = FunctionSpace::scalar();
        let a = Variable::new(&space, "a");
        let b = Variable::new(&space, "b");
        let c = Variable::new(&space, "c");

        let mut tape = Tape::new();
        let eq0 = Assignment::new(&b, &a).unwrap();
        let id0 = eq0.id();
        tape.push(Box::new(eq0));
        tape.close_block();
        assert_eq!(tape.next_key(), EquationKey::new(1, 0));
        tape.push(Box::new(Assignment::new(&c, &b).unwrap()));

        assert_eq!(tape.n_blocks(), 1);
        assert_eq!(tape.open_len(), 1);
        assert_eq!(tape.block(0).count(), 1);
        assert_eq!(tape.block(1).count(), 0);
        assert_eq!(tape.equations().count(), 2);
        assert!(tape.get_mut(id0).is_some());
    }

    #[test]
    fn test_replay_regenerates_data() {
        let space = FunctionSpace::scalar();
        let a = Variable::new(&space, "a");
        let b = Variable::new(&space, "b");
        let c = Variable::new(&space, "c");

        let mut tape = Tape::new();
        tape.push(Box::new(Pointwise::new(&b, &a, PointwiseOp::Square).unwrap()));
        tape.close_block();
        tape.push(Box::new(Pointwise::new(&c, &b, PointwiseOp::Cube).unwrap()));
        tape.close_block();

        // Forward in initial-conditions mode: only a is recorded.
        let mut cp = CheckpointStorage::new();
        cp.configure(true, false);
        let av = Field::constant(&space, 3.0);
        let bv = Field::constant(&space, 9.0);
        let cv = Field::constant(&space, 729.0);
        let eqs: Vec<&dyn Equation> = tape.block(0).chain(tape.block(1)).collect();
        cp.add_equation(EquationKey::new(0, 0), eqs[0], &[bv.clone(), av]).unwrap();
        cp.add_equation(EquationKey::new(1, 0), eqs[1], &[cv, bv]).unwrap();

        let mut tiers = SnapshotTiers::memory_only();
        let mut stats = ReplayStats::default();
        let mut driver = TapeDriver::new(&tape, &mut cp, &mut tiers, &mut stats);
        let snapshot = Snapshot {
            block: 0,
            tier: Tier::Fast,
        };
        driver.save_snapshot(snapshot).unwrap();

        driver
            .begin_replay(SnapshotLoad { snapshot, delete: true }, 2)
            .unwrap();
        driver.configure(false, true);
        driver.replay_block(0).unwrap();
        driver.replay_block(1).unwrap();
        driver.end_replay().unwrap();

        assert_eq!(cp.lookup(EquationKey::new(1, 0)).unwrap()[0].values(), &[9.0]);
        assert_eq!(cp.lookup(EquationKey::new(0, 0)).unwrap()[0].values(), &[3.0]);
        assert_eq!(stats.replayed_blocks, 2);
        assert_eq!(stats.snapshots_deleted, 1);
    }
}
