//! Binomial (multistage Revolve) checkpointing.
//!
//! For `N` blocks and `S` snapshot slots the schedule performs the minimal
//! number of block replays over a complete reverse sweep:
//!
//! ```text
//! extra(n, s) = min_{i in [1, n)} i + extra(i, s) + extra(n - i, s - 1)
//! extra(1, s) = 0
//! extra(n, 1) = n (n - 1) / 2
//! ```
//!
//! where `s` counts the slot holding the current base snapshot. The
//! recurrence has the closed form `extra(n, s) = t n - C(s + t, s + 1)` with
//! `t` the smallest integer such that `C(s + t, s) >= n`.
//!
//! Snapshots form a stack. Each stack position is assigned a tier once, at
//! construction; see [`allocate_tiers`].
//!
//! The block 0 snapshot is cumulative: at each forward boundary, and at
//! finalize, it absorbs the initial conditions of values first read in the
//! epoch just closed and not written by any earlier block. It can then
//! replay the whole tape, which is what [`CheckpointSchedule::rewind`]
//! relies on.

use super::{simulate, CheckpointDriver, CheckpointSchedule, Snapshot, SnapshotLoad, Tier};
use crate::config::CheckpointMode;
use std::collections::HashMap;
use tape_core::{TapeError, TapeResult};

/// Minimal number of replayed blocks to reverse `n` blocks with `s` slots.
///
/// Returns `None` when the reversal is impossible (`s == 0` and `n > 1`) or
/// the count does not fit in a `u64`.
///
/// # Examples
///
/// ```
/// use tape_checkpoint::schedule::extra_steps;
///
/// assert_eq!(extra_steps(1, 0), Some(0));
/// assert_eq!(extra_steps(3, 1), Some(3));
/// assert_eq!(extra_steps(5, 2), Some(6));
/// assert_eq!(extra_steps(2, 0), None);
/// ```
pub fn extra_steps(n: usize, s: usize) -> Option<u64> {
    if n <= 1 {
        return Some(0);
    }
    if s == 0 {
        return None;
    }
    let n = n as u128;
    if s == 1 {
        return u64::try_from(n * (n - 1) / 2).ok();
    }

    let s = s as u128;
    // beta = C(s + t, s)
    let mut t: u128 = 0;
    let mut beta: u128 = 1;
    while beta < n {
        beta = beta * (s + t + 1) / (t + 1);
        t += 1;
    }
    // C(s + t, s + 1) = C(s + t, s) * t / (s + 1)
    let below = beta * t / (s + 1);
    u64::try_from(t * n - below).ok()
}

/// Memoised `extra(n, s)` values and optimal advances.
///
/// Rows are filled lazily up to the largest `n` requested; entries beyond
/// the configured bounds are computed but not retained.
#[derive(Clone, Debug)]
pub struct ExtraTable {
    max_n: usize,
    max_s: usize,
    rows: Vec<Vec<u64>>,
    advances: HashMap<(usize, usize), usize>,
}

/// Sentinel for an infinite (impossible) entry.
const INFINITE: u64 = u64::MAX;

impl ExtraTable {
    pub fn new(max_n: usize, max_s: usize) -> Self {
        Self {
            max_n,
            max_s,
            rows: vec![Vec::new(); max_s + 1],
            advances: HashMap::new(),
        }
    }

    /// `extra(n, s)`, or `None` if infinite.
    pub fn extra(&mut self, n: usize, s: usize) -> Option<u64> {
        if n > self.max_n || s > self.max_s {
            return extra_steps(n, s);
        }
        let row = &mut self.rows[s];
        while row.len() <= n {
            row.push(extra_steps(row.len(), s).unwrap_or(INFINITE));
        }
        match row[n] {
            INFINITE => None,
            v => Some(v),
        }
    }

    /// Optimal first advance when reversing `m >= 2` blocks with `s >= 1`
    /// slots: the smallest minimiser `i` of `i + extra(i, s) + extra(m - i, s - 1)`.
    pub fn advance(&mut self, m: usize, s: usize) -> usize {
        if m < 2 {
            return 1;
        }
        if let Some(&i) = self.advances.get(&(m, s)) {
            return i;
        }

        let mut best = (m - 1, INFINITE);
        for i in 1..m {
            let (Some(lower), Some(upper)) = (self.extra(i, s), self.extra(m - i, s - 1)) else {
                continue;
            };
            let cost = (i as u64).saturating_add(lower).saturating_add(upper);
            if cost < best.1 {
                best = (i, cost);
            }
        }

        if m <= self.max_n && s <= self.max_s {
            self.advances.insert((m, s), best.0);
        }
        best.0
    }
}

/// Assigns a tier to each snapshot stack position.
///
/// With only one tier available every slot uses it. Otherwise the schedule
/// is simulated once with every slot fast, and the `fast` positions with the
/// most snapshot traffic (writes plus reads) keep the fast tier. Ties go to
/// the deeper (higher) stack position.
pub fn allocate_tiers(max_n: usize, fast: usize, slow: usize) -> TapeResult<Vec<Tier>> {
    let slots = (fast + slow).min(max_n.saturating_sub(1));
    let fast = fast.min(slots);
    if fast == slots {
        return Ok(vec![Tier::Fast; slots]);
    }
    if fast == 0 {
        return Ok(vec![Tier::Slow; slots]);
    }

    let mut probe = BinomialSchedule::with_tiers(max_n, vec![Tier::Fast; slots]);
    let trace = simulate(&mut probe, max_n)?;

    let mut order: Vec<usize> = (0..slots).collect();
    order.sort_by(|&a, &b| trace.traffic(b).cmp(&trace.traffic(a)).then(b.cmp(&a)));

    let mut tiers = vec![Tier::Slow; slots];
    for &position in order.iter().take(fast) {
        tiers[position] = Tier::Fast;
    }
    Ok(tiers)
}

/// Multistage binomial checkpointing schedule.
///
/// # Example
///
/// ```
/// use tape_checkpoint::schedule::{simulate, BinomialSchedule};
///
/// let mut schedule = BinomialSchedule::new(10, 3, 0).unwrap();
/// let trace = simulate(&mut schedule, 10).unwrap();
/// assert_eq!(trace.replayed_blocks as u64, tape_checkpoint::schedule::extra_steps(10, 3).unwrap());
/// ```
#[derive(Clone, Debug)]
pub struct BinomialSchedule {
    max_n: usize,
    n: usize,
    r: usize,
    tiers: Vec<Tier>,
    snapshots: Vec<Snapshot>,
    deferred: Option<Snapshot>,
    /// First block of the forward epoch being recorded
    epoch_start: usize,
    table: ExtraTable,
    verbose: bool,
}

impl BinomialSchedule {
    /// Creates a schedule for `max_n` blocks with `fast` in-memory and `slow`
    /// on-disk snapshot slots.
    ///
    /// Slots beyond `max_n - 1` are never used and are dropped.
    ///
    /// # Errors
    ///
    /// [`TapeError::InvalidParameter`] if `max_n == 0`, or if `max_n > 1`
    /// and no slot is available.
    pub fn new(max_n: usize, fast: usize, slow: usize) -> TapeResult<Self> {
        if max_n == 0 {
            return Err(TapeError::InvalidParameter(
                "binomial checkpointing requires at least one block".to_string(),
            ));
        }
        if max_n > 1 && fast + slow == 0 {
            return Err(TapeError::InvalidParameter(format!(
                "binomial checkpointing of {} blocks requires at least one snapshot slot",
                max_n
            )));
        }
        let tiers = allocate_tiers(max_n, fast, slow)?;
        Ok(Self::with_tiers(max_n, tiers))
    }

    pub(crate) fn with_tiers(max_n: usize, tiers: Vec<Tier>) -> Self {
        let slots = tiers.len();
        Self {
            max_n,
            n: 0,
            r: 0,
            tiers,
            snapshots: Vec::with_capacity(slots),
            deferred: None,
            epoch_start: 0,
            table: ExtraTable::new(max_n, slots),
            verbose: false,
        }
    }

    /// Logs schedule events at `info` instead of `debug`.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Number of usable snapshot slots.
    pub fn slots(&self) -> usize {
        self.tiers.len()
    }

    /// Tier of each stack position.
    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// Snapshots currently on the stack, bottom first.
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Replayed blocks over a full reverse sweep.
    pub fn expected_replays(&mut self) -> Option<u64> {
        let (n, s) = (self.max_n, self.slots());
        self.table.extra(n, s)
    }

    fn load_snapshot(&mut self) -> TapeResult<SnapshotLoad> {
        let top = *self
            .snapshots
            .last()
            .ok_or_else(|| TapeError::missing("no snapshot available to restore from"))?;
        self.n = top.block;
        // The block 0 snapshot outlives the sweep so that it can be repeated.
        let delete = top.block > 0 && top.block + self.r + 1 == self.max_n;
        if delete {
            self.snapshots.pop();
        }
        Ok(SnapshotLoad {
            snapshot: top,
            delete,
        })
    }

    /// Folds the outside inputs of the closing epoch into the block 0 snapshot.
    fn extend_base(&self, driver: &mut dyn CheckpointDriver) -> TapeResult<()> {
        if self.epoch_start == 0 {
            return Ok(());
        }
        match self.initial_snapshot() {
            Some(base) => {
                schedule_event!(
                    self.verbose,
                    epoch = self.epoch_start,
                    tier = %base.tier,
                    "binomial: extend block 0 snapshot"
                );
                driver.extend_snapshot(base, self.epoch_start)
            }
            None => Ok(()),
        }
    }
}

impl CheckpointSchedule for BinomialSchedule {
    fn mode(&self) -> CheckpointMode {
        CheckpointMode::Binomial
    }

    fn n(&self) -> usize {
        self.n
    }

    fn r(&self) -> usize {
        self.r
    }

    fn max_n(&self) -> Option<usize> {
        Some(self.max_n)
    }

    fn snapshot(&mut self) -> TapeResult<()> {
        let position = self.snapshots.len();
        let tier = *self.tiers.get(position).ok_or_else(|| {
            TapeError::InvariantViolation(format!(
                "snapshot slots exhausted ({} in use)",
                position
            ))
        })?;
        let snapshot = Snapshot {
            block: self.n,
            tier,
        };
        schedule_event!(self.verbose, block = self.n, %tier, position, "binomial: deferred snapshot");
        self.snapshots.push(snapshot);
        self.deferred = Some(snapshot);
        Ok(())
    }

    fn forward(&mut self) {
        let p = self.n;
        let m = self.max_n.saturating_sub(self.r + p);
        self.n = if m <= 1 {
            p + 1
        } else {
            let s = (self.slots() + 1).saturating_sub(self.snapshots.len());
            if s <= 1 {
                self.max_n - self.r - 1
            } else {
                p + self.table.advance(m, s)
            }
        };
        schedule_event!(self.verbose, from = p, to = self.n, "binomial: forward");
    }

    fn reverse(&mut self) {
        self.r += 1;
        schedule_event!(self.verbose, reversed = self.r, "binomial: reverse");
    }

    fn start(&mut self, driver: &mut dyn CheckpointDriver) -> TapeResult<()> {
        if self.max_n == 1 {
            driver.configure(true, true);
        } else {
            driver.configure(true, false);
            self.snapshot()?;
        }
        self.forward();
        Ok(())
    }

    fn is_final_block(&self, n_blocks: usize) -> bool {
        n_blocks + 1 == self.max_n
    }

    fn checkpoint(
        &mut self,
        n_blocks: usize,
        finalize: bool,
        driver: &mut dyn CheckpointDriver,
    ) -> TapeResult<()> {
        if n_blocks > self.max_n || (finalize && n_blocks != self.max_n) {
            return Err(TapeError::InvalidState(format!(
                "binomial checkpointing configured for {} blocks but {} recorded",
                self.max_n, n_blocks
            )));
        }
        if n_blocks == self.max_n {
            return if finalize {
                self.extend_base(driver)
            } else {
                Ok(())
            };
        }
        if n_blocks < self.n {
            return Ok(());
        }

        if let Some(snapshot) = self.deferred.take() {
            driver.save_snapshot(snapshot)?;
        }
        self.extend_base(driver)?;
        driver.clear();
        self.epoch_start = n_blocks;
        if n_blocks + 1 == self.max_n {
            // Initial conditions are kept so that inputs first read in the
            // last block reach the block 0 snapshot.
            driver.configure(true, true);
        } else {
            driver.configure(true, false);
            self.snapshot()?;
        }
        self.forward();
        Ok(())
    }

    fn restore(&mut self, block: usize, driver: &mut dyn CheckpointDriver) -> TapeResult<()> {
        let current = self
            .max_n
            .checked_sub(self.r + 1)
            .ok_or_else(|| TapeError::invalid_state("all blocks have already been reversed"))?;
        if block != current {
            return Err(TapeError::InvalidState(format!(
                "blocks must be restored in reverse order: expected block {}, got {}",
                current, block
            )));
        }

        if self.n == block + 1 {
            schedule_event!(self.verbose, block, "binomial: data already available");
            self.reverse();
            return Ok(());
        }

        let load = self.load_snapshot()?;
        let base = load.snapshot.block;
        schedule_event!(
            self.verbose,
            block = base,
            tier = %load.snapshot.tier,
            delete = load.delete,
            "binomial: load snapshot"
        );
        driver.begin_replay(load, block + 1)?;
        if base < block {
            driver.configure(false, false);
        }

        let mut p = base;
        loop {
            if p == block {
                driver.configure(block == 0, true);
            } else if p > base {
                driver.configure(true, false);
                self.snapshot()?;
            }
            self.forward();
            let next = self.n;
            for replayed in p..next {
                driver.replay_block(replayed)?;
            }
            p = next;
            if p > block {
                break;
            }
            if let Some(snapshot) = self.deferred.take() {
                driver.save_snapshot(snapshot)?;
            }
            driver.clear();
        }
        driver.end_replay()?;

        self.reverse();
        Ok(())
    }

    fn finish_reverse(&mut self, driver: &mut dyn CheckpointDriver) -> TapeResult<()> {
        if self.max_n > 1 {
            driver.clear_data();
        }
        Ok(())
    }

    fn rewind(&mut self, _driver: &mut dyn CheckpointDriver) -> TapeResult<()> {
        if self.r == 0 {
            return Ok(());
        }
        if self.max_n == 1 {
            self.r = 0;
            self.n = 1;
            return Ok(());
        }
        let base = self
            .initial_snapshot()
            .ok_or_else(|| TapeError::missing("block 0 snapshot not retained"))?;
        self.r = 0;
        self.n = 0;
        self.deferred = None;
        self.snapshots.clear();
        self.snapshots.push(base);
        schedule_event!(self.verbose, tier = %base.tier, "binomial: rewound to block 0");
        Ok(())
    }

    fn initial_snapshot(&self) -> Option<Snapshot> {
        self.snapshots.first().filter(|s| s.block == 0).copied()
    }

    fn snapshots_in(&self, tier: Tier) -> usize {
        self.snapshots.iter().filter(|s| s.tier == tier).count()
    }
}
