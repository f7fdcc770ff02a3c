//! Replay storage.
//!
//! Holds the values needed while re-executing a contiguous range of blocks
//! and releases each value as soon as its last consumer in the range has
//! run. A value is tracked only if some equation in the range lists it as a
//! dependency.

use std::collections::{HashMap, VecDeque};
use tape_core::{Field, TapeError, TapeResult, VarId, Variable};

/// Values live during a forward replay.
#[derive(Debug, Default)]
pub struct ReplayStorage {
    eq_last: VecDeque<Vec<VarId>>,
    map: HashMap<VarId, Option<Field>>,
}

impl ReplayStorage {
    /// Builds the store from the dependency lists of the equations in the
    /// replay range, in execution order.
    pub fn new<'a, I>(dependency_lists: I) -> Self
    where
        I: IntoIterator<Item = &'a [Variable]>,
    {
        let mut last_use: HashMap<VarId, usize> = HashMap::new();
        let mut n_equations = 0;
        for (i, deps) in dependency_lists.into_iter().enumerate() {
            for dep in deps {
                last_use.insert(dep.id(), i);
            }
            n_equations = i + 1;
        }

        let mut eq_last = vec![Vec::new(); n_equations];
        for (id, &i) in &last_use {
            eq_last[i].push(*id);
        }
        let map = last_use.into_keys().map(|id| (id, None)).collect();

        Self {
            eq_last: eq_last.into(),
            map,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether `id` is needed somewhere in the remaining range.
    pub fn tracks(&self, id: VarId) -> bool {
        self.map.contains_key(&id)
    }

    /// Current value of `x`.
    ///
    /// # Errors
    ///
    /// [`TapeError::MissingData`] if `x` is not tracked or has no value yet.
    pub fn get(&self, x: &Variable) -> TapeResult<Field> {
        match self.map.get(&x.id()) {
            Some(Some(v)) => Ok(v.clone()),
            Some(None) => Err(TapeError::missing(format!(
                "no value for {} available during replay",
                x
            ))),
            None => Err(TapeError::missing(format!(
                "{} is not tracked by the replay storage",
                x
            ))),
        }
    }

    /// Current value of `x`, or zero if none has been set.
    pub fn get_or_zero(&self, x: &Variable) -> Field {
        match self.map.get(&x.id()) {
            Some(Some(v)) => v.clone(),
            _ => Field::zeros(x.space()),
        }
    }

    /// Sets the value of a tracked id. Returns `false` and drops the value
    /// if `id` is not tracked.
    pub fn set(&mut self, id: VarId, value: Field) -> bool {
        match self.map.get_mut(&id) {
            Some(slot) => {
                *slot = Some(value);
                true
            }
            None => false,
        }
    }

    /// Seeds tracked ids from `values`; untracked ids are ignored.
    pub fn update(&mut self, values: impl IntoIterator<Item = (VarId, Field)>) {
        for (id, value) in values {
            self.set(id, value);
        }
    }

    /// Releases the values whose last consumer is the next equation.
    pub fn pop(&mut self) {
        if let Some(ids) = self.eq_last.pop_front() {
            for id in ids {
                self.map.remove(&id);
            }
        }
    }

    /// Checks that every value was released.
    ///
    /// # Errors
    ///
    /// [`TapeError::ReplayInvariantViolation`] if values remain.
    pub fn finish(self) -> TapeResult<()> {
        if self.map.is_empty() {
            Ok(())
        } else {
            Err(TapeError::ReplayInvariantViolation {
                remaining: self.map.len(),
            })
        }
    }
}
