//! Pending adjoint right-hand sides.
//!
//! Contributions routed to an equation output are summed until the reverse
//! sweep reaches the equation, which takes them all at once. An equation
//! with nothing pending has a zero adjoint and is pruned.

use crate::transpose::Use;
use std::collections::HashMap;
use tape_core::{Field, TapeResult, Variable};

/// Summed contributions keyed by (block, equation, output).
#[derive(Debug, Default)]
pub struct AdjointRhs {
    pending: HashMap<(usize, usize, usize), Field>,
}

impl AdjointRhs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `value` to the right-hand side of `target`.
    pub fn add(&mut self, target: Use, value: Field) -> TapeResult<()> {
        let key = (target.block, target.equation, target.output);
        match self.pending.get_mut(&key) {
            Some(sum) => sum.axpy(1.0, &value),
            None => {
                self.pending.insert(key, value);
                Ok(())
            }
        }
    }

    /// Sets the initial right-hand side of output `output` of an equation.
    pub fn seed(&mut self, block: usize, equation: usize, output: usize, value: Field) -> TapeResult<()> {
        self.add(
            Use {
                block,
                equation,
                output,
                active: true,
            },
            value,
        )
    }

    /// Removes and returns the right-hand sides of an equation, one per
    /// output, or `None` if nothing was routed to it. Outputs that received
    /// nothing get zero.
    pub fn take(&mut self, block: usize, equation: usize, outputs: &[Variable]) -> Option<Vec<Field>> {
        let mut any = false;
        let taken: Vec<Option<Field>> = (0..outputs.len())
            .map(|o| {
                let value = self.pending.remove(&(block, equation, o));
                any |= value.is_some();
                value
            })
            .collect();
        if !any {
            return None;
        }
        Some(
            taken
                .into_iter()
                .zip(outputs)
                .map(|(value, x)| value.unwrap_or_else(|| Field::zeros(x.space())))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
