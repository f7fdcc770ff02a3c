//! Current values owned by the domain.

use super::field::Field;
use super::ids::VarId;
use super::variable::Variable;
use crate::error::{TapeError, TapeResult};
use std::collections::HashMap;

/// Map from variable id to its current value.
///
/// Equations are solved against a workspace; the tape reads dependency
/// values from it when recording.
#[derive(Clone, Debug, Default)]
pub struct Workspace {
    values: HashMap<VarId, Field>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value of `x`.
    ///
    /// # Errors
    ///
    /// [`TapeError::DimensionMismatch`] if the field does not fit `x`'s space.
    pub fn set(&mut self, x: &Variable, value: Field) -> TapeResult<()> {
        if value.len() != x.space().dim() {
            return Err(TapeError::DimensionMismatch {
                expected: x.space().dim(),
                got: value.len(),
            });
        }
        self.values.insert(x.id(), value);
        Ok(())
    }

    /// Current value of `x`.
    pub fn get(&self, x: &Variable) -> TapeResult<&Field> {
        self.values
            .get(&x.id())
            .ok_or_else(|| TapeError::Equation(format!("no value assigned to {}", x)))
    }

    /// Current value of `x`, or zero if never assigned.
    pub fn get_or_zero(&self, x: &Variable) -> Field {
        self.values
            .get(&x.id())
            .cloned()
            .unwrap_or_else(|| Field::zeros(x.space()))
    }

    pub fn contains(&self, x: &Variable) -> bool {
        self.values.contains_key(&x.id())
    }

    pub fn remove(&mut self, x: &Variable) -> Option<Field> {
        self.values.remove(&x.id())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
