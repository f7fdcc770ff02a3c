//! Shared value buffers.
//!
//! A [`Field`] is a vector of `f64` bound to a [`FunctionSpace`]. Cloning a
//! field shares the buffer; mutation goes through [`Arc::make_mut`] so a
//! clone held elsewhere (for example a checkpoint *reference*) never observes
//! a later write. [`Field::deep_copy`] forces an owned buffer, which is what
//! the checkpoint store records for checkpointable variables.

use super::space::FunctionSpace;
use crate::error::{TapeError, TapeResult};
use std::sync::Arc;

/// Values of a variable.
#[derive(Clone, Debug)]
pub struct Field {
    space: Arc<FunctionSpace>,
    data: Arc<Vec<f64>>,
}

impl Field {
    /// Zero field in `space`.
    pub fn zeros(space: &Arc<FunctionSpace>) -> Self {
        Self::constant(space, 0.0)
    }

    /// Field with every component set to `value`.
    pub fn constant(space: &Arc<FunctionSpace>, value: f64) -> Self {
        Self {
            space: Arc::clone(space),
            data: Arc::new(vec![value; space.dim()]),
        }
    }

    /// Builds a field from explicit values.
    ///
    /// # Errors
    ///
    /// [`TapeError::DimensionMismatch`] if `values.len()` differs from the
    /// space dimension.
    pub fn from_values(space: &Arc<FunctionSpace>, values: Vec<f64>) -> TapeResult<Self> {
        if values.len() != space.dim() {
            return Err(TapeError::DimensionMismatch {
                expected: space.dim(),
                got: values.len(),
            });
        }
        Ok(Self {
            space: Arc::clone(space),
            data: Arc::new(values),
        })
    }

    #[inline]
    pub fn space(&self) -> &Arc<FunctionSpace> {
        &self.space
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.data
    }

    /// Mutable access; detaches from any other holder of the buffer.
    pub fn values_mut(&mut self) -> &mut [f64] {
        Arc::<Vec<f64>>::make_mut(&mut self.data)
    }

    /// Copy with its own buffer.
    pub fn deep_copy(&self) -> Self {
        Self {
            space: Arc::clone(&self.space),
            data: Arc::new(self.data.as_ref().clone()),
        }
    }

    /// Whether `self` and `other` share one buffer.
    pub fn shares_storage(&self, other: &Field) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Component-wise equality of the bit patterns, including the space.
    pub fn bitwise_eq(&self, other: &Field) -> bool {
        self.space.id() == other.space.id()
            && self.data.len() == other.data.len()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }

    fn check_compatible(&self, other: &Field) -> TapeResult<()> {
        if self.len() != other.len() {
            return Err(TapeError::DimensionMismatch {
                expected: self.len(),
                got: other.len(),
            });
        }
        Ok(())
    }

    /// `self += alpha * x`
    pub fn axpy(&mut self, alpha: f64, x: &Field) -> TapeResult<()> {
        self.check_compatible(x)?;
        for (yi, xi) in self.values_mut().iter_mut().zip(x.data.iter()) {
            *yi += alpha * xi;
        }
        Ok(())
    }

    /// `self *= alpha`
    pub fn scale(&mut self, alpha: f64) {
        for v in self.values_mut() {
            *v *= alpha;
        }
    }

    /// New field `f(self_i)` component-wise.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            space: Arc::clone(&self.space),
            data: Arc::new(self.data.iter().map(|&v| f(v)).collect()),
        }
    }

    /// New field `f(self_i, other_i)` component-wise.
    pub fn zip_map(&self, other: &Field, f: impl Fn(f64, f64) -> f64) -> TapeResult<Self> {
        self.check_compatible(other)?;
        Ok(Self {
            space: Arc::clone(&self.space),
            data: Arc::new(
                self.data
                    .iter()
                    .zip(other.data.iter())
                    .map(|(&a, &b)| f(a, b))
                    .collect(),
            ),
        })
    }

    pub fn dot(&self, other: &Field) -> TapeResult<f64> {
        self.check_compatible(other)?;
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a * b)
            .sum())
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn linf_norm(&self) -> f64 {
        self.data.iter().fold(0.0_f64, |m, v| m.max(v.abs()))
    }
}
