//! Reference equations.
//!
//! Small explicit operations on [`Field`](tape_core::Field)s, enough to
//! build the time-stepping demo and the end-to-end tests. Each adjoint is
//! the identity; `partial_route` returns the transposed Jacobian action on
//! the adjoint solution.
//!
//! | Equation | Forward | Non-linear dependencies |
//! |---|---|---|
//! | [`Assignment`] | `x = y` | none |
//! | [`LinearCombination`] | `x = Σ αᵢ yᵢ` | none |
//! | [`Pointwise`] | `x = f(y)` | `y` |
//! | [`Product`] | `x = y ⊙ z` | `y`, `z` |
//! | [`DotProduct`] | `x = y · z` | `y`, `z` |
//! | [`NewtonSqrt`] | `x = √y`, iterated from the previous `x` | `x` |
//! | [`ZeroAssignment`] | `x = 0` | none |
//! | [`PointwiseTangent`] | `x = f'(y) ⊙ t` | `y`, `t` |
//! | [`ProductSum`] | `x = Σ aₖ ⊙ bₖ` or `Σ aₖ · bₖ` | all inputs |
//!
//! Every equation except the last two implements
//! [`Equation::tangent_linear`](tape_core::Equation::tangent_linear).

/// Forwards the bookkeeping methods of [`Equation`](tape_core::Equation)
/// to a `base: EquationBase` field.
macro_rules! delegate_base {
    () => {
        fn id(&self) -> tape_core::EquationId {
            self.base.id()
        }

        fn outputs(&self) -> &[tape_core::Variable] {
            self.base.outputs()
        }

        fn dependencies(&self) -> &[tape_core::Variable] {
            self.base.dependencies()
        }

        fn nonlinear_dependency_indices(&self) -> &[usize] {
            self.base.nonlinear_dependency_indices()
        }

        fn replace(
            &mut self,
            mapping: &std::collections::HashMap<tape_core::VarId, tape_core::Variable>,
        ) {
            self.base.replace(mapping)
        }
    };
}

mod assignment;
mod linear;
mod pointwise;
mod product;
mod sqrt;
mod tangent;

pub use assignment::Assignment;
pub use linear::LinearCombination;
pub use pointwise::{Pointwise, PointwiseOp};
pub use product::{DotProduct, Product};
pub use sqrt::NewtonSqrt;
pub use tangent::{PointwiseTangent, ProductSum, ZeroAssignment};

use tape_core::{Equation, TangentLinearMap, TapeError, TapeResult, Variable};

/// Checks that `x` and `y` live in spaces of the same dimension.
fn check_same_dim(x: &Variable, y: &Variable) -> TapeResult<()> {
    if x.space().dim() != y.space().dim() {
        return Err(TapeError::DimensionMismatch {
            expected: x.space().dim(),
            got: y.space().dim(),
        });
    }
    Ok(())
}

/// `τx = 0` for the output `x`.
fn zero_tangent(x: &Variable, tlm_map: &mut TangentLinearMap) -> TapeResult<Box<dyn Equation>> {
    Ok(Box::new(ZeroAssignment::new(&tlm_map.get_or_create(x))?))
}
