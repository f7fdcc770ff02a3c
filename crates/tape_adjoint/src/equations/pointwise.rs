use super::{check_same_dim, zero_tangent, PointwiseTangent};
use std::fmt;
use tape_core::{Equation, EquationBase, Field, TangentLinearMap, TapeResult, Variable};

/// Scalar function applied component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointwiseOp {
    Square,
    Cube,
    Sin,
    Exp,
    Tanh,
    /// Defined for non-negative arguments; derivatives at 0 are taken as 0.
    Sqrt,
}

impl PointwiseOp {
    #[inline]
    pub fn apply(self, v: f64) -> f64 {
        match self {
            PointwiseOp::Square => v * v,
            PointwiseOp::Cube => v * v * v,
            PointwiseOp::Sin => v.sin(),
            PointwiseOp::Exp => v.exp(),
            PointwiseOp::Tanh => v.tanh(),
            PointwiseOp::Sqrt => v.sqrt(),
        }
    }

    #[inline]
    pub fn derivative(self, v: f64) -> f64 {
        match self {
            PointwiseOp::Square => 2.0 * v,
            PointwiseOp::Cube => 3.0 * v * v,
            PointwiseOp::Sin => v.cos(),
            PointwiseOp::Exp => v.exp(),
            PointwiseOp::Tanh => {
                let t = v.tanh();
                1.0 - t * t
            }
            PointwiseOp::Sqrt if v > 0.0 => 0.5 / v.sqrt(),
            PointwiseOp::Sqrt => 0.0,
        }
    }

    #[inline]
    pub fn second_derivative(self, v: f64) -> f64 {
        match self {
            PointwiseOp::Square => 2.0,
            PointwiseOp::Cube => 6.0 * v,
            PointwiseOp::Sin => -v.sin(),
            PointwiseOp::Exp => v.exp(),
            PointwiseOp::Tanh => {
                let t = v.tanh();
                -2.0 * t * (1.0 - t * t)
            }
            PointwiseOp::Sqrt if v > 0.0 => -0.25 / (v * v.sqrt()),
            PointwiseOp::Sqrt => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PointwiseOp::Square => "square",
            PointwiseOp::Cube => "cube",
            PointwiseOp::Sin => "sin",
            PointwiseOp::Exp => "exp",
            PointwiseOp::Tanh => "tanh",
            PointwiseOp::Sqrt => "sqrt",
        }
    }
}

impl fmt::Display for PointwiseOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `x = f(y)` component-wise.
#[derive(Debug)]
pub struct Pointwise {
    base: EquationBase,
    op: PointwiseOp,
}

impl Pointwise {
    pub fn new(x: &Variable, y: &Variable, op: PointwiseOp) -> TapeResult<Self> {
        check_same_dim(x, y)?;
        Ok(Self {
            base: EquationBase::new(vec![x.clone()], vec![y.clone()], vec![1])?,
            op,
        })
    }

    pub fn op(&self) -> PointwiseOp {
        self.op
    }
}

impl Equation for Pointwise {
    delegate_base!();

    fn name(&self) -> &'static str {
        "Pointwise"
    }

    fn forward_solve(&self, deps: &[Field]) -> TapeResult<Vec<Field>> {
        let op = self.op;
        Ok(vec![deps[1].map(|v| op.apply(v))])
    }

    fn adjoint(&self, _nl_deps: &[Field], rhs: &[Field]) -> TapeResult<Option<Vec<Field>>> {
        Ok(Some(rhs.to_vec()))
    }

    fn partial_route(
        &self,
        dep_index: usize,
        nl_deps: &[Field],
        adj_x: &[Field],
    ) -> TapeResult<Option<Field>> {
        if dep_index != 1 {
            return Ok(None);
        }
        let op = self.op;
        adj_x[0]
            .zip_map(&nl_deps[0], |a, y| a * op.derivative(y))
            .map(Some)
    }

    fn tangent_linear(
        &self,
        m: &[Variable],
        dm: &[Variable],
        tlm_map: &mut TangentLinearMap,
    ) -> TapeResult<Box<dyn Equation>> {
        let deps = self.base.dependencies();
        let Some(tau_y) = tlm_map.tangent(&deps[1], m, dm) else {
            return zero_tangent(&deps[0], tlm_map);
        };
        let tau_x = tlm_map.get_or_create(&deps[0]);
        Ok(Box::new(PointwiseTangent::new(&tau_x, &deps[1], &tau_y, self.op)?))
    }
}
