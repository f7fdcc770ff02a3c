use super::{check_same_dim, zero_tangent, PointwiseOp, PointwiseTangent};
use tape_core::{Equation, EquationBase, Field, TangentLinearMap, TapeError, TapeResult, Variable};

const DEFAULT_TOLERANCE: f64 = 1e-14;
const DEFAULT_MAX_ITERATIONS: usize = 64;

/// `x = √y` by Newton iteration, started from the previous value of `x`.
///
/// The converged value depends on the starting guess in its last bits, so a
/// replay only reproduces the forward pass if it starts from the same
/// guess. The previous value of `x` is therefore an initial condition of the
/// equation, and the adjoint needs the new value of `x`.
#[derive(Debug)]
pub struct NewtonSqrt {
    base: EquationBase,
    tolerance: f64,
    max_iterations: usize,
}

impl NewtonSqrt {
    pub fn new(x: &Variable, y: &Variable) -> TapeResult<Self> {
        check_same_dim(x, y)?;
        Ok(Self {
            base: EquationBase::new(vec![x.clone()], vec![y.clone()], vec![0])?,
            tolerance: DEFAULT_TOLERANCE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        })
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    fn solve_one(&self, guess: f64, y: f64) -> TapeResult<f64> {
        if y < 0.0 {
            return Err(TapeError::Equation(format!(
                "square root of negative value {}",
                y
            )));
        }
        if y == 0.0 {
            return Ok(0.0);
        }
        let mut g = if guess > 0.0 { guess } else { y.max(1.0) };
        for _ in 0..self.max_iterations {
            let next = 0.5 * (g + y / g);
            let converged = (next - g).abs() <= self.tolerance * next;
            g = next;
            if converged {
                break;
            }
        }
        Ok(g)
    }
}

impl Equation for NewtonSqrt {
    delegate_base!();

    fn name(&self) -> &'static str {
        "NewtonSqrt"
    }

    fn has_initial_condition(&self) -> bool {
        true
    }

    fn forward_solve(&self, deps: &[Field]) -> TapeResult<Vec<Field>> {
        let mut x = deps[0].clone();
        for (xi, &yi) in x.values_mut().iter_mut().zip(deps[1].values()) {
            *xi = self.solve_one(*xi, yi)?;
        }
        Ok(vec![x])
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
        adj_x[0]
            .zip_map(&nl_deps[0], |a, x| if x == 0.0 { 0.0 } else { 0.5 * a / x })
            .map(Some)
    }

    /// The tangent is that of the exact square root; the starting guess
    /// only moves the last bits.
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
        Ok(Box::new(PointwiseTangent::new(
            &tau_x,
            &deps[1],
            &tau_y,
            PointwiseOp::Sqrt,
        )?))
    }
}
