//! Equations that only arise as tangent-linear models of other equations.

use super::{check_same_dim, PointwiseOp};
use tape_core::{Equation, EquationBase, Field, TapeError, TapeResult, Variable};

/// `x = 0`
///
/// Written for an output tangent when no input of the primal equation has a
/// tangent.
#[derive(Debug)]
pub struct ZeroAssignment {
    base: EquationBase,
}

impl ZeroAssignment {
    pub fn new(x: &Variable) -> TapeResult<Self> {
        Ok(Self {
            base: EquationBase::new(vec![x.clone()], Vec::new(), Vec::new())?,
        })
    }
}

impl Equation for ZeroAssignment {
    delegate_base!();

    fn name(&self) -> &'static str {
        "ZeroAssignment"
    }

    fn forward_solve(&self, _deps: &[Field]) -> TapeResult<Vec<Field>> {
        Ok(vec![Field::zeros(self.base.outputs()[0].space())])
    }

    fn adjoint(&self, _nl_deps: &[Field], rhs: &[Field]) -> TapeResult<Option<Vec<Field>>> {
        Ok(Some(rhs.to_vec()))
    }

    fn partial_route(
        &self,
        _dep_index: usize,
        _nl_deps: &[Field],
        _adj_x: &[Field],
    ) -> TapeResult<Option<Field>> {
        Ok(None)
    }
}

/// `x = f'(y) ⊙ t` for a pointwise `f`.
#[derive(Debug)]
pub struct PointwiseTangent {
    base: EquationBase,
    op: PointwiseOp,
}

impl PointwiseTangent {
    pub fn new(x: &Variable, y: &Variable, t: &Variable, op: PointwiseOp) -> TapeResult<Self> {
        check_same_dim(x, y)?;
        check_same_dim(x, t)?;
        Ok(Self {
            base: EquationBase::new(vec![x.clone()], vec![y.clone(), t.clone()], vec![1, 2])?,
            op,
        })
    }
}

impl Equation for PointwiseTangent {
    delegate_base!();

    fn name(&self) -> &'static str {
        "PointwiseTangent"
    }

    fn forward_solve(&self, deps: &[Field]) -> TapeResult<Vec<Field>> {
        let op = self.op;
        Ok(vec![deps[1].zip_map(&deps[2], |y, t| op.derivative(y) * t)?])
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
        let op = self.op;
        match dep_index {
            1 => {
                let curvature = nl_deps[0].zip_map(&nl_deps[1], |y, t| op.second_derivative(y) * t)?;
                adj_x[0].zip_map(&curvature, |a, c| a * c).map(Some)
            }
            2 => adj_x[0]
                .zip_map(&nl_deps[0], |a, y| a * op.derivative(y))
                .map(Some),
            _ => Ok(None),
        }
    }
}

/// `x = Σₖ aₖ ⊙ bₖ`, or `x = Σₖ aₖ · bₖ` with `x` scalar.
#[derive(Debug)]
pub struct ProductSum {
    base: EquationBase,
    reduce: bool,
}

impl ProductSum {
    /// Component-wise sum of products.
    pub fn new(x: &Variable, pairs: Vec<(Variable, Variable)>) -> TapeResult<Self> {
        for (a, b) in &pairs {
            check_same_dim(x, a)?;
            check_same_dim(x, b)?;
        }
        Self::build(x, pairs, false)
    }

    /// Sum of inner products into the scalar `x`.
    pub fn dot(x: &Variable, pairs: Vec<(Variable, Variable)>) -> TapeResult<Self> {
        if x.space().dim() != 1 {
            return Err(TapeError::InvalidParameter(format!(
                "dot product output {} must be scalar",
                x
            )));
        }
        for (a, b) in &pairs {
            check_same_dim(a, b)?;
        }
        Self::build(x, pairs, true)
    }

    fn build(x: &Variable, pairs: Vec<(Variable, Variable)>, reduce: bool) -> TapeResult<Self> {
        if pairs.is_empty() {
            return Err(TapeError::InvalidParameter(
                "product sum requires at least one pair".to_string(),
            ));
        }
        let n_inputs = 2 * pairs.len();
        let inputs = pairs.into_iter().flat_map(|(a, b)| [a, b]).collect();
        Ok(Self {
            base: EquationBase::new(vec![x.clone()], inputs, (1..=n_inputs).collect())?,
            reduce,
        })
    }
}

impl Equation for ProductSum {
    delegate_base!();

    fn name(&self) -> &'static str {
        "ProductSum"
    }

    fn forward_solve(&self, deps: &[Field]) -> TapeResult<Vec<Field>> {
        let space = self.base.outputs()[0].space();
        let pairs = deps[1..].chunks_exact(2);
        if self.reduce {
            let mut value = 0.0;
            for pair in pairs {
                value += pair[0].dot(&pair[1])?;
            }
            return Ok(vec![Field::constant(space, value)]);
        }
        let mut x = Field::zeros(space);
        for pair in pairs {
            let term = pair[0].zip_map(&pair[1], |a, b| a * b)?;
            x.axpy(1.0, &term)?;
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
        let Some(other) = dep_index.checked_sub(1).and_then(|i| nl_deps.get(i ^ 1)) else {
            return Ok(None);
        };
        if self.reduce {
            let mut contribution = other.clone();
            contribution.scale(adj_x[0].sum());
            return Ok(Some(contribution));
        }
        adj_x[0].zip_map(other, |a, v| a * v).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tape_core::FunctionSpace;

    #[test]
    fn test_zero_assignment_has_no_routes() {
        let space = FunctionSpace::new("R2", 2);
        let x = Variable::new(&space, "x");
        let eq = ZeroAssignment::new(&x).unwrap();
        let out = eq.forward_solve(&[Field::constant(&space, 3.0)]).unwrap();
        assert_eq!(out[0].values(), &[0.0, 0.0]);
        assert_eq!(eq.dependencies().len(), 1);
        assert!(eq
            .partial_route(0, &[], &[Field::constant(&space, 1.0)])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_pointwise_tangent_routes_match_central_differences() {
        let space = FunctionSpace::scalar();
        let x = Variable::new(&space, "x");
        let y = Variable::new(&space, "y");
        let t = Variable::new(&space, "t");
        let eq = PointwiseTangent::new(&x, &y, &t, PointwiseOp::Tanh).unwrap();

        let value = |yv: f64, tv: f64| {
            eq.forward_solve(&[
                Field::zeros(&space),
                Field::constant(&space, yv),
                Field::constant(&space, tv),
            ])
            .unwrap()[0]
                .values()[0]
        };
        let (y0, t0, h) = (0.4, -1.5, 1e-6);
        let nl = vec![Field::constant(&space, y0), Field::constant(&space, t0)];
        let adj = vec![Field::constant(&space, 2.0)];

        let dy = eq.partial_route(1, &nl, &adj).unwrap().unwrap().values()[0];
        let fd = (value(y0 + h, t0) - value(y0 - h, t0)) / (2.0 * h);
        assert_relative_eq!(dy, 2.0 * fd, max_relative = 1e-6);

        let dt = eq.partial_route(2, &nl, &adj).unwrap().unwrap().values()[0];
        let fd = (value(y0, t0 + h) - value(y0, t0 - h)) / (2.0 * h);
        assert_relative_eq!(dt, 2.0 * fd, max_relative = 1e-6);
    }

    #[test]
    fn test_product_sum_routes_to_partner() {
        let s2 = FunctionSpace::new("R2", 2);
        let r = FunctionSpace::scalar();
        let x = Variable::new(&s2, "x");
        let j = Variable::new(&r, "J");
        let vars: Vec<Variable> = ["a", "b", "c", "d"]
            .iter()
            .map(|n| Variable::new(&s2, n))
            .collect();
        let pairs = vec![
            (vars[0].clone(), vars[1].clone()),
            (vars[2].clone(), vars[3].clone()),
        ];
        let values = vec![
            Field::from_values(&s2, vec![1.0, 2.0]).unwrap(),
            Field::from_values(&s2, vec![3.0, 4.0]).unwrap(),
            Field::from_values(&s2, vec![5.0, 6.0]).unwrap(),
            Field::from_values(&s2, vec![7.0, 8.0]).unwrap(),
        ];

        let componentwise = ProductSum::new(&x, pairs.clone()).unwrap();
        let mut deps = vec![Field::zeros(&s2)];
        deps.extend(values.iter().cloned());
        assert_eq!(componentwise.forward_solve(&deps).unwrap()[0].values(), &[38.0, 56.0]);
        let adj = vec![Field::constant(&s2, 1.0)];
        let route = componentwise.partial_route(3, &values, &adj).unwrap().unwrap();
        assert_eq!(route.values(), &[7.0, 8.0]);

        let reduced = ProductSum::dot(&j, pairs).unwrap();
        deps[0] = Field::zeros(&r);
        assert_eq!(reduced.forward_solve(&deps).unwrap()[0].values(), &[94.0]);
        let adj = vec![Field::constant(&r, 2.0)];
        let route = reduced.partial_route(2, &values, &adj).unwrap().unwrap();
        assert_eq!(route.values(), &[2.0, 4.0]);
        assert!(reduced.partial_route(0, &values, &adj).unwrap().is_none());
    }

    #[test]
    fn test_product_sum_rejects_empty_pairs() {
        let space = FunctionSpace::scalar();
        let x = Variable::new(&space, "x");
        assert!(ProductSum::new(&x, Vec::new()).is_err());
        assert!(ProductSum::dot(&x, Vec::new()).is_err());
    }
}
