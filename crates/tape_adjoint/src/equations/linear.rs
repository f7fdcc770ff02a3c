use super::{check_same_dim, zero_tangent};
use tape_core::{Equation, EquationBase, Field, TangentLinearMap, TapeError, TapeResult, Variable};

/// `x = Σ αᵢ yᵢ`
///
/// A dependency may appear in several terms; its contributions add.
#[derive(Debug)]
pub struct LinearCombination {
    base: EquationBase,
    alphas: Vec<f64>,
}

impl LinearCombination {
    pub fn new(x: &Variable, terms: Vec<(f64, Variable)>) -> TapeResult<Self> {
        if terms.is_empty() {
            return Err(TapeError::InvalidParameter(
                "linear combination requires at least one term".to_string(),
            ));
        }
        for (_, y) in &terms {
            check_same_dim(x, y)?;
        }
        let (alphas, ys): (Vec<f64>, Vec<Variable>) = terms.into_iter().unzip();
        Ok(Self {
            base: EquationBase::new(vec![x.clone()], ys, Vec::new())?,
            alphas,
        })
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }
}

impl Equation for LinearCombination {
    delegate_base!();

    fn name(&self) -> &'static str {
        "LinearCombination"
    }

    fn forward_solve(&self, deps: &[Field]) -> TapeResult<Vec<Field>> {
        let mut x = Field::zeros(self.base.outputs()[0].space());
        for (alpha, y) in self.alphas.iter().zip(&deps[1..]) {
            x.axpy(*alpha, y)?;
        }
        Ok(vec![x])
    }

    fn adjoint(&self, _nl_deps: &[Field], rhs: &[Field]) -> TapeResult<Option<Vec<Field>>> {
        Ok(Some(rhs.to_vec()))
    }

    fn partial_route(
        &self,
        dep_index: usize,
        _nl_deps: &[Field],
        adj_x: &[Field],
    ) -> TapeResult<Option<Field>> {
        let Some(&alpha) = dep_index.checked_sub(1).and_then(|i| self.alphas.get(i)) else {
            return Ok(None);
        };
        let mut contribution = adj_x[0].clone();
        contribution.scale(alpha);
        Ok(Some(contribution))
    }

    fn tangent_linear(
        &self,
        m: &[Variable],
        dm: &[Variable],
        tlm_map: &mut TangentLinearMap,
    ) -> TapeResult<Box<dyn Equation>> {
        let deps = self.base.dependencies();
        let terms: Vec<(f64, Variable)> = self
            .alphas
            .iter()
            .zip(&deps[1..])
            .filter_map(|(&alpha, y)| tlm_map.tangent(y, m, dm).map(|tau_y| (alpha, tau_y)))
            .collect();
        if terms.is_empty() {
            return zero_tangent(&deps[0], tlm_map);
        }
        let tau_x = tlm_map.get_or_create(&deps[0]);
        Ok(Box::new(LinearCombination::new(&tau_x, terms)?))
    }
}
