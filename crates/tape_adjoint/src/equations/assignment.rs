use super::{check_same_dim, zero_tangent};
use tape_core::{Equation, EquationBase, Field, TangentLinearMap, TapeResult, Variable};

/// `x = y`
#[derive(Debug)]
pub struct Assignment {
    base: EquationBase,
}

impl Assignment {
    pub fn new(x: &Variable, y: &Variable) -> TapeResult<Self> {
        check_same_dim(x, y)?;
        Ok(Self {
            base: EquationBase::new(vec![x.clone()], vec![y.clone()], Vec::new())?,
        })
    }
}

impl Equation for Assignment {
    delegate_base!();

    fn name(&self) -> &'static str {
        "Assignment"
    }

    fn forward_solve(&self, deps: &[Field]) -> TapeResult<Vec<Field>> {
        Ok(vec![deps[1].clone()])
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
        Ok((dep_index == 1).then(|| adj_x[0].clone()))
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
        Ok(Box::new(Assignment::new(&tau_x, &tau_y)?))
    }
}
