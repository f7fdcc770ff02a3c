use super::{check_same_dim, zero_tangent, ProductSum};
use tape_core::{Equation, EquationBase, Field, TangentLinearMap, TapeError, TapeResult, Variable};

/// The pairs `(τy, z)` and `(y, τz)` whose products sum to the tangent of
/// `y ⊙ z`, omitting factors without a tangent.
fn tangent_pairs(
    deps: &[Variable],
    m: &[Variable],
    dm: &[Variable],
    tlm_map: &TangentLinearMap,
) -> Vec<(Variable, Variable)> {
    let (y, z) = (&deps[1], &deps[2]);
    let mut pairs = Vec::with_capacity(2);
    if let Some(tau_y) = tlm_map.tangent(y, m, dm) {
        pairs.push((tau_y, z.clone()));
    }
    if let Some(tau_z) = tlm_map.tangent(z, m, dm) {
        pairs.push((y.clone(), tau_z));
    }
    pairs
}

/// `x = y ⊙ z` component-wise.
#[derive(Debug)]
pub struct Product {
    base: EquationBase,
}

impl Product {
    pub fn new(x: &Variable, y: &Variable, z: &Variable) -> TapeResult<Self> {
        check_same_dim(x, y)?;
        check_same_dim(x, z)?;
        Ok(Self {
            base: EquationBase::new(vec![x.clone()], vec![y.clone(), z.clone()], vec![1, 2])?,
        })
    }
}

impl Equation for Product {
    delegate_base!();

    fn name(&self) -> &'static str {
        "Product"
    }

    fn forward_solve(&self, deps: &[Field]) -> TapeResult<Vec<Field>> {
        Ok(vec![deps[1].zip_map(&deps[2], |y, z| y * z)?])
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
        let other = match dep_index {
            1 => &nl_deps[1],
            2 => &nl_deps[0],
            _ => return Ok(None),
        };
        adj_x[0].zip_map(other, |a, v| a * v).map(Some)
    }

    fn tangent_linear(
        &self,
        m: &[Variable],
        dm: &[Variable],
        tlm_map: &mut TangentLinearMap,
    ) -> TapeResult<Box<dyn Equation>> {
        let deps = self.base.dependencies();
        let pairs = tangent_pairs(deps, m, dm, tlm_map);
        if pairs.is_empty() {
            return zero_tangent(&deps[0], tlm_map);
        }
        let tau_x = tlm_map.get_or_create(&deps[0]);
        Ok(Box::new(ProductSum::new(&tau_x, pairs)?))
    }
}

/// `x = y · z`, with `x` scalar.
#[derive(Debug)]
pub struct DotProduct {
    base: EquationBase,
}

impl DotProduct {
    pub fn new(x: &Variable, y: &Variable, z: &Variable) -> TapeResult<Self> {
        if x.space().dim() != 1 {
            return Err(TapeError::InvalidParameter(format!(
                "dot product output {} must be scalar",
                x
            )));
        }
        check_same_dim(y, z)?;
        Ok(Self {
            base: EquationBase::new(vec![x.clone()], vec![y.clone(), z.clone()], vec![1, 2])?,
        })
    }
}

impl Equation for DotProduct {
    delegate_base!();

    fn name(&self) -> &'static str {
        "DotProduct"
    }

    fn forward_solve(&self, deps: &[Field]) -> TapeResult<Vec<Field>> {
        let value = deps[1].dot(&deps[2])?;
        Ok(vec![Field::constant(self.base.outputs()[0].space(), value)])
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
        let mut contribution = match dep_index {
            1 => nl_deps[1].clone(),
            2 => nl_deps[0].clone(),
            _ => return Ok(None),
        };
        contribution.scale(adj_x[0].sum());
        Ok(Some(contribution))
    }

    fn tangent_linear(
        &self,
        m: &[Variable],
        dm: &[Variable],
        tlm_map: &mut TangentLinearMap,
    ) -> TapeResult<Box<dyn Equation>> {
        let deps = self.base.dependencies();
        let pairs = tangent_pairs(deps, m, dm, tlm_map);
        if pairs.is_empty() {
            return zero_tangent(&deps[0], tlm_map);
        }
        let tau_x = tlm_map.get_or_create(&deps[0]);
        Ok(Box::new(ProductSum::dot(&tau_x, pairs)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tape_core::FunctionSpace;

    #[test]
    fn test_dot_product_routes() {
        let s3 = FunctionSpace::new("R3", 3);
        let r = FunctionSpace::scalar();
        let j = Variable::new(&r, "J");
        let u = Variable::new(&s3, "u");
        let v = Variable::new(&s3, "v");
        let eq = DotProduct::new(&j, &u, &v).unwrap();

        let uv = Field::from_values(&s3, vec![1.0, 2.0, 3.0]).unwrap();
        let vv = Field::from_values(&s3, vec![4.0, 5.0, 6.0]).unwrap();
        let out = eq
            .forward_solve(&[Field::zeros(&r), uv.clone(), vv.clone()])
            .unwrap();
        assert_eq!(out[0].values(), &[32.0]);

        let adj = vec![Field::constant(&r, 2.0)];
        let nl = vec![uv, vv];
        assert_eq!(eq.partial_route(1, &nl, &adj).unwrap().unwrap().values(), &[8.0, 10.0, 12.0]);
        assert_eq!(eq.partial_route(2, &nl, &adj).unwrap().unwrap().values(), &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_dot_product_tangent_of_square_norm() {
        let s3 = FunctionSpace::new("R3", 3);
        let r = FunctionSpace::scalar();
        let j = Variable::new(&r, "J");
        let u = Variable::new(&s3, "u");
        let du = Variable::new(&s3, "du");
        let eq = DotProduct::new(&j, &u, &u).unwrap();

        let mut map = TangentLinearMap::for_model(&[u.clone()], &[du.clone()]);
        let tlm = eq.tangent_linear(&[u.clone()], &[du.clone()], &mut map).unwrap();
        assert_eq!(tlm.name(), "ProductSum");
        assert_eq!(tlm.dependencies()[1..], [du.clone(), u.clone(), u, du]);

        let uv = Field::from_values(&s3, vec![1.0, 2.0, 3.0]).unwrap();
        let duv = Field::from_values(&s3, vec![1.0, 0.0, -1.0]).unwrap();
        let out = tlm
            .forward_solve(&[Field::zeros(&r), duv.clone(), uv.clone(), uv, duv])
            .unwrap();
        // d(u·u) = 2 u·du
        assert_eq!(out[0].values(), &[-4.0]);
    }

    #[test]
    fn test_dot_product_requires_scalar_output() {
        let s3 = FunctionSpace::new("R3", 3);
        let x = Variable::new(&s3, "x");
        let u = Variable::new(&s3, "u");
        assert!(DotProduct::new(&x, &u, &u).is_err());
    }
}
