//! Pseudo-equations framing the reverse sweep.
//!
//! The sweep runs over the recorded blocks plus two pseudo-blocks: block 0
//! holds a [`ControlsMarker`] whose outputs are the controls, and the last
//! block holds one [`FunctionalMarker`] per requested output. Neither is
//! ever replayed.

use std::collections::HashMap;
use tape_core::{Equation, EquationBase, EquationId, Field, TapeResult, VarId, Variable};

/// `controls = inputs`. Its adjoint solution is the derivative.
#[derive(Debug)]
pub struct ControlsMarker {
    base: EquationBase,
}

impl ControlsMarker {
    pub fn new(controls: &[Variable]) -> TapeResult<Self> {
        Ok(Self {
            base: EquationBase::new(controls.to_vec(), Vec::new(), Vec::new())?,
        })
    }
}

impl Equation for ControlsMarker {
    fn id(&self) -> EquationId {
        self.base.id()
    }

    fn name(&self) -> &'static str {
        "ControlsMarker"
    }

    fn outputs(&self) -> &[Variable] {
        self.base.outputs()
    }

    fn dependencies(&self) -> &[Variable] {
        self.base.dependencies()
    }

    fn nonlinear_dependency_indices(&self) -> &[usize] {
        self.base.nonlinear_dependency_indices()
    }

    fn forward_solve(&self, deps: &[Field]) -> TapeResult<Vec<Field>> {
        Ok(deps[..self.base.outputs().len()].to_vec())
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

    fn replace(&mut self, mapping: &HashMap<VarId, Variable>) {
        self.base.replace(mapping)
    }
}

/// `marker = J`, seeded with a unit right-hand side.
#[derive(Debug)]
pub struct FunctionalMarker {
    base: EquationBase,
}

impl FunctionalMarker {
    pub fn new(functional: &Variable) -> TapeResult<Self> {
        let marker = Variable::new(functional.space(), &format!("{}_marker", functional.name()));
        Ok(Self {
            base: EquationBase::new(vec![marker], vec![functional.clone()], Vec::new())?,
        })
    }

    pub fn functional(&self) -> &Variable {
        &self.base.dependencies()[1]
    }

    /// Initial adjoint right-hand side.
    pub fn seed(&self) -> Field {
        Field::constant(self.functional().space(), 1.0)
    }
}

impl Equation for FunctionalMarker {
    fn id(&self) -> EquationId {
        self.base.id()
    }

    fn name(&self) -> &'static str {
        "FunctionalMarker"
    }

    fn outputs(&self) -> &[Variable] {
        self.base.outputs()
    }

    fn dependencies(&self) -> &[Variable] {
        self.base.dependencies()
    }

    fn nonlinear_dependency_indices(&self) -> &[usize] {
        self.base.nonlinear_dependency_indices()
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

    fn replace(&mut self, mapping: &HashMap<VarId, Variable>) {
        self.base.replace(mapping)
    }
}
