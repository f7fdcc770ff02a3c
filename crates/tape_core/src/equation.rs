//! The equation interface.
//!
//! An [`Equation`] is an opaque operation that writes its outputs from its
//! dependencies. The tape never looks inside: it only needs the dependency
//! lists, the forward solve (for replay) and the adjoint hooks (for the
//! reverse sweep).
//!
//! # Contract
//!
//! - `dependencies()` lists the outputs first, in the same order as
//!   `outputs()`, followed by the input dependencies.
//! - `nonlinear_dependency_indices()` indexes into `dependencies()` and names
//!   the values the adjoint needs. Only these are retained for replay.
//! - `forward_solve` receives one value per dependency (outputs carry their
//!   previous value or zero) and returns one value per output. It must be
//!   deterministic.
//! - `adjoint` solves the adjoint system for the outputs given the summed
//!   right-hand sides, one per output. Returning `None` means the adjoint
//!   solution is zero.
//! - `partial_route` returns the contribution to the adjoint right-hand side
//!   of dependency `dep_index`. The contribution is *added* to whatever
//!   other consumers route there.
//! - `tangent_linear` returns the equation that computes the tangents of the
//!   outputs from the tangents of the dependencies. It is only asked for
//!   when at least one dependency has a tangent.

use crate::error::{TapeError, TapeResult};
use crate::tangent::TangentLinearMap;
use crate::types::{EquationId, Field, VarId, Variable};
use std::collections::HashMap;
use std::fmt;

/// Operation recorded on the tape.
pub trait Equation: fmt::Debug {
    /// Unique id of this equation.
    fn id(&self) -> EquationId;

    /// Short type name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Variables written by this equation.
    fn outputs(&self) -> &[Variable];

    /// All dependencies, outputs first.
    fn dependencies(&self) -> &[Variable];

    /// Indices (into [`dependencies`](Self::dependencies)) of the values the
    /// adjoint needs.
    fn nonlinear_dependency_indices(&self) -> &[usize];

    /// The non-linear dependencies as handles.
    fn nonlinear_dependencies(&self) -> Vec<Variable> {
        let deps = self.dependencies();
        self.nonlinear_dependency_indices()
            .iter()
            .map(|&i| deps[i].clone())
            .collect()
    }

    /// Whether the forward solve reads the previous output values.
    fn has_initial_condition(&self) -> bool {
        false
    }

    /// Whether the adjoint solve uses an initial guess.
    fn has_adjoint_initial_condition(&self) -> bool {
        false
    }

    /// Computes the outputs from the dependency values.
    fn forward_solve(&self, deps: &[Field]) -> TapeResult<Vec<Field>>;

    /// Solves the adjoint system for the outputs.
    fn adjoint(&self, nl_deps: &[Field], rhs: &[Field]) -> TapeResult<Option<Vec<Field>>>;

    /// Contribution of the adjoint solution to the right-hand side of
    /// dependency `dep_index`.
    fn partial_route(
        &self,
        dep_index: usize,
        nl_deps: &[Field],
        adj_x: &[Field],
    ) -> TapeResult<Option<Field>>;

    /// Replaces dependency handles by the handles in `mapping`.
    fn replace(&mut self, mapping: &HashMap<VarId, Variable>);

    /// The tangent-linear equation for controls `m` in directions `dm`.
    ///
    /// Output tangents are taken from `tlm_map` with
    /// [`TangentLinearMap::get_or_create`]; dependency tangents with
    /// [`TangentLinearMap::tangent`]. When no input has a tangent the
    /// returned equation must zero the output tangents.
    ///
    /// # Errors
    ///
    /// [`TapeError::Equation`] by default: the equation has no
    /// tangent-linear counterpart.
    fn tangent_linear(
        &self,
        _m: &[Variable],
        _dm: &[Variable],
        _tlm_map: &mut TangentLinearMap,
    ) -> TapeResult<Box<dyn Equation>> {
        Err(TapeError::Equation(format!(
            "{} has no tangent-linear equation",
            self.name()
        )))
    }
}

/// Dependency bookkeeping shared by concrete equations.
///
/// Stores the combined dependency list (outputs first), the number of
/// outputs and the non-linear dependency indices, and validates the
/// structural rules every equation must satisfy.
#[derive(Clone, Debug)]
pub struct EquationBase {
    id: EquationId,
    deps: Vec<Variable>,
    n_outputs: usize,
    nl_indices: Vec<usize>,
}

impl EquationBase {
    /// Builds the bookkeeping for `outputs` and input `inputs`.
    ///
    /// `nl_indices` index into the combined list `outputs ++ inputs`.
    ///
    /// # Errors
    ///
    /// [`TapeError::InvalidParameter`] if there are no outputs, an output is
    /// repeated, an output also appears among the inputs, or a non-linear
    /// index is out of range.
    pub fn new(
        outputs: Vec<Variable>,
        inputs: Vec<Variable>,
        nl_indices: Vec<usize>,
    ) -> TapeResult<Self> {
        if outputs.is_empty() {
            return Err(TapeError::InvalidParameter(
                "equation must have at least one output".to_string(),
            ));
        }
        for (i, x) in outputs.iter().enumerate() {
            if outputs[..i].contains(x) {
                return Err(TapeError::InvalidParameter(format!(
                    "duplicate output {}",
                    x
                )));
            }
            if inputs.contains(x) {
                return Err(TapeError::InvalidParameter(format!(
                    "output {} also appears as a dependency",
                    x
                )));
            }
        }
        let n_outputs = outputs.len();
        let mut deps = outputs;
        deps.extend(inputs);
        if let Some(&bad) = nl_indices.iter().find(|&&i| i >= deps.len()) {
            return Err(TapeError::InvalidParameter(format!(
                "non-linear dependency index {} out of range ({} dependencies)",
                bad,
                deps.len()
            )));
        }
        Ok(Self {
            id: EquationId::next(),
            deps,
            n_outputs,
            nl_indices,
        })
    }

    #[inline]
    pub fn id(&self) -> EquationId {
        self.id
    }

    #[inline]
    pub fn outputs(&self) -> &[Variable] {
        &self.deps[..self.n_outputs]
    }

    #[inline]
    pub fn dependencies(&self) -> &[Variable] {
        &self.deps
    }

    #[inline]
    pub fn nonlinear_dependency_indices(&self) -> &[usize] {
        &self.nl_indices
    }

    /// Position of dependency `dep_index` within the non-linear list.
    pub fn nonlinear_position(&self, dep_index: usize) -> Option<usize> {
        self.nl_indices.iter().position(|&i| i == dep_index)
    }

    pub fn replace(&mut self, mapping: &HashMap<VarId, Variable>) {
        for dep in &mut self.deps {
            if let Some(replacement) = mapping.get(&dep.id()) {
                *dep = replacement.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FunctionSpace;

    #[test]
    fn test_base_layout() {
        let space = FunctionSpace::new("R", 1);
        let x = Variable::new(&space, "x");
        let y = Variable::new(&space, "y");
        let z = Variable::new(&space, "z");
        let base = EquationBase::new(vec![x.clone()], vec![y.clone(), z.clone()], vec![2]).unwrap();

        assert_eq!(base.outputs(), &[x.clone()]);
        assert_eq!(base.dependencies(), &[x, y, z]);
        assert_eq!(base.nonlinear_position(2), Some(0));
        assert_eq!(base.nonlinear_position(1), None);
    }

    #[test]
    fn test_base_rejects_output_as_input() {
        let space = FunctionSpace::new("R", 1);
        let x = Variable::new(&space, "x");
        let err = EquationBase::new(vec![x.clone()], vec![x], vec![]).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_base_rejects_bad_nl_index() {
        let space = FunctionSpace::new("R", 1);
        let x = Variable::new(&space, "x");
        assert!(EquationBase::new(vec![x], vec![], vec![1]).is_err());
    }

    #[test]
    fn test_base_replace_swaps_handles() {
        let space = FunctionSpace::new("R", 1);
        let x = Variable::new(&space, "x");
        let y = Variable::new(&space, "y");
        let mut base = EquationBase::new(vec![x], vec![y.clone()], vec![1]).unwrap();

        let mut mapping = HashMap::new();
        mapping.insert(y.id(), y.placeholder());
        base.replace(&mapping);

        assert!(base.dependencies()[1].is_placeholder());
        assert!(!base.dependencies()[0].is_placeholder());
    }
}
