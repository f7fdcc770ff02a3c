//! Reverse sweep behaviour independent of the checkpointing mode: chain
//! rule, pruning of equations that cannot influence an output, empty tapes
//! and the adjoint event callback.

use approx::assert_relative_eq;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tape_adjoint::equations::{Assignment, DotProduct, LinearCombination, Pointwise, PointwiseOp};
use tape_adjoint::verify::{finite_difference, taylor_test};
use tape_adjoint::{AnnotationState, EquationManager};
use tape_checkpoint::CheckpointConfig;
use tape_core::{
    Equation, EquationId, Field, FunctionSpace, TapeResult, VarId, Variable, Workspace,
};

/// Counts calls to the wrapped equation's adjoint.
#[derive(Debug)]
struct Counted {
    inner: Box<dyn Equation>,
    calls: Arc<AtomicUsize>,
}

impl Counted {
    fn new(inner: impl Equation + 'static, calls: &Arc<AtomicUsize>) -> Box<Self> {
        Box::new(Self {
            inner: Box::new(inner),
            calls: Arc::clone(calls),
        })
    }
}

impl Equation for Counted {
    fn id(&self) -> EquationId {
        self.inner.id()
    }
    fn name(&self) -> &'static str {
        self.inner.name()
    }
    fn outputs(&self) -> &[Variable] {
        self.inner.outputs()
    }
    fn dependencies(&self) -> &[Variable] {
        self.inner.dependencies()
    }
    fn nonlinear_dependency_indices(&self) -> &[usize] {
        self.inner.nonlinear_dependency_indices()
    }
    fn forward_solve(&self, deps: &[Field]) -> TapeResult<Vec<Field>> {
        self.inner.forward_solve(deps)
    }
    fn adjoint(&self, nl_deps: &[Field], rhs: &[Field]) -> TapeResult<Option<Vec<Field>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.adjoint(nl_deps, rhs)
    }
    fn partial_route(
        &self,
        dep_index: usize,
        nl_deps: &[Field],
        adj_x: &[Field],
    ) -> TapeResult<Option<Field>> {
        self.inner.partial_route(dep_index, nl_deps, adj_x)
    }
    fn replace(&mut self, mapping: &HashMap<VarId, Variable>) {
        self.inner.replace(mapping)
    }
}

fn chain_configs() -> Vec<CheckpointConfig> {
    vec![
        CheckpointConfig::memory(),
        CheckpointConfig::binomial(3, 1, 0),
        CheckpointConfig::binomial(3, 2, 0),
    ]
}

/// `d = tanh(exp(sin(a)))` with one block per equation.
fn record_chain(
    manager: &mut EquationManager,
    ws: &mut Workspace,
    a: &Variable,
) -> TapeResult<Variable> {
    let space = a.space();
    let b = Variable::new(space, "b");
    let c = Variable::new(space, "c");
    let d = Variable::new(space, "d");
    manager.solve(Box::new(Pointwise::new(&b, a, PointwiseOp::Sin)?), ws)?;
    manager.new_block()?;
    manager.solve(Box::new(Pointwise::new(&c, &b, PointwiseOp::Exp)?), ws)?;
    manager.new_block()?;
    manager.solve(Box::new(Pointwise::new(&d, &c, PointwiseOp::Tanh)?), ws)?;
    Ok(d)
}

fn chain_value(a_value: &Field) -> TapeResult<f64> {
    let mut manager = EquationManager::new();
    manager.stop(true, true);
    let a = Variable::new(a_value.space(), "a");
    let mut ws = Workspace::new();
    ws.set(&a, a_value.clone())?;
    let d = record_chain(&mut manager, &mut ws, &a)?;
    Ok(ws.get(&d)?.values()[0])
}

// ============================================================================
// Chain rule
// ============================================================================

#[test]
fn test_chain_matches_analytic_and_finite_difference() {
    let space = FunctionSpace::scalar();
    let a0 = 0.4_f64;
    let b0 = a0.sin();
    let c0 = b0.exp();
    let expected = (1.0 - c0.tanh().powi(2)) * c0 * a0.cos();

    let m = Field::constant(&space, a0);
    let dm = Field::constant(&space, 1.0);
    let fd = finite_difference(chain_value, &m, &dm, 1e-6).unwrap();
    assert_relative_eq!(fd, expected, max_relative = 1e-7);

    for config in chain_configs() {
        let mut manager = EquationManager::with_config(config.clone()).unwrap();
        let a = Variable::new(&space, "a");
        let mut ws = Workspace::new();
        ws.set(&a, m.clone()).unwrap();
        let d = record_chain(&mut manager, &mut ws, &a).unwrap();

        let dj = manager.compute_gradient(&[d], &[a]).unwrap();
        assert_relative_eq!(dj[0][0].values()[0], expected, max_relative = 1e-12);
        assert_eq!(manager.tape().n_blocks(), 3, "{:?}", config.mode);
    }
}

#[test]
fn test_taylor_remainder_converges_at_second_order() {
    let space = FunctionSpace::scalar();
    let m = Field::constant(&space, 0.4);

    let mut manager = EquationManager::new();
    let a = Variable::new(&space, "a");
    let mut ws = Workspace::new();
    ws.set(&a, m.clone()).unwrap();
    let d = record_chain(&mut manager, &mut ws, &a).unwrap();
    let j0 = ws.get(&d).unwrap().values()[0];
    let dj = manager.compute_gradient(&[d], &[a]).unwrap();

    let report = taylor_test(chain_value, &m, j0, &dj[0][0], None, 1e-2, 5).unwrap();
    assert!(report.min_order() > 1.9, "{:?}", report);
}

#[test]
fn test_multiple_outputs_and_controls() {
    let space = FunctionSpace::new("v", 3);
    let x = Variable::new(&space, "x");
    let y = Variable::new(&space, "y");
    let s = Variable::new(&space, "s");
    let scalar = FunctionSpace::scalar();
    let j1 = Variable::new(&scalar, "j1");
    let j2 = Variable::new(&scalar, "j2");

    let mut manager = EquationManager::new();
    let mut ws = Workspace::new();
    ws.set(&x, Field::from_values(&space, vec![1.0, 2.0, 3.0]).unwrap()).unwrap();
    ws.set(&y, Field::from_values(&space, vec![-1.0, 0.5, 2.0]).unwrap()).unwrap();

    manager
        .solve(
            Box::new(LinearCombination::new(&s, vec![(2.0, x.clone()), (-1.0, y.clone())]).unwrap()),
            &mut ws,
        )
        .unwrap();
    manager
        .solve(Box::new(DotProduct::new(&j1, &s, &x).unwrap()), &mut ws)
        .unwrap();
    manager
        .solve(Box::new(DotProduct::new(&j2, &y, &y).unwrap()), &mut ws)
        .unwrap();

    let dj = manager
        .compute_gradient(&[j1, j2], &[x.clone(), y.clone()])
        .unwrap();
    // j1 = (2x - y)·x: dj1/dx = 4x - y, dj1/dy = -x
    assert_eq!(dj[0][0].values(), &[5.0, 7.5, 10.0]);
    assert_eq!(dj[0][1].values(), &[-1.0, -2.0, -3.0]);
    // j2 = y·y
    assert_eq!(dj[1][0].values(), &[0.0, 0.0, 0.0]);
    assert_eq!(dj[1][1].values(), &[-2.0, 1.0, 4.0]);
}

// ============================================================================
// Pruning and empty tapes
// ============================================================================

#[test]
fn test_equations_outside_influencing_suffix_are_pruned() {
    let space = FunctionSpace::scalar();
    let a = Variable::new(&space, "a");
    let b = Variable::new(&space, "b");
    let unused = Variable::new(&space, "unused");
    let j = Variable::new(&space, "j");
    let calls = Arc::new(AtomicUsize::new(0));
    let pruned_calls = Arc::new(AtomicUsize::new(0));

    let mut manager = EquationManager::new();
    let mut ws = Workspace::new();
    ws.set(&a, Field::constant(&space, 1.5)).unwrap();

    manager
        .solve(Counted::new(Assignment::new(&b, &a).unwrap(), &calls), &mut ws)
        .unwrap();
    // Reads b after b's last use by the functional's chain.
    manager
        .solve(
            Counted::new(Pointwise::new(&unused, &b, PointwiseOp::Exp).unwrap(), &pruned_calls),
            &mut ws,
        )
        .unwrap();
    manager
        .solve(
            Counted::new(Pointwise::new(&j, &b, PointwiseOp::Square).unwrap(), &calls),
            &mut ws,
        )
        .unwrap();

    let mut events = Vec::new();
    let dj = manager
        .compute_gradient_with(&[j], &[a], |event| {
            events.push((event.equation, event.name, event.adj_x.is_some()));
        })
        .unwrap();

    assert_eq!(dj[0][0].values(), &[3.0]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(pruned_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        events,
        vec![(2, "Pointwise", true), (1, "Pointwise", false), (0, "Assignment", true)]
    );
}

#[test]
fn test_empty_tape_gives_zero_derivative() {
    let space = FunctionSpace::new("v", 2);
    let m = Variable::new(&space, "m");
    let j = Variable::new(&FunctionSpace::scalar(), "j");

    let mut manager = EquationManager::new();
    let mut events = 0;
    let dj = manager
        .compute_gradient_with(&[j], &[m], |_| events += 1)
        .unwrap();

    assert_eq!(dj.len(), 1);
    assert_eq!(dj[0][0].values(), &[0.0, 0.0]);
    assert_eq!(events, 0);
    assert_eq!(manager.annotation_state(), AnnotationState::Final);
}

#[test]
fn test_output_independent_of_controls_gets_zero() {
    let space = FunctionSpace::scalar();
    let a = Variable::new(&space, "a");
    let b = Variable::new(&space, "b");
    let calls = Arc::new(AtomicUsize::new(0));

    let mut manager = EquationManager::new();
    let mut ws = Workspace::new();
    ws.set(&a, Field::constant(&space, 2.0)).unwrap();
    ws.set(&b, Field::constant(&space, 5.0)).unwrap();
    let c = Variable::new(&space, "c");
    manager
        .solve(
            Counted::new(Pointwise::new(&c, &b, PointwiseOp::Cube).unwrap(), &calls),
            &mut ws,
        )
        .unwrap();

    let dj = manager.compute_gradient(&[c], &[a]).unwrap();
    assert_eq!(dj[0][0].values(), &[0.0]);
    // No control reaches c, so its equation is never active.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_control_as_output() {
    let space = FunctionSpace::scalar();
    let a = Variable::new(&space, "a");
    let mut manager = EquationManager::new();
    let dj = manager.compute_gradient(&[a.clone()], &[a]).unwrap();
    assert_eq!(dj[0][0].values(), &[1.0]);
}

// ============================================================================
// Recording rules
// ============================================================================

#[test]
fn test_overwritten_variable_routes_to_latest_writer() {
    // u = a; u = 2u (via w); j = u²: dj/da = 8a
    let space = FunctionSpace::scalar();
    let a = Variable::new(&space, "a");
    let u = Variable::new(&space, "u");
    let w = Variable::new(&space, "w");
    let j = Variable::new(&space, "j");

    let mut manager = EquationManager::new();
    let mut ws = Workspace::new();
    ws.set(&a, Field::constant(&space, 1.25)).unwrap();
    manager
        .solve(Box::new(Assignment::new(&u, &a).unwrap()), &mut ws)
        .unwrap();
    manager
        .solve(
            Box::new(LinearCombination::new(&w, vec![(2.0, u.clone())]).unwrap()),
            &mut ws,
        )
        .unwrap();
    manager
        .solve(Box::new(Assignment::new(&u, &w).unwrap()), &mut ws)
        .unwrap();
    manager
        .solve(Box::new(Pointwise::new(&j, &u, PointwiseOp::Square).unwrap()), &mut ws)
        .unwrap();

    let dj = manager.compute_gradient(&[j], &[a]).unwrap();
    assert_eq!(dj[0][0].values(), &[10.0]);
}

#[test]
fn test_stopped_section_is_not_differentiated() {
    let space = FunctionSpace::scalar();
    let a = Variable::new(&space, "a");
    let b = Variable::new(&space, "b");
    let j = Variable::new(&space, "j");

    let mut manager = EquationManager::new();
    let mut ws = Workspace::new();
    ws.set(&a, Field::constant(&space, 3.0)).unwrap();

    let previous = manager.stop(true, false);
    assert_eq!(previous, (true, true));
    manager
        .solve(Box::new(Assignment::new(&b, &a).unwrap()), &mut ws)
        .unwrap();
    manager.start(true, false);
    manager
        .solve(Box::new(Pointwise::new(&j, &b, PointwiseOp::Square).unwrap()), &mut ws)
        .unwrap();

    // b was recorded as an initial condition, not as a function of a.
    let dj = manager.compute_gradient(&[j.clone()], &[a, b]).unwrap();
    assert_eq!(dj[0][0].values(), &[0.0]);
    assert_eq!(dj[0][1].values(), &[6.0]);
    assert_eq!(ws.get(&j).unwrap().values(), &[9.0]);
}
