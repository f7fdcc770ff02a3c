//! Run command implementation
//!
//! Records an explicit Euler time-stepping model, one block per step,
//!
//! ```text
//! u ← u + dt·(m − u³),    J = u·u
//! ```
//!
//! computes `dJ/dm` with the configured checkpointing schedule and checks it
//! against a central finite difference in a random direction.

use serde::Serialize;
use std::time::Instant;
use tape_adjoint::equations::{Assignment, DotProduct, LinearCombination, Pointwise, PointwiseOp};
use tape_adjoint::verify::{finite_difference, random_direction, DIRECTION_SEED};
use tape_adjoint::{EquationManager, ManagerInfo};
use tape_checkpoint::{CheckpointConfig, CheckpointMode};
use tape_core::{Field, FunctionSpace, TapeResult, Variable, Workspace};
use tracing::{info, warn};

use crate::{CliError, Result};

/// Relative tolerance between the adjoint and finite-difference estimates.
const TOLERANCE: f64 = 1e-5;

/// Parameters of the demo model.
#[derive(Clone, Copy, Debug)]
pub struct DemoParams {
    pub steps: usize,
    pub dim: usize,
    pub dt: f64,
}

impl Default for DemoParams {
    fn default() -> Self {
        Self {
            steps: 20,
            dim: 4,
            dt: 0.05,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DemoOutcome {
    pub functional: f64,
    pub gradient: Vec<f64>,
    /// `dJ/dm · dm` from the adjoint
    pub directional: f64,
    pub finite_difference: f64,
    pub relative_error: f64,
    pub elapsed_ms: f64,
    pub manager: ManagerInfo,
}

struct Model {
    m: Variable,
    j: Variable,
}

fn record(
    manager: &mut EquationManager,
    ws: &mut Workspace,
    m_value: &Field,
    params: DemoParams,
) -> TapeResult<Model> {
    let space = m_value.space();
    let m = Variable::new(space, "m");
    let u = Variable::new(space, "u");
    let c = Variable::new(space, "c");
    let w = Variable::new(space, "w");
    let j = Variable::new(&FunctionSpace::scalar(), "J");
    ws.set(&m, m_value.clone())?;
    ws.set(&u, Field::constant(space, 0.5))?;

    for step in 0..params.steps {
        if step > 0 {
            manager.new_block()?;
        }
        manager.solve(Box::new(Pointwise::new(&c, &u, PointwiseOp::Cube)?), ws)?;
        let terms = vec![
            (1.0, u.clone()),
            (-params.dt, c.clone()),
            (params.dt, m.clone()),
        ];
        manager.solve(Box::new(LinearCombination::new(&w, terms)?), ws)?;
        manager.solve(Box::new(Assignment::new(&u, &w)?), ws)?;
    }
    manager.solve(Box::new(DotProduct::new(&j, &u, &u)?), ws)?;
    Ok(Model { m, j })
}

/// `J(m)` without recording.
fn functional(m_value: &Field, params: DemoParams) -> TapeResult<f64> {
    let mut manager = EquationManager::new();
    manager.stop(true, true);
    let mut ws = Workspace::new();
    let model = record(&mut manager, &mut ws, m_value, params)?;
    Ok(ws.get(&model.j)?.values()[0])
}

/// Number of time steps: the binomial schedule fixes it to `total_blocks`.
pub fn resolve_steps(config: &CheckpointConfig, requested: usize) -> usize {
    match (config.mode, config.total_blocks) {
        (CheckpointMode::Binomial, Some(total)) => {
            if total != requested {
                warn!(
                    requested,
                    total_blocks = total,
                    "binomial schedule fixes the number of steps"
                );
            }
            total
        }
        _ => requested,
    }
}

/// Runs the demo and returns its outcome.
pub fn execute(config: CheckpointConfig, params: DemoParams) -> Result<DemoOutcome> {
    if params.steps == 0 || params.dim == 0 {
        return Err(CliError::InvalidArgument(
            "--steps and --dim must be at least 1".to_string(),
        ));
    }
    let space = FunctionSpace::new("state", params.dim);
    let m_value = Field::from_values(
        &space,
        (0..params.dim).map(|i| 1.0 + 0.1 * i as f64).collect(),
    )?;

    let start = Instant::now();
    let mut manager = EquationManager::with_config(config)?;
    let mut ws = Workspace::new();
    let model = record(&mut manager, &mut ws, &m_value, params)?;
    let value = ws.get(&model.j)?.values()[0];
    let dj = manager.compute_gradient(&[model.j], &[model.m])?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;
    let gradient = &dj[0][0];

    let dm = random_direction(&space, DIRECTION_SEED);
    let directional = gradient.dot(&dm)?;
    let fd = finite_difference(|m| functional(m, params), &m_value, &dm, 1e-6)?;
    let relative_error = (directional - fd).abs() / fd.abs().max(f64::MIN_POSITIVE);

    Ok(DemoOutcome {
        functional: value,
        gradient: gradient.values().to_vec(),
        directional,
        finite_difference: fd,
        relative_error,
        elapsed_ms,
        manager: manager.info(),
    })
}

/// Run the run command
pub fn run(config: CheckpointConfig, params: DemoParams, json: bool) -> Result<()> {
    let params = DemoParams {
        steps: resolve_steps(&config, params.steps),
        ..params
    };
    info!(
        mode = %config.mode,
        steps = params.steps,
        dim = params.dim,
        dt = params.dt,
        "Running time-stepping demo"
    );
    let outcome = execute(config, params)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        let stats = &outcome.manager.stats;
        println!("Mode:                {}", outcome.manager.mode);
        println!("Blocks:              {}", outcome.manager.blocks);
        println!("Equations:           {}", outcome.manager.equations);
        println!("J:                   {:.12}", outcome.functional);
        println!("dJ/dm:               {:?}", outcome.gradient);
        println!("Adjoint dJ/dm . dm:  {:.12e}", outcome.directional);
        println!("Finite difference:   {:.12e}", outcome.finite_difference);
        println!("Relative error:      {:.3e}", outcome.relative_error);
        println!("Replayed blocks:     {}", stats.replayed_blocks);
        println!("Replayed equations:  {}", stats.replayed_equations);
        println!(
            "Snapshots:           {} saved, {} loaded, {} deleted",
            stats.snapshots_saved, stats.snapshots_loaded, stats.snapshots_deleted
        );
        println!("Elapsed:             {:.3} ms", outcome.elapsed_ms);
    }

    if outcome.relative_error > TOLERANCE {
        return Err(CliError::Verification(format!(
            "adjoint {:.6e} and finite difference {:.6e} differ by {:.3e}",
            outcome.directional, outcome.finite_difference, outcome.relative_error
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tape_checkpoint::schedule::extra_steps;

    fn small() -> DemoParams {
        DemoParams {
            steps: 8,
            dim: 3,
            dt: 0.1,
        }
    }

    #[test]
    fn test_memory_demo_agrees_with_finite_difference() {
        let outcome = execute(CheckpointConfig::memory(), small()).unwrap();
        assert!(outcome.relative_error < TOLERANCE, "{:?}", outcome);
        assert_eq!(outcome.manager.blocks, 8);
        assert_eq!(outcome.manager.stats.replayed_blocks, 0);
    }

    #[test]
    fn test_binomial_demo_matches_memory() {
        let memory = execute(CheckpointConfig::memory(), small()).unwrap();
        let binomial = execute(CheckpointConfig::binomial(8, 2, 0), small()).unwrap();
        assert_eq!(memory.gradient, binomial.gradient);
        assert_eq!(
            Some(binomial.manager.stats.replayed_blocks as u64),
            extra_steps(8, 2)
        );
    }

    #[test]
    fn test_periodic_demo_matches_memory() {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckpointConfig::periodic(3).with_tier_path(dir.path());
        let memory = execute(CheckpointConfig::memory(), small()).unwrap();
        let periodic = execute(config, small()).unwrap();
        assert_eq!(memory.gradient, periodic.gradient);
        assert_eq!(periodic.manager.slow_snapshots, 3);
    }

    #[test]
    fn test_binomial_fixes_step_count() {
        let config = CheckpointConfig::binomial(12, 2, 0);
        assert_eq!(resolve_steps(&config, 20), 12);
        assert_eq!(resolve_steps(&CheckpointConfig::memory(), 20), 20);
    }
}
