//! Derivative verification.
//!
//! [`taylor_test`] checks a gradient against the Taylor remainder: for a
//! correct gradient `dJ`, `|J(m + ε·dm) − J(m)|` converges at first order
//! and `|J(m + ε·dm) − J(m) − ε·dJ·dm|` at second order as ε halves.
//! [`finite_difference`] gives a central-difference directional derivative.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use tape_core::{Field, FunctionSpace, TapeError, TapeResult};

/// Seed of the default perturbation direction.
pub const DIRECTION_SEED: u64 = 2718;

/// Perturbation direction with components uniform in `[-1, 1)`.
pub fn random_direction(space: &Arc<FunctionSpace>, seed: u64) -> Field {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut dm = Field::zeros(space);
    for v in dm.values_mut() {
        *v = rng.gen_range(-1.0..1.0);
    }
    dm
}

/// Central-difference estimate of the derivative of `forward` at `m` in
/// direction `dm`.
pub fn finite_difference<F>(mut forward: F, m: &Field, dm: &Field, eps: f64) -> TapeResult<f64>
where
    F: FnMut(&Field) -> TapeResult<f64>,
{
    if !(eps > 0.0) {
        return Err(TapeError::InvalidParameter(format!(
            "finite-difference step must be positive, got {}",
            eps
        )));
    }
    let mut plus = m.deep_copy();
    plus.axpy(eps, dm)?;
    let mut minus = m.deep_copy();
    minus.axpy(-eps, dm)?;
    Ok((forward(&plus)? - forward(&minus)?) / (2.0 * eps))
}

/// Remainders and observed convergence orders of a Taylor test.
#[derive(Clone, Debug, Serialize)]
pub struct TaylorReport {
    pub epsilons: Vec<f64>,
    /// `|J(m + ε·dm) − J(m)|`
    pub no_adjoint: Vec<f64>,
    /// `|J(m + ε·dm) − J(m) − ε·dJ·dm|`
    pub with_adjoint: Vec<f64>,
    pub orders_no_adjoint: Vec<f64>,
    pub orders_with_adjoint: Vec<f64>,
}

impl TaylorReport {
    /// Smallest observed order of the adjoint-corrected remainder.
    pub fn min_order(&self) -> f64 {
        self.orders_with_adjoint
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }
}

fn orders(errors: &[f64]) -> Vec<f64> {
    errors
        .windows(2)
        .map(|w| {
            if w[1] == 0.0 {
                f64::INFINITY
            } else {
                (w[0] / w[1]).log2()
            }
        })
        .collect()
}

/// Taylor remainder test of gradient `dj` of `forward` at `m`.
///
/// `j0` is `J(m)`. Perturbations are `ε_i = seed · 2^-i · max(1, ‖m‖∞)` for
/// `i < levels`; `dm` defaults to [`random_direction`] with
/// [`DIRECTION_SEED`].
///
/// # Errors
///
/// [`TapeError::InvalidParameter`] for fewer than two levels or a
/// non-positive seed; errors of `forward` are propagated.
pub fn taylor_test<F>(
    mut forward: F,
    m: &Field,
    j0: f64,
    dj: &Field,
    dm: Option<&Field>,
    seed: f64,
    levels: usize,
) -> TapeResult<TaylorReport>
where
    F: FnMut(&Field) -> TapeResult<f64>,
{
    if levels < 2 || !(seed > 0.0) {
        return Err(TapeError::InvalidParameter(format!(
            "Taylor test needs at least two levels and a positive seed (levels {}, seed {})",
            levels, seed
        )));
    }
    let dm = match dm {
        Some(dm) => dm.clone(),
        None => random_direction(m.space(), DIRECTION_SEED),
    };
    let dj_dm = dj.dot(&dm)?;
    let scale = seed * m.linf_norm().max(1.0);

    let mut report = TaylorReport {
        epsilons: Vec::with_capacity(levels),
        no_adjoint: Vec::with_capacity(levels),
        with_adjoint: Vec::with_capacity(levels),
        orders_no_adjoint: Vec::new(),
        orders_with_adjoint: Vec::new(),
    };
    for i in 0..levels {
        let eps = scale * 0.5_f64.powi(i as i32);
        let mut perturbed = m.deep_copy();
        perturbed.axpy(eps, &dm)?;
        let j = forward(&perturbed)?;
        report.epsilons.push(eps);
        report.no_adjoint.push((j - j0).abs());
        report.with_adjoint.push((j - j0 - eps * dj_dm).abs());
    }
    report.orders_no_adjoint = orders(&report.no_adjoint);
    report.orders_with_adjoint = orders(&report.with_adjoint);

    tracing::debug!(
        no_adjoint = ?report.orders_no_adjoint,
        with_adjoint = ?report.orders_with_adjoint,
        "Taylor remainder orders"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sum_sin(m: &Field) -> TapeResult<f64> {
        Ok(m.values().iter().map(|v| v.sin()).sum())
    }

    #[test]
    fn test_finite_difference_quadratic_is_exact() {
        let space = FunctionSpace::new("p", 2);
        let m = Field::from_values(&space, vec![1.0, -2.0]).unwrap();
        let dm = Field::from_values(&space, vec![0.5, 1.0]).unwrap();
        let d = finite_difference(|x| x.dot(x), &m, &dm, 1e-3).unwrap();
        // d/dε |m + ε dm|² = 2 m·dm
        assert_relative_eq!(d, 2.0 * (0.5 - 2.0), epsilon = 1e-9);
    }

    #[test]
    fn test_finite_difference_rejects_zero_step() {
        let space = FunctionSpace::scalar();
        let m = Field::zeros(&space);
        assert!(finite_difference(sum_sin, &m, &m, 0.0).is_err());
    }

    #[test]
    fn test_taylor_orders_for_correct_gradient() {
        let space = FunctionSpace::new("p", 3);
        let m = Field::from_values(&space, vec![0.3, -0.7, 1.1]).unwrap();
        let dj = m.map(f64::cos);
        let report = taylor_test(sum_sin, &m, sum_sin(&m).unwrap(), &dj, None, 1e-2, 5).unwrap();
        for order in &report.orders_no_adjoint {
            assert!((order - 1.0).abs() < 0.1, "{:?}", report);
        }
        assert!(report.min_order() > 1.9, "{:?}", report);
    }

    #[test]
    fn test_taylor_detects_wrong_gradient() {
        let space = FunctionSpace::new("p", 3);
        let m = Field::from_values(&space, vec![0.3, -0.7, 1.1]).unwrap();
        let wrong = m.map(f64::sin);
        let report = taylor_test(sum_sin, &m, sum_sin(&m).unwrap(), &wrong, None, 1e-2, 4).unwrap();
        assert!(report.min_order() < 1.2, "{:?}", report);
    }

    #[test]
    fn test_random_direction_is_reproducible() {
        let space = FunctionSpace::new("p", 8);
        let a = random_direction(&space, 7);
        let b = random_direction(&space, 7);
        assert!(a.bitwise_eq(&b));
        assert!(a.values().iter().all(|v| (-1.0..1.0).contains(v)));
    }
}
