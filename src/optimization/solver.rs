//! Damped Gauss-Newton (Levenberg-Marquardt) least-squares routine.
//!
//! Both calibrators express their refinement as a [`LeastSquaresProblem`] and
//! hand it to [`solve`]. The routine owns the damping schedule, the
//! convergence tests and the degeneracy check; problems only provide
//! residuals, optionally an analytic Jacobian, and a `retract` hook that
//! brings parameters back onto their manifold after every accepted update.

use crate::error::{Result, StereoError};
use crate::geometry::condition_number;
use log::debug;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A nonlinear least-squares problem `min_x sum_i r_i(x)^2`.
pub trait LeastSquaresProblem: Sync {
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64>;

    /// Jacobian of the residual vector. The default uses central differences,
    /// evaluating the columns in parallel.
    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        numeric_jacobian(self, params)
    }

    /// Maps an updated parameter vector back onto the problem manifold.
    fn retract(&self, _params: &mut DVector<f64>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    pub max_iterations: usize,
    /// Relative parameter-update threshold.
    pub xtol: f64,
    /// Relative cost-decrease threshold.
    pub ftol: f64,
    /// Infinity-norm threshold on the gradient.
    pub gtol: f64,
    pub initial_lambda: f64,
    /// Column-scaled Jacobian condition number above which the problem is
    /// reported as degenerate.
    pub max_condition_number: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            max_iterations: 100,
            xtol: 1e-12,
            ftol: 1e-14,
            gtol: 1e-14,
            initial_lambda: 1e-3,
            max_condition_number: 1e10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    SmallUpdate,
    SmallCostDecrease,
    SmallGradient,
    ZeroResidual,
    /// No damped step decreased the cost any further.
    Stalled,
}

#[derive(Debug, Clone)]
pub struct SolverReport {
    pub params: DVector<f64>,
    pub iterations: usize,
    pub initial_cost: f64,
    /// Sum of squared residuals at `params`.
    pub final_cost: f64,
    pub termination: Termination,
}

impl SolverReport {
    /// Root-mean-square point error for residuals grouped in `(du, dv)` pairs.
    pub fn rms(&self, residual_count: usize) -> f64 {
        rms_from_cost(self.final_cost, residual_count)
    }
}

pub fn rms_from_cost(cost: f64, residual_count: usize) -> f64 {
    let points = (residual_count / 2).max(1);
    (cost / points as f64).sqrt()
}

/// Central-difference Jacobian.
pub fn numeric_jacobian<P: LeastSquaresProblem + ?Sized>(
    problem: &P,
    params: &DVector<f64>,
) -> DMatrix<f64> {
    let columns: Vec<DVector<f64>> = (0..params.len())
        .into_par_iter()
        .map(|j| {
            let step = 1e-6 * params[j].abs().max(1.0);
            let mut forward = params.clone();
            let mut backward = params.clone();
            forward[j] += step;
            backward[j] -= step;
            (problem.residuals(&forward) - problem.residuals(&backward)) / (2.0 * step)
        })
        .collect();
    DMatrix::from_columns(&columns)
}

/// Condition number of the Jacobian after scaling every column to unit norm.
///
/// A parameter the residuals do not depend on yields an infinite value.
pub fn scaled_condition_number(jacobian: &DMatrix<f64>) -> f64 {
    let mut scaled = jacobian.clone();
    for mut column in scaled.column_iter_mut() {
        let norm = column.norm();
        if norm <= f64::EPSILON {
            return f64::INFINITY;
        }
        column /= norm;
    }
    condition_number(&scaled)
}

/// Minimizes the problem starting from `initial`.
///
/// # Errors
///
/// * [`StereoError::DegenerateGeometry`] if the scaled Jacobian at the start
///   point is rank deficient or ill-conditioned, or the residuals are not finite.
/// * [`StereoError::ConvergenceFailure`] if the iteration cap is reached before
///   any convergence test passes; carries the last RMS point error.
pub fn solve<P: LeastSquaresProblem>(
    problem: &P,
    initial: DVector<f64>,
    options: &SolverOptions,
) -> Result<SolverReport> {
    let mut x = initial;
    problem.retract(&mut x);

    let mut residuals = problem.residuals(&x);
    let residual_count = residuals.len();
    let mut cost = residuals.norm_squared();
    if !cost.is_finite() {
        return Err(StereoError::DegenerateGeometry {
            reason: "residuals are not finite at the initial estimate".to_string(),
            condition_number: f64::INFINITY,
        });
    }
    let initial_cost = cost;

    let mut jacobian = problem.jacobian(&x);
    let condition = scaled_condition_number(&jacobian);
    if !(condition <= options.max_condition_number) {
        return Err(StereoError::DegenerateGeometry {
            reason: "normal equations are rank deficient".to_string(),
            condition_number: condition,
        });
    }

    let mut lambda = options.initial_lambda;
    let n = x.len();

    for iteration in 1..=options.max_iterations {
        if cost <= f64::EPSILON * f64::EPSILON * residual_count as f64 {
            return Ok(finish(x, iteration - 1, initial_cost, cost, Termination::ZeroResidual));
        }

        let jt = jacobian.transpose();
        let hessian = &jt * &jacobian;
        let gradient = &jt * &residuals;
        if gradient.amax() <= options.gtol {
            return Ok(finish(x, iteration - 1, initial_cost, cost, Termination::SmallGradient));
        }

        // inner loop: raise damping until a step decreases the cost
        loop {
            let mut damped = hessian.clone();
            for i in 0..n {
                damped[(i, i)] += lambda * hessian[(i, i)].max(1e-12);
            }

            let Some(chol) = damped.cholesky() else {
                lambda *= 10.0;
                if lambda > 1e16 {
                    return Ok(finish(x, iteration, initial_cost, cost, Termination::Stalled));
                }
                continue;
            };
            let delta = -chol.solve(&gradient);

            let mut candidate = &x + &delta;
            problem.retract(&mut candidate);
            let candidate_residuals = problem.residuals(&candidate);
            let candidate_cost = candidate_residuals.norm_squared();

            if candidate_cost.is_finite() && candidate_cost < cost {
                let decrease = cost - candidate_cost;
                let small_update = delta.norm() <= options.xtol * (x.norm() + options.xtol);
                let small_decrease = decrease <= options.ftol * cost;

                x = candidate;
                residuals = candidate_residuals;
                cost = candidate_cost;
                lambda = (lambda / 10.0).max(1e-12);

                debug!(
                    "lm iteration {}: rms {:.9} px, lambda {:.1e}",
                    iteration,
                    rms_from_cost(cost, residual_count),
                    lambda
                );

                if small_update {
                    return Ok(finish(x, iteration, initial_cost, cost, Termination::SmallUpdate));
                }
                if small_decrease {
                    return Ok(finish(
                        x,
                        iteration,
                        initial_cost,
                        cost,
                        Termination::SmallCostDecrease,
                    ));
                }
                jacobian = problem.jacobian(&x);
                break;
            }

            if delta.norm() <= options.xtol * (x.norm() + options.xtol) {
                return Ok(finish(x, iteration, initial_cost, cost, Termination::SmallUpdate));
            }
            lambda *= 10.0;
            if lambda > 1e16 {
                return Ok(finish(x, iteration, initial_cost, cost, Termination::Stalled));
            }
        }
    }

    Err(StereoError::ConvergenceFailure {
        iterations: options.max_iterations,
        rms: rms_from_cost(cost, residual_count),
    })
}

fn finish(
    params: DVector<f64>,
    iterations: usize,
    initial_cost: f64,
    final_cost: f64,
    termination: Termination,
) -> SolverReport {
    debug!(
        "lm finished after {} iterations ({:?}), cost {:.3e} -> {:.3e}",
        iterations, termination, initial_cost, final_cost
    );
    SolverReport {
        params,
        iterations,
        initial_cost,
        final_cost,
        termination,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Fits `y = a * exp(b * t)` to exact samples.
    struct ExponentialFit {
        samples: Vec<(f64, f64)>,
    }

    impl LeastSquaresProblem for ExponentialFit {
        fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
            DVector::from_iterator(
                self.samples.len(),
                self.samples
                    .iter()
                    .map(|(t, y)| params[0] * (params[1] * t).exp() - y),
            )
        }
    }

    fn exponential_samples() -> ExponentialFit {
        ExponentialFit {
            samples: (0..20)
                .map(|i| {
                    let t = i as f64 * 0.1;
                    (t, 2.5 * (-1.3 * t).exp())
                })
                .collect(),
        }
    }

    #[test]
    fn test_solver_fits_exponential() {
        let problem = exponential_samples();
        let report = solve(
            &problem,
            DVector::from_vec(vec![1.0, 0.0]),
            &SolverOptions::default(),
        )
        .unwrap();
        assert_relative_eq!(report.params[0], 2.5, epsilon = 1e-8);
        assert_relative_eq!(report.params[1], -1.3, epsilon = 1e-8);
        assert!(report.final_cost < 1e-16);
        assert!(report.final_cost <= report.initial_cost);
    }

    #[test]
    fn test_solver_reports_iteration_cap() {
        let problem = exponential_samples();
        let options = SolverOptions {
            max_iterations: 1,
            ..SolverOptions::default()
        };
        match solve(&problem, DVector::from_vec(vec![1.0, 0.0]), &options) {
            Err(StereoError::ConvergenceFailure { iterations, rms }) => {
                assert_eq!(iterations, 1);
                assert!(rms.is_finite() && rms > 0.0);
            }
            other => panic!("expected ConvergenceFailure, got {:?}", other.map(|r| r.params)),
        }
    }

    struct Redundant;

    impl LeastSquaresProblem for Redundant {
        // only the sum of the two parameters is observable
        fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
            DVector::from_vec(vec![params[0] + params[1] - 1.0, 2.0 * (params[0] + params[1])])
        }
    }

    #[test]
    fn test_solver_detects_rank_deficiency() {
        let result = solve(&Redundant, DVector::from_vec(vec![0.3, 0.1]), &SolverOptions::default());
        assert!(matches!(result, Err(StereoError::DegenerateGeometry { .. })));
    }

    #[test]
    fn test_numeric_jacobian_matches_analytic() {
        let problem = exponential_samples();
        let params = DVector::from_vec(vec![2.0, -1.0]);
        let jacobian = numeric_jacobian(&problem, &params);
        for (i, (t, _)) in problem.samples.iter().enumerate() {
            assert_relative_eq!(jacobian[(i, 0)], (params[1] * t).exp(), epsilon = 1e-8);
            assert_relative_eq!(
                jacobian[(i, 1)],
                params[0] * t * (params[1] * t).exp(),
                epsilon = 1e-8
            );
        }
    }
}
