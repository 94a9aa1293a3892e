use std::time::Instant;

use log::{debug, trace};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};

/// Damping beyond which the normal equations are treated as unsolvable.
const MAX_DAMPING: f64 = 1e32;

/// Finite-difference scheme for the Jacobian
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JacobianScheme {
    /// One extra evaluation per parameter.
    TwoPoint,
    /// Central differences, two extra evaluations per parameter away from bounds.
    ThreePoint,
}

/// Solver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    pub xtol: f64,
    pub gtol: f64,
    pub ftol: f64,
    /// Residual evaluations allowed, excluding Jacobian probes. Defaults to 100 per parameter.
    pub max_evaluations: Option<usize>,
    pub jacobian: JacobianScheme,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            xtol: 1e-8,
            gtol: 1e-8,
            ftol: 1e-8,
            max_evaluations: None,
            jacobian: JacobianScheme::ThreePoint,
        }
    }
}

/// Why the solve stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    MaxEvaluations,
    Gtol,
    Ftol,
    Xtol,
    FtolAndXtol,
}

impl Termination {
    pub fn converged(&self) -> bool {
        !matches!(self, Termination::MaxEvaluations)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Termination::MaxEvaluations => "the maximum number of function evaluations is exceeded",
            Termination::Gtol => "`gtol` termination condition is satisfied",
            Termination::Ftol => "`ftol` termination condition is satisfied",
            Termination::Xtol => "`xtol` termination condition is satisfied",
            Termination::FtolAndXtol => "both `ftol` and `xtol` termination conditions are satisfied",
        }
    }
}

/// Solver statistics returned with the optimum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeastSquaresReport {
    pub x: Vec<f64>,
    pub residual: Vec<f64>,
    /// Half the squared residual norm at `x`.
    pub cost: f64,
    pub initial_cost: f64,
    /// Accepted steps.
    pub iterations: usize,
    /// Residual evaluations, excluding Jacobian probes.
    pub evaluations: usize,
    pub jacobian_evaluations: usize,
    /// Infinity norm of the bound-scaled gradient at `x`.
    pub optimality: f64,
    pub termination: Termination,
    pub solve_time: f64,
}

/// Bound-constrained nonlinear least squares.
///
/// Minimises `0.5 * |f(x)|^2` subject to `lower <= x <= upper` with a
/// projected Levenberg-Marquardt iteration and a finite-difference
/// Jacobian. Every call to `f` may be expensive, so the evaluation count
/// is the budget that matters.
#[derive(Debug, Clone, Default)]
pub struct BoundedLeastSquares {
    config: SolverConfig,
}

impl BoundedLeastSquares {
    pub fn new() -> Self {
        BoundedLeastSquares::default()
    }

    pub fn with_config(config: SolverConfig) -> Self {
        BoundedLeastSquares { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn minimize<F>(&self, mut f: F, x0: &[f64], lower: &[f64], upper: &[f64]) -> Result<LeastSquaresReport>
    where
        F: FnMut(&[f64]) -> Result<Vec<f64>>,
    {
        let start_time = Instant::now();
        let n = x0.len();
        if n == 0 {
            return Err(FitError::Solver("no variable parameters to optimize".to_string()));
        }
        if lower.len() != n || upper.len() != n {
            return Err(FitError::Solver("bounds and initial point dimensions don't match".to_string()));
        }
        if lower.iter().zip(upper).any(|(lo, hi)| lo > hi) {
            return Err(FitError::Solver("each lower bound must not exceed its upper bound".to_string()));
        }

        let lower = DVector::from_column_slice(lower);
        let upper = DVector::from_column_slice(upper);
        let mut x = project(&DVector::from_column_slice(x0), &lower, &upper);

        let mut r = DVector::from_vec(f(x.as_slice())?);
        let mut evaluations = 1;
        if r.is_empty() {
            return Err(FitError::Solver("residual vector is empty".to_string()));
        }
        if r.iter().any(|v| !v.is_finite()) {
            return Err(FitError::Solver("residuals are not finite at the initial point".to_string()));
        }
        let m = r.len();

        let mut cost = 0.5 * r.norm_squared();
        let initial_cost = cost;
        let max_evaluations = self.config.max_evaluations.unwrap_or(100 * n);

        let mut jacobian = self.jacobian(&mut f, &x, &r, &lower, &upper)?;
        let mut jacobian_evaluations = 1;
        let mut gradient = jacobian.transpose() * &r;
        let mut optimality = scaled_gradient_norm(&x, &gradient, &lower, &upper);
        if optimality.is_nan() {
            return Err(FitError::Solver("gradient is not finite at the initial point".to_string()));
        }
        let mut lambda: Option<f64> = None;
        let mut iterations = 0;

        debug!("Least squares: {} parameters, {} residuals, initial cost {:e}", n, m, cost);

        let termination = loop {
            if optimality < self.config.gtol {
                break Termination::Gtol;
            }
            if evaluations >= max_evaluations {
                break Termination::MaxEvaluations;
            }

            let normal = jacobian.transpose() * &jacobian;
            let scale = DVector::from_iterator(n, normal.diagonal().iter().map(|d| d.max(f64::EPSILON)));
            let damping = lambda.get_or_insert_with(|| 1e-3 * scale.max());
            let free: Vec<bool> = (0..n)
                .map(|i| !pushes_against_bound(x[i], gradient[i], lower[i], upper[i]))
                .collect();

            let mut status: Option<Termination> = None;
            let mut accepted = false;

            while !accepted && evaluations < max_evaluations {
                let mut system = normal.clone();
                let mut rhs = -&gradient;
                for i in 0..n {
                    if free[i] {
                        system[(i, i)] += *damping * scale[i];
                    } else {
                        // pin variables held at a bound by the gradient
                        for k in 0..n {
                            system[(i, k)] = 0.0;
                            system[(k, i)] = 0.0;
                        }
                        system[(i, i)] = 1.0;
                        rhs[i] = 0.0;
                    }
                }
                let Some(direction) = solve_spd(system, rhs) else {
                    *damping *= 4.0;
                    if !damping.is_finite() || *damping > MAX_DAMPING {
                        return Err(FitError::Solver(
                            "step equations stayed singular as damping grew".to_string(),
                        ));
                    }
                    continue;
                };

                let x_new = project(&(&x + &direction), &lower, &upper);
                let step = &x_new - &x;
                let step_norm = step.norm();
                let xtol_hit = step_norm < self.config.xtol * (self.config.xtol + x.norm());

                if step_norm == 0.0 {
                    status = Some(Termination::Xtol);
                    break;
                }

                let r_new = DVector::from_vec(f(x_new.as_slice())?);
                evaluations += 1;
                let cost_new = if r_new.len() == m && r_new.iter().all(|v| v.is_finite()) {
                    0.5 * r_new.norm_squared()
                } else {
                    f64::INFINITY
                };

                let predicted = -(gradient.dot(&step) + 0.5 * step.dot(&(&normal * &step)));
                let actual = cost - cost_new;
                let ratio = if predicted > 0.0 { actual / predicted } else { 0.0 };
                trace!("trial cost {:e}, ratio {:.3}, damping {:e}", cost_new, ratio, damping);

                if actual > 0.0 {
                    if ratio > 0.75 {
                        *damping /= 3.0;
                    } else if ratio < 0.25 {
                        *damping *= 2.0;
                    }
                    let ftol_hit = actual < self.config.ftol * cost && ratio > 0.25;
                    status = match (ftol_hit, xtol_hit) {
                        (true, true) => Some(Termination::FtolAndXtol),
                        (true, false) => Some(Termination::Ftol),
                        (false, true) => Some(Termination::Xtol),
                        (false, false) => None,
                    };

                    x = x_new;
                    r = r_new;
                    cost = cost_new;
                    iterations += 1;
                    accepted = true;
                } else {
                    *damping *= 4.0;
                    if xtol_hit {
                        status = Some(Termination::Xtol);
                        break;
                    }
                }
            }

            if accepted {
                jacobian = self.jacobian(&mut f, &x, &r, &lower, &upper)?;
                jacobian_evaluations += 1;
                gradient = jacobian.transpose() * &r;
                optimality = scaled_gradient_norm(&x, &gradient, &lower, &upper);
            }

            if let Some(status) = status {
                break status;
            }
        };

        let solve_time = start_time.elapsed().as_secs_f64();
        debug!(
            "Least squares finished: {} ({} evaluations, cost {:e} -> {:e})",
            termination.describe(),
            evaluations,
            initial_cost,
            cost
        );

        Ok(LeastSquaresReport {
            x: x.iter().copied().collect(),
            residual: r.iter().copied().collect(),
            cost,
            initial_cost,
            iterations,
            evaluations,
            jacobian_evaluations,
            optimality,
            termination,
            solve_time,
        })
    }

    /// Finite-difference Jacobian that never probes outside the bounds
    fn jacobian<F>(
        &self,
        f: &mut F,
        x: &DVector<f64>,
        r: &DVector<f64>,
        lower: &DVector<f64>,
        upper: &DVector<f64>,
    ) -> Result<DMatrix<f64>>
    where
        F: FnMut(&[f64]) -> Result<Vec<f64>>,
    {
        let n = x.len();
        let m = r.len();
        let base_step = match self.config.jacobian {
            JacobianScheme::TwoPoint => f64::EPSILON.sqrt(),
            JacobianScheme::ThreePoint => f64::EPSILON.cbrt(),
        };
        let mut jacobian = DMatrix::zeros(m, n);

        for j in 0..n {
            let span = upper[j] - lower[j];
            if span <= 0.0 {
                continue;
            }
            let h = (base_step * x[j].abs().max(1.0)).min(span / 2.0);
            let fits_forward = x[j] + h <= upper[j];
            let fits_backward = x[j] - h >= lower[j];

            let column = if self.config.jacobian == JacobianScheme::ThreePoint && fits_forward && fits_backward {
                let plus = self.probe(f, x, j, h, m)?;
                let minus = self.probe(f, x, j, -h, m)?;
                (plus - minus) / (2.0 * h)
            } else if fits_forward {
                (self.probe(f, x, j, h, m)? - r) / h
            } else {
                (r - self.probe(f, x, j, -h, m)?) / h
            };
            jacobian.set_column(j, &column);
        }

        Ok(jacobian)
    }

    fn probe<F>(&self, f: &mut F, x: &DVector<f64>, j: usize, h: f64, m: usize) -> Result<DVector<f64>>
    where
        F: FnMut(&[f64]) -> Result<Vec<f64>>,
    {
        let mut shifted = x.clone();
        shifted[j] += h;
        let values = f(shifted.as_slice())?;
        if values.len() != m {
            return Err(FitError::Solver(format!(
                "residual length changed from {} to {}",
                m,
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(FitError::Solver(format!(
                "residuals are not finite when stepping parameter {} by {:e}",
                j, h
            )));
        }
        Ok(DVector::from_vec(values))
    }
}

fn project(x: &DVector<f64>, lower: &DVector<f64>, upper: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(
        x.len(),
        x.iter()
            .zip(lower.iter().zip(upper.iter()))
            .map(|(&v, (&lo, &hi))| v.max(lo).min(hi)),
    )
}

/// Coleman-Li scaling: gradient components pointing into an active bound
/// are weighted by the distance to that bound. NaN propagates.
fn scaled_gradient_norm(x: &DVector<f64>, g: &DVector<f64>, lower: &DVector<f64>, upper: &DVector<f64>) -> f64 {
    (0..x.len())
        .map(|i| {
            let v = if g[i] < 0.0 && upper[i].is_finite() {
                upper[i] - x[i]
            } else if g[i] > 0.0 && lower[i].is_finite() {
                x[i] - lower[i]
            } else {
                1.0
            };
            (g[i] * v).abs()
        })
        .fold(0.0, |norm, v| if norm.is_nan() || v.is_nan() { f64::NAN } else { norm.max(v) })
}

fn pushes_against_bound(x: f64, g: f64, lower: f64, upper: f64) -> bool {
    (x <= lower && g > 0.0) || (x >= upper && g < 0.0)
}

fn solve_spd(matrix: DMatrix<f64>, rhs: DVector<f64>) -> Option<DVector<f64>> {
    let solution = match matrix.clone().cholesky() {
        Some(cholesky) => Some(cholesky.solve(&rhs)),
        None => matrix.lu().solve(&rhs),
    };
    solution.filter(|s| s.iter().all(|v| v.is_finite()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_residual(x: &[f64]) -> Result<Vec<f64>> {
        // y = a * t + b through (0, 1), (1, 3), (2, 5)
        let ts = [0.0, 1.0, 2.0];
        let ys = [1.0, 3.0, 5.0];
        Ok(ts.iter().zip(&ys).map(|(t, y)| x[0] * t + x[1] - y).collect())
    }

    #[test]
    fn test_fits_linear_model() {
        let solver = BoundedLeastSquares::new();
        let inf = f64::INFINITY;
        let report = solver
            .minimize(line_residual, &[0.0, 0.0], &[-inf, -inf], &[inf, inf])
            .unwrap();

        assert!((report.x[0] - 2.0).abs() < 1e-6);
        assert!((report.x[1] - 1.0).abs() < 1e-6);
        assert!(report.cost < 1e-10);
        assert!(report.cost <= report.initial_cost);
        assert!(report.termination.converged());
    }

    #[test]
    fn test_respects_bounds() {
        let solver = BoundedLeastSquares::new();
        let report = solver
            .minimize(line_residual, &[0.5, 0.5], &[0.0, 0.0], &[1.5, 10.0])
            .unwrap();

        // a is held at its upper bound, b settles at the mean offset
        assert!(report.x[0] <= 1.5);
        assert!((report.x[0] - 1.5).abs() < 1e-6);
        assert!((report.x[1] - 1.5).abs() < 1e-4);
        assert!(report.cost <= report.initial_cost);
    }

    #[test]
    fn test_nonlinear_fit_from_bounds_interior() {
        // Divider ratio 5 * x / (1000 + x) should reach 4.0 at x = 4000
        let residual = |x: &[f64]| -> Result<Vec<f64>> {
            let v = 5.0 * x[0] / (1000.0 + x[0]);
            Ok(vec![4.0 - v; 3])
        };
        let config = SolverConfig {
            xtol: 1e-12,
            gtol: 1e-12,
            ftol: 1e-12,
            ..SolverConfig::default()
        };
        let report = BoundedLeastSquares::with_config(config)
            .minimize(residual, &[1000.0], &[0.0], &[f64::INFINITY])
            .unwrap();

        assert!((report.x[0] - 4000.0).abs() / 4000.0 < 1e-4);
        assert!(report.evaluations <= 100);
    }

    #[test]
    fn test_evaluation_budget() {
        let config = SolverConfig {
            max_evaluations: Some(3),
            xtol: 0.0,
            gtol: 0.0,
            ftol: 0.0,
            ..SolverConfig::default()
        };
        let residual = |x: &[f64]| -> Result<Vec<f64>> { Ok(vec![(x[0] - 3.0).exp() - 1.0]) };
        let report = BoundedLeastSquares::with_config(config)
            .minimize(residual, &[0.0], &[-10.0], &[10.0])
            .unwrap();
        assert!(report.evaluations <= 3);
    }

    #[test]
    fn test_rejects_bad_input() {
        let solver = BoundedLeastSquares::new();
        assert!(matches!(
            solver.minimize(line_residual, &[], &[], &[]),
            Err(FitError::Solver(_))
        ));
        assert!(solver
            .minimize(line_residual, &[0.0, 0.0], &[1.0, 0.0], &[0.0, 1.0])
            .is_err());
        let failing = |_: &[f64]| -> Result<Vec<f64>> { Err(FitError::Solver("simulator down".into())) };
        assert!(solver.minimize(failing, &[1.0], &[0.0], &[2.0]).is_err());
    }

    #[test]
    fn test_scaled_gradient_at_active_bound() {
        let x = DVector::from_vec(vec![0.0, 5.0]);
        let g = DVector::from_vec(vec![2.0, -3.0]);
        let lower = DVector::from_vec(vec![0.0, 0.0]);
        let upper = DVector::from_vec(vec![10.0, f64::INFINITY]);
        // first component pushes against its lower bound, second is unbounded above
        assert_eq!(scaled_gradient_norm(&x, &g, &lower, &upper), 3.0);

        let g = DVector::from_vec(vec![f64::NAN, -3.0]);
        assert!(scaled_gradient_norm(&x, &g, &lower, &upper).is_nan());
    }

    #[test]
    fn test_non_finite_jacobian_probe_fails() {
        let residual = |x: &[f64]| -> Result<Vec<f64>> {
            if x[1] != 1.0 {
                Ok(vec![f64::NAN])
            } else {
                Ok(vec![x[0] - 3.0])
            }
        };
        let inf = f64::INFINITY;
        let result = BoundedLeastSquares::new().minimize(residual, &[0.0, 1.0], &[-inf, -inf], &[inf, inf]);
        assert!(matches!(result, Err(FitError::Solver(_))));
    }
}
