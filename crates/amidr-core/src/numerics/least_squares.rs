//! Bound-constrained nonlinear least squares.
//!
//! A projected Levenberg-Marquardt iteration: parameters sitting on a bound
//! whose gradient points outward are frozen for the step, the remaining ones
//! take a damped Gauss-Newton step that is then clipped back into the box.
//! Robust losses are handled by rescaling residuals and Jacobian rows so the
//! Gauss-Newton model matches the loss locally (iteratively reweighted least
//! squares).

use crate::numerics::linalg::{CholeskyError, invert_normal_matrix, solve_normal_system};
use crate::numerics::stable_sum;
use faer::Mat;

const FINITE_DIFFERENCE_STEP: f64 = 1.490_116_119_384_765_6e-8;
const STEP_TOLERANCE: f64 = 1.0e-15;
const INITIAL_DAMPING_FACTOR: f64 = 1.0e-3;
const MIN_DAMPING: f64 = 1.0e-300;
const MAX_DAMPING: f64 = 1.0e300;

pub trait LeastSquaresProblem {
    fn residuals(&self, parameters: &[f64]) -> Vec<f64>;
}

impl<F> LeastSquaresProblem for F
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    fn residuals(&self, parameters: &[f64]) -> Vec<f64> {
        self(parameters)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Loss {
    #[default]
    Linear,
    /// `rho(z) = 2 (sqrt(1 + z) - 1)` on squared residuals.
    SoftL1,
}

impl Loss {
    fn rho(self, squared: f64) -> f64 {
        match self {
            Self::Linear => squared,
            Self::SoftL1 => 2.0 * ((1.0 + squared).sqrt() - 1.0),
        }
    }

    /// `(residual_scale, jacobian_scale)` for one residual.
    fn scales(self, residual: f64) -> (f64, f64) {
        match self {
            Self::Linear => (1.0, 1.0),
            Self::SoftL1 => {
                let base = 1.0 + residual * residual;
                (base.powf(0.25), base.powf(-0.75))
            }
        }
    }

    pub fn cost(self, residuals: &[f64]) -> f64 {
        let terms: Vec<f64> = residuals
            .iter()
            .map(|residual| self.rho(residual * residual))
            .collect();
        0.5 * stable_sum(&terms)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LeastSquaresError {
    #[error("bounds describe {bounds} parameters but the initial guess has {parameters}")]
    DimensionMismatch { bounds: usize, parameters: usize },
    #[error("bound {index} is empty: [{lower}, {upper}]")]
    InvalidBounds {
        index: usize,
        lower: f64,
        upper: f64,
    },
    #[error("problem produced no residuals")]
    EmptyResiduals,
    #[error("residual count changed from {expected} to {actual} between evaluations")]
    ResidualCountChanged { expected: usize, actual: usize },
    #[error("residuals are not finite at the initial guess")]
    NonFiniteInitialResidual,
    #[error(transparent)]
    Linear(#[from] CholeskyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Relative cost reduction of an accepted step fell below `ftol`.
    CostTolerance,
    /// The clipped step is negligible against the parameter vector.
    StepTolerance,
    /// Every free parameter is pinned at a bound by the gradient.
    ProjectedGradient,
    ZeroResidual,
    MaxEvaluations,
}

impl TerminationReason {
    pub const fn converged(self) -> bool {
        !matches!(self, Self::MaxEvaluations)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeastSquaresOutcome {
    pub parameters: Vec<f64>,
    pub residuals: Vec<f64>,
    /// `0.5 * sum(rho(r^2))` at the solution.
    pub cost: f64,
    /// Loss-scaled Jacobian at the solution.
    pub jacobian: Mat<f64>,
    pub evaluations: usize,
    pub termination: TerminationReason,
}

impl LeastSquaresOutcome {
    pub fn converged(&self) -> bool {
        self.termination.converged()
    }

    /// `inv(J^T J) * 2 cost / (m - n)`; `None` without spare degrees of freedom
    /// or when `J^T J` is singular.
    pub fn covariance(&self) -> Option<Mat<f64>> {
        let rows = self.jacobian.nrows();
        let cols = self.jacobian.ncols();
        if rows <= cols {
            return None;
        }

        let normal = normal_matrix(&self.jacobian);
        let inverse = invert_normal_matrix(&normal).ok()?;
        let scale = 2.0 * self.cost / (rows - cols) as f64;
        let mut covariance = Mat::zeros(cols, cols);
        for row in 0..cols {
            for col in 0..cols {
                covariance[(row, col)] = inverse[(row, col)] * scale;
            }
        }
        Some(covariance)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundedLeastSquares {
    lower: Vec<f64>,
    upper: Vec<f64>,
    loss: Loss,
    ftol: f64,
    max_evaluations: usize,
}

impl BoundedLeastSquares {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self, LeastSquaresError> {
        if lower.len() != upper.len() {
            return Err(LeastSquaresError::DimensionMismatch {
                bounds: lower.len(),
                parameters: upper.len(),
            });
        }
        for (index, (&lower, &upper)) in lower.iter().zip(&upper).enumerate() {
            if !(lower < upper) {
                return Err(LeastSquaresError::InvalidBounds {
                    index,
                    lower,
                    upper,
                });
            }
        }

        Ok(Self {
            lower,
            upper,
            loss: Loss::Linear,
            ftol: 1.0e-8,
            max_evaluations: 1000,
        })
    }

    pub fn with_loss(mut self, loss: Loss) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_ftol(mut self, ftol: f64) -> Self {
        self.ftol = ftol;
        self
    }

    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.max_evaluations = max_evaluations.max(1);
        self
    }

    pub fn minimize<P>(
        &self,
        problem: &P,
        initial: &[f64],
    ) -> Result<LeastSquaresOutcome, LeastSquaresError>
    where
        P: LeastSquaresProblem + ?Sized,
    {
        let dimension = self.lower.len();
        if initial.len() != dimension {
            return Err(LeastSquaresError::DimensionMismatch {
                bounds: dimension,
                parameters: initial.len(),
            });
        }

        let mut parameters: Vec<f64> = initial
            .iter()
            .enumerate()
            .map(|(index, value)| value.clamp(self.lower[index], self.upper[index]))
            .collect();
        let mut residuals = problem.residuals(&parameters);
        let mut evaluations = 1;
        let count = residuals.len();
        if count == 0 {
            return Err(LeastSquaresError::EmptyResiduals);
        }
        if residuals.iter().any(|value| !value.is_finite()) {
            return Err(LeastSquaresError::NonFiniteInitialResidual);
        }

        let mut cost = self.loss.cost(&residuals);
        let mut jacobian = self.jacobian(problem, &parameters, &residuals)?;
        let mut damping: Option<f64> = None;
        let mut growth = 2.0;

        let termination = 'outer: loop {
            if cost == 0.0 {
                break TerminationReason::ZeroResidual;
            }
            if evaluations >= self.max_evaluations {
                break TerminationReason::MaxEvaluations;
            }

            let (scaled_jacobian, scaled_residuals) = self.scale(&jacobian, &residuals);
            let normal = normal_matrix(&scaled_jacobian);
            let gradient = gradient(&scaled_jacobian, &scaled_residuals);
            let free: Vec<usize> = (0..dimension)
                .filter(|&index| !self.is_pinned(index, parameters[index], gradient[index]))
                .collect();
            if free.is_empty() || free.iter().all(|&index| gradient[index] == 0.0) {
                break TerminationReason::ProjectedGradient;
            }

            let mut mu = match damping {
                Some(value) => value,
                None => {
                    let largest = free
                        .iter()
                        .map(|&index| normal[(index, index)])
                        .fold(0.0_f64, f64::max);
                    (INITIAL_DAMPING_FACTOR * largest).max(MIN_DAMPING)
                }
            };

            loop {
                let step = match self.damped_step(&normal, &gradient, &free, mu) {
                    Ok(step) => step,
                    Err(CholeskyError::NotPositiveDefinite { .. }) if mu < MAX_DAMPING => {
                        mu *= growth;
                        growth *= 2.0;
                        continue;
                    }
                    Err(error) => return Err(error.into()),
                };

                let trial: Vec<f64> = parameters
                    .iter()
                    .zip(&step)
                    .enumerate()
                    .map(|(index, (value, delta))| {
                        (value + delta).clamp(self.lower[index], self.upper[index])
                    })
                    .collect();
                let taken: Vec<f64> = trial
                    .iter()
                    .zip(&parameters)
                    .map(|(next, current)| next - current)
                    .collect();

                if norm(&taken) <= STEP_TOLERANCE * (STEP_TOLERANCE + norm(&parameters)) {
                    break 'outer TerminationReason::StepTolerance;
                }

                let predicted = predicted_reduction(&normal, &gradient, &taken);
                let trial_residuals = problem.residuals(&trial);
                evaluations += 1;
                if trial_residuals.len() != count {
                    return Err(LeastSquaresError::ResidualCountChanged {
                        expected: count,
                        actual: trial_residuals.len(),
                    });
                }
                let trial_cost = if trial_residuals.iter().all(|value| value.is_finite()) {
                    self.loss.cost(&trial_residuals)
                } else {
                    f64::INFINITY
                };
                let actual = cost - trial_cost;

                if actual > 0.0 {
                    let ratio = if predicted > 0.0 {
                        actual / predicted
                    } else {
                        0.0
                    };
                    let previous_cost = cost;
                    parameters = trial;
                    residuals = trial_residuals;
                    cost = trial_cost;
                    jacobian = self.jacobian(problem, &parameters, &residuals)?;
                    mu = (mu * (1.0 / 3.0_f64).max(1.0 - (2.0 * ratio - 1.0).powi(3)))
                        .max(MIN_DAMPING);
                    damping = Some(mu);
                    growth = 2.0;

                    if actual < self.ftol * previous_cost && ratio > 0.25 {
                        break 'outer TerminationReason::CostTolerance;
                    }
                    break;
                }

                if evaluations >= self.max_evaluations {
                    break 'outer TerminationReason::MaxEvaluations;
                }
                mu = (mu * growth).min(MAX_DAMPING);
                growth *= 2.0;
                damping = Some(mu);
            }
        };

        let (scaled_jacobian, _) = self.scale(&jacobian, &residuals);
        Ok(LeastSquaresOutcome {
            parameters,
            residuals,
            cost,
            jacobian: scaled_jacobian,
            evaluations,
            termination,
        })
    }

    fn is_pinned(&self, index: usize, value: f64, gradient: f64) -> bool {
        (value <= self.lower[index] && gradient > 0.0)
            || (value >= self.upper[index] && gradient < 0.0)
    }

    fn jacobian<P>(
        &self,
        problem: &P,
        parameters: &[f64],
        residuals: &[f64],
    ) -> Result<Mat<f64>, LeastSquaresError>
    where
        P: LeastSquaresProblem + ?Sized,
    {
        let rows = residuals.len();
        let cols = parameters.len();
        let mut jacobian = Mat::zeros(rows, cols);
        let mut shifted = parameters.to_vec();

        for col in 0..cols {
            let value = parameters[col];
            let mut step = FINITE_DIFFERENCE_STEP * value.abs().max(1.0);
            if value + step > self.upper[col] {
                step = if value - step >= self.lower[col] {
                    -step
                } else if self.upper[col] - value >= value - self.lower[col] {
                    self.upper[col] - value
                } else {
                    self.lower[col] - value
                };
            }

            shifted[col] = value + step;
            let perturbed = problem.residuals(&shifted);
            shifted[col] = value;
            if perturbed.len() != rows {
                return Err(LeastSquaresError::ResidualCountChanged {
                    expected: rows,
                    actual: perturbed.len(),
                });
            }

            for row in 0..rows {
                let derivative = (perturbed[row] - residuals[row]) / step;
                jacobian[(row, col)] = if derivative.is_finite() {
                    derivative
                } else {
                    0.0
                };
            }
        }

        Ok(jacobian)
    }

    fn scale(&self, jacobian: &Mat<f64>, residuals: &[f64]) -> (Mat<f64>, Vec<f64>) {
        let mut scaled_jacobian = jacobian.clone();
        let mut scaled_residuals = residuals.to_vec();
        for (row, residual) in scaled_residuals.iter_mut().enumerate() {
            let (residual_scale, jacobian_scale) = self.loss.scales(*residual);
            *residual *= residual_scale;
            for col in 0..jacobian.ncols() {
                scaled_jacobian[(row, col)] *= jacobian_scale;
            }
        }
        (scaled_jacobian, scaled_residuals)
    }

    fn damped_step(
        &self,
        normal: &Mat<f64>,
        gradient: &[f64],
        free: &[usize],
        mu: f64,
    ) -> Result<Vec<f64>, CholeskyError> {
        let size = free.len();
        let mut system = Mat::zeros(size, size);
        let mut rhs = vec![0.0; size];
        for (row, &source_row) in free.iter().enumerate() {
            for (col, &source_col) in free.iter().enumerate() {
                system[(row, col)] = normal[(source_row, source_col)];
            }
            let diagonal = normal[(source_row, source_row)].max(MIN_DAMPING);
            system[(row, row)] += mu * diagonal;
            rhs[row] = -gradient[source_row];
        }

        let reduced = solve_normal_system(&system, &rhs)?;
        let mut step = vec![0.0; gradient.len()];
        for (value, &index) in reduced.iter().zip(free) {
            step[index] = *value;
        }
        Ok(step)
    }
}

fn normal_matrix(jacobian: &Mat<f64>) -> Mat<f64> {
    let rows = jacobian.nrows();
    let cols = jacobian.ncols();
    let mut normal = Mat::zeros(cols, cols);
    for lhs in 0..cols {
        for rhs in lhs..cols {
            let column_products: Vec<f64> = (0..rows)
                .map(|row| jacobian[(row, lhs)] * jacobian[(row, rhs)])
                .collect();
            let value = stable_sum(&column_products);
            normal[(lhs, rhs)] = value;
            normal[(rhs, lhs)] = value;
        }
    }
    normal
}

fn gradient(jacobian: &Mat<f64>, residuals: &[f64]) -> Vec<f64> {
    (0..jacobian.ncols())
        .map(|col| {
            let products: Vec<f64> = residuals
                .iter()
                .enumerate()
                .map(|(row, residual)| jacobian[(row, col)] * residual)
                .collect();
            stable_sum(&products)
        })
        .collect()
}

/// `-(g.s + 0.5 s^T A s)` for the Gauss-Newton model of `0.5 |r|^2`.
fn predicted_reduction(normal: &Mat<f64>, gradient: &[f64], step: &[f64]) -> f64 {
    let mut linear = 0.0;
    let mut quadratic = 0.0;
    for row in 0..step.len() {
        linear += gradient[row] * step[row];
        for col in 0..step.len() {
            quadratic += step[row] * normal[(row, col)] * step[col];
        }
    }
    -(linear + 0.5 * quadratic)
}

fn norm(values: &[f64]) -> f64 {
    values.iter().map(|value| value * value).sum::<f64>().sqrt()
}
