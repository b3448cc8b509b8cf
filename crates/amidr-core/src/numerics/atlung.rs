//! Eigenmode series for galvanostatic diffusion into a sphere.
//!
//! With `lambda_n = a_n^2`, where `a_n` are the positive roots of `tan a = a`,
//! the fraction of the saturation capacity reached at the end of a pulse
//! satisfies
//!
//! ```text
//! tau + (1 / (A Q)) (1/B - 2 S(tau Q)) + P / Q = 1,   S(x) = sum_n exp(-lambda_n x) / lambda_n
//! ```
//!
//! with `A = 3`, `B = 5` for spheres. The truncated sum is closed with an
//! analytic estimate of the discarded terms so that the result stops depending
//! on the term count long before the default of 4000.

use crate::common::config::Geometry;
use crate::common::constants::{SPHERE_SHAPE_A, SPHERE_SHAPE_B};
use crate::numerics::kahan_add;
use std::f64::consts::{FRAC_PI_2, PI};

const MAX_ROOT_ITERATIONS: usize = 100;
const ROOT_RELATIVE_TOLERANCE: f64 = 1.0e-14;
/// `exp(-745)` is already below the smallest subnormal.
const EXPONENT_UNDERFLOW: f64 = 745.0;
const TAIL_EXPONENT_LIMIT: f64 = 700.0;
const TAU_TOLERANCE: f64 = 1.0e-13;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AtlungSeriesError {
    #[error("expansion requires at least one eigenmode")]
    EmptyExpansion,
    #[error("eigenvalue {index} did not converge")]
    EigenvalueDidNotConverge { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvePoint {
    pub q: f64,
    pub tau: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AtlungSeries {
    eigenvalues: Vec<f64>,
    shape_a: f64,
    shape_b: f64,
}

impl AtlungSeries {
    pub fn new(geometry: Geometry, terms: usize) -> Result<Self, AtlungSeriesError> {
        match geometry {
            Geometry::Sphere => Self::sphere(terms),
        }
    }

    pub fn sphere(terms: usize) -> Result<Self, AtlungSeriesError> {
        if terms == 0 {
            return Err(AtlungSeriesError::EmptyExpansion);
        }

        let eigenvalues = (1..=terms)
            .map(sphere_eigenvalue)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            eigenvalues,
            shape_a: SPHERE_SHAPE_A,
            shape_b: SPHERE_SHAPE_B,
        })
    }

    pub fn terms(&self) -> usize {
        self.eigenvalues.len()
    }

    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    /// Geometry factor `A`: 3 for spheres.
    pub fn shape_a(&self) -> f64 {
        self.shape_a
    }

    /// `S(x)` including the estimate of the truncated tail.
    pub fn series_sum(&self, x: f64) -> f64 {
        self.sums(x).0
    }

    /// Left-hand side of the Atlung relation; equals 1 on the model curve.
    pub fn capacity_balance(&self, tau: f64, q: f64, p: f64) -> f64 {
        let (sum, _) = self.sums(tau * q);
        tau + (1.0 / (self.shape_a * q)) * (1.0 / self.shape_b - 2.0 * sum) + p / q
    }

    /// Solves the Atlung relation for `tau` at a given `Q` and `P`.
    ///
    /// The balance is strictly increasing in `tau`, equals `P / Q` at zero and
    /// is at least one at `tau = 1`, so the root is bracketed by `[0, 1]`. When
    /// `P >= Q` the pulse never reaches the diffusion regime and `tau` is zero.
    pub fn solve_tau(&self, q: f64, p: f64) -> f64 {
        if !(q > 0.0) || p >= q {
            return 0.0;
        }

        let mut lower = 0.0;
        let mut upper = 1.0;
        let mut tau = 0.5;
        for _ in 0..MAX_ROOT_ITERATIONS {
            let (sum, exponential_sum) = self.sums(tau * q);
            let residual =
                tau + (1.0 / (self.shape_a * q)) * (1.0 / self.shape_b - 2.0 * sum) + p / q - 1.0;
            if residual == 0.0 {
                return tau;
            }
            if residual > 0.0 {
                upper = tau;
            } else {
                lower = tau;
            }

            let slope = 1.0 + (2.0 / self.shape_a) * exponential_sum;
            let mut next = tau - residual / slope;
            if !(next > lower && next < upper) {
                next = 0.5 * (lower + upper);
            }
            if (next - tau).abs() <= TAU_TOLERANCE || upper - lower <= TAU_TOLERANCE {
                return next;
            }
            tau = next;
        }

        tau
    }

    pub fn curve(&self, q_values: &[f64], p: f64) -> Vec<CurvePoint> {
        q_values
            .iter()
            .map(|&q| CurvePoint {
                q,
                tau: self.solve_tau(q, p),
            })
            .collect()
    }

    /// Returns `(S(x), sum_n exp(-lambda_n x))`; the second sum drives Newton steps only.
    fn sums(&self, x: f64) -> (f64, f64) {
        let x = x.max(0.0);
        let active = if x > 0.0 {
            self.eigenvalues
                .partition_point(|&eigenvalue| eigenvalue * x <= EXPONENT_UNDERFLOW)
        } else {
            self.eigenvalues.len()
        };

        let mut sum = 0.0;
        let mut correction = 0.0;
        let mut exponential_sum = 0.0;
        let mut exponential_correction = 0.0;
        for &eigenvalue in self.eigenvalues[..active].iter().rev() {
            let decay = (-eigenvalue * x).exp();
            kahan_add(&mut sum, &mut correction, decay / eigenvalue);
            kahan_add(&mut exponential_sum, &mut exponential_correction, decay);
        }

        (sum + self.truncated_tail(x), exponential_sum)
    }

    /// Integral estimate of the discarded modes, using `lambda_n ~ ((n + 1/2) pi)^2`:
    /// `(1/pi^2) [exp(-c L^2)/L - sqrt(pi c) erfc(sqrt(c) L)]` with `c = pi^2 x`, `L = N + 1`.
    fn truncated_tail(&self, x: f64) -> f64 {
        let length = (self.eigenvalues.len() + 1) as f64;
        let c = PI * PI * x;
        let exponent = c * length * length;
        if exponent >= TAIL_EXPONENT_LIMIT {
            return 0.0;
        }

        let tail = ((-exponent).exp() / length - (PI * c).sqrt() * erfc(c.sqrt() * length))
            / (PI * PI);
        tail.max(0.0)
    }
}

fn sphere_eigenvalue(index: usize) -> Result<f64, AtlungSeriesError> {
    let balance = |a: f64| a.sin() - a * a.cos();

    let mut lower = index as f64 * PI;
    let mut upper = lower + FRAC_PI_2;
    let lower_sign = balance(lower).signum();
    let q = upper;
    let mut root = q - 1.0 / q - 2.0 / (3.0 * q.powi(3));

    for _ in 0..MAX_ROOT_ITERATIONS {
        let value = balance(root);
        if value == 0.0 {
            return Ok(root * root);
        }
        if value.signum() == lower_sign {
            lower = root;
        } else {
            upper = root;
        }

        let mut next = root - value / (root * root.sin());
        if !(next > lower && next < upper) {
            next = 0.5 * (lower + upper);
        }

        let tolerance = ROOT_RELATIVE_TOLERANCE * next;
        if (next - root).abs() <= tolerance || upper - lower <= tolerance {
            return Ok(next * next);
        }
        root = next;
    }

    Err(AtlungSeriesError::EigenvalueDidNotConverge { index })
}

/// Complementary error function, Chebyshev fit with fractional error below 1.2e-7.
pub(crate) fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let polynomial = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let value = t * polynomial.exp();
    if x >= 0.0 { value } else { 2.0 - value }
}
