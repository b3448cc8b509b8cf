use crate::common::config::{Bounds, FitOptions};
use crate::domain::Protocol;
use crate::modules::traits::{CapacityModel, ParameterSpace};
use crate::numerics::AtlungSeries;
use faer::Mat;

/// Single-rate pulses fix the saturation capacity to the measured one.
const SINGLE_RATE_CAPACITY_BOUNDS: Bounds = Bounds::new(1.0, 1.000_000_1);
/// Early points of a resistance-limited pulse carry no diffusion information.
const RESISTANCE_LIMITED_FRACTION: f64 = 0.05;

fn capacity_adjustment_space(options: &FitOptions, protocol: Protocol) -> (Bounds, f64) {
    match protocol {
        Protocol::SingleRate => (SINGLE_RATE_CAPACITY_BOUNDS, SINGLE_RATE_CAPACITY_BOUNDS.lower),
        Protocol::MultiRate => (
            options.capacity_adjustment_bounds,
            options.capacity_adjustment_guess,
        ),
    }
}

/// Pure diffusion: parameters `[log10 D, capacity adjustment]`.
#[derive(Debug, Clone)]
pub struct DiffusionModel<'a> {
    series: &'a AtlungSeries,
    particle_radius: f64,
    space: ParameterSpace,
}

impl<'a> DiffusionModel<'a> {
    pub fn new(series: &'a AtlungSeries, options: &FitOptions, protocol: Protocol) -> Self {
        let (capacity, capacity_guess) = capacity_adjustment_space(options, protocol);
        Self {
            series,
            particle_radius: options.particle_radius,
            space: ParameterSpace {
                lower: vec![options.d_bounds.lower.log10(), capacity.lower],
                upper: vec![options.d_bounds.upper.log10(), capacity.upper],
                initial: vec![options.d_guess.log10(), capacity_guess],
            },
        }
    }
}

impl CapacityModel for DiffusionModel<'_> {
    fn name(&self) -> &'static str {
        "diffusion"
    }

    fn series(&self) -> &AtlungSeries {
        self.series
    }

    fn particle_radius(&self) -> f64 {
        self.particle_radius
    }

    fn parameter_space(&self) -> ParameterSpace {
        self.space.clone()
    }

    fn diffusivity(&self, parameters: &[f64]) -> f64 {
        10f64.powf(parameters[0])
    }

    fn resistance(&self, _parameters: &[f64]) -> f64 {
        0.0
    }

    fn capacity_adjustment(&self, parameters: &[f64]) -> f64 {
        parameters[1]
    }

    fn balance(&self, parameters: &[f64], fractions: &[f64], rates: &[f64]) -> Vec<f64> {
        let diffusivity = self.diffusivity(parameters);
        let capacity = self.capacity_adjustment(parameters);
        fractions
            .iter()
            .zip(rates)
            .map(|(&fraction, &rate)| {
                let q = self.time_constant(diffusivity, rate);
                self.series.capacity_balance(fraction / capacity, q, 0.0)
            })
            .collect()
    }

    fn log10_diffusivity_variance(&self, covariance: &Mat<f64>) -> f64 {
        covariance[(0, 0)]
    }

    fn curve_decades(&self) -> (f64, f64) {
        (-3.0, 2.0)
    }
}

/// Diffusion behind a surface resistance:
/// parameters `[log10(P/D), capacity adjustment, log10 P]`.
///
/// Fitting `P/D` instead of `D` decorrelates the two exponents.
#[derive(Debug, Clone)]
pub struct ResistanceCorrectedModel<'a> {
    series: &'a AtlungSeries,
    particle_radius: f64,
    space: ParameterSpace,
}

impl<'a> ResistanceCorrectedModel<'a> {
    pub fn new(series: &'a AtlungSeries, options: &FitOptions, protocol: Protocol) -> Self {
        let (capacity, capacity_guess) = capacity_adjustment_space(options, protocol);
        let log_d = (options.d_bounds.lower.log10(), options.d_bounds.upper.log10());
        let log_p = (options.p_bounds.lower.log10(), options.p_bounds.upper.log10());
        let log_p_guess = options.p_guess.log10();
        Self {
            series,
            particle_radius: options.particle_radius,
            space: ParameterSpace {
                lower: vec![log_p.0 - log_d.1, capacity.lower, log_p.0],
                upper: vec![log_p.1 - log_d.0, capacity.upper, log_p.1],
                initial: vec![
                    log_p_guess - options.d_guess.log10(),
                    capacity_guess,
                    log_p_guess,
                ],
            },
        }
    }
}

impl CapacityModel for ResistanceCorrectedModel<'_> {
    fn name(&self) -> &'static str {
        "resistance_corrected"
    }

    fn series(&self) -> &AtlungSeries {
        self.series
    }

    fn particle_radius(&self) -> f64 {
        self.particle_radius
    }

    fn parameter_space(&self) -> ParameterSpace {
        self.space.clone()
    }

    fn diffusivity(&self, parameters: &[f64]) -> f64 {
        10f64.powf(parameters[2] - parameters[0])
    }

    fn resistance(&self, parameters: &[f64]) -> f64 {
        10f64.powf(parameters[2])
    }

    fn capacity_adjustment(&self, parameters: &[f64]) -> f64 {
        parameters[1]
    }

    fn balance(&self, parameters: &[f64], fractions: &[f64], rates: &[f64]) -> Vec<f64> {
        let diffusivity = self.diffusivity(parameters);
        let resistance = self.resistance(parameters);
        let capacity = self.capacity_adjustment(parameters);
        let largest = fractions.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        fractions
            .iter()
            .zip(rates)
            .map(|(&fraction, &rate)| {
                let q = self.time_constant(diffusivity, rate);
                let tau = fraction / capacity;
                if resistance > q && fraction / largest < RESISTANCE_LIMITED_FRACTION {
                    tau + 1.0
                } else {
                    self.series.capacity_balance(tau, q, resistance)
                }
            })
            .collect()
    }

    /// `log10 D = log10 P - log10(P/D)`.
    fn log10_diffusivity_variance(&self, covariance: &Mat<f64>) -> f64 {
        covariance[(0, 0)] + covariance[(2, 2)] - 2.0 * covariance[(0, 2)]
    }

    fn curve_decades(&self) -> (f64, f64) {
        (-6.0, 2.0)
    }
}
