mod model;
mod table;

pub use model::{DiffusionModel, ResistanceCorrectedModel};
pub use table::{render_fit_table, render_model_curves};

use crate::common::config::FitOptions;
use crate::common::constants::SECONDS_PER_HOUR;
use crate::domain::{AmidrError, AmidrResult, ExecutionMode, HalfCycle, Protocol};
use crate::modules::normalize::Interval;
use crate::modules::serialization::nullable_f64;
use crate::modules::traits::{CapacityModel, ModelCurve};
use crate::numerics::atlung::CurvePoint;
use crate::numerics::{
    AtlungSeries, BoundedLeastSquares, LeastSquaresProblem, Loss, TerminationReason, mean,
    stable_weighted_sum,
};
use serde::{Deserialize, Serialize};

/// Decimal places at which a fitted `log10 P` counts as sitting on its bound.
const BOUND_MATCH_DECIMALS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Converged,
    /// The evaluation budget ran out; parameters are the last accepted iterate.
    MaxEvaluations,
}

/// Per-point comparison of the measured and fitted capacity fraction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FittedPoint {
    #[serde(with = "nullable_f64")]
    pub q: f64,
    #[serde(with = "nullable_f64")]
    pub tau: f64,
    #[serde(with = "nullable_f64")]
    pub model_tau: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub interval_index: usize,
    pub label: String,
    pub half_cycle: HalfCycle,
    pub initial_voltage: f64,
    pub cutoff_voltage: f64,
    pub midpoint_voltage: f64,
    pub voltage_width: f64,
    /// mAh/g.
    pub initial_specific_capacity: f64,
    pub midpoint_specific_capacity: f64,
    #[serde(with = "nullable_f64")]
    pub log10_diffusivity: f64,
    /// cm^2/s.
    #[serde(with = "nullable_f64")]
    pub diffusivity: f64,
    pub log10_diffusivity_std: Option<f64>,
    /// Dimensionless resistance ratio, present for resistance-corrected fits.
    pub resistance_ratio: Option<f64>,
    pub capacity_adjustment: f64,
    #[serde(with = "nullable_f64")]
    pub tau_max: f64,
    #[serde(with = "nullable_f64")]
    pub tau_min: f64,
    #[serde(with = "nullable_f64")]
    pub tau_span: f64,
    #[serde(with = "nullable_f64")]
    pub fit_error: f64,
    /// mAh/(g V).
    #[serde(with = "nullable_f64")]
    pub dqdv: f64,
    /// Ohm.
    pub resistance: Option<f64>,
    /// Ohm cm^2.
    pub contact_resistivity: Option<f64>,
    /// Ohm, from the instantaneous IR drop.
    #[serde(with = "nullable_f64")]
    pub resistance_drop: f64,
    #[serde(default)]
    pub ion_saturation: Option<f64>,
    #[serde(default)]
    pub initial_ion_saturation: Option<f64>,
    #[serde(default)]
    pub tracer_diffusivity: Option<f64>,
    pub status: FitStatus,
    pub bound_saturated: bool,
    pub evaluations: usize,
    #[serde(with = "nullable_f64")]
    pub cost: f64,
    pub points: Vec<FittedPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscardReason {
    BoundSaturated { resistance_ratio: Option<f64> },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscardedFit {
    pub interval_index: usize,
    pub label: String,
    pub reason: DiscardReason,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FitReport {
    pub fits: Vec<FitResult>,
    pub discarded: Vec<DiscardedFit>,
}

struct WeightedResiduals<'a, M: ?Sized> {
    model: &'a M,
    fractions: &'a [f64],
    rates: &'a [f64],
    sigma: Option<&'a [f64]>,
}

impl<M> LeastSquaresProblem for WeightedResiduals<'_, M>
where
    M: CapacityModel + ?Sized,
{
    fn residuals(&self, parameters: &[f64]) -> Vec<f64> {
        let balance = self.model.balance(parameters, self.fractions, self.rates);
        match self.sigma {
            Some(sigma) => balance
                .iter()
                .zip(sigma)
                .map(|(value, sigma)| (value - 1.0) / sigma)
                .collect(),
            None => balance.iter().map(|value| value - 1.0).collect(),
        }
    }
}

/// Point weights from the IR drops, `(sum IR - IR_k) / sum(sum IR - IR_j)`.
///
/// `None` unless every weight is positive, which needs at least two points
/// and no single pulse carrying the whole drop.
pub fn ir_drop_weights(ir_drops: &[f64]) -> Option<Vec<f64>> {
    let total: f64 = ir_drops.iter().sum();
    let raw: Vec<f64> = ir_drops.iter().map(|drop| total - drop).collect();
    let norm: f64 = raw.iter().sum();
    if !(norm > 0.0 && norm.is_finite()) {
        return None;
    }
    let weights: Vec<f64> = raw.iter().map(|value| value / norm).collect();
    weights
        .iter()
        .all(|weight| *weight > 0.0 && weight.is_finite())
        .then_some(weights)
}

/// Fits every interval of one cell with the configured model.
#[derive(Debug, Clone)]
pub struct DiffusivityFitter {
    options: FitOptions,
    protocol: Protocol,
    /// Active material mass in g.
    mass: f64,
    series: AtlungSeries,
}

impl DiffusivityFitter {
    pub fn new(options: &FitOptions, protocol: Protocol, mass: f64) -> AmidrResult<Self> {
        options.validate()?;
        if !(mass > 0.0) {
            return Err(AmidrError::configuration(
                "CONFIG.MASS",
                format!("active material mass must be positive, got {mass} g"),
            ));
        }
        let series = AtlungSeries::new(options.geometry()?, options.expansion_terms)
            .map_err(|error| AmidrError::computation("FIT.SERIES", error.to_string()))?;
        Ok(Self {
            options: options.clone(),
            protocol,
            mass,
            series,
        })
    }

    pub fn series(&self) -> &AtlungSeries {
        &self.series
    }

    pub fn fit(&self, interval: &Interval) -> AmidrResult<FitResult> {
        if self.options.resistance_corrected {
            self.fit_with(
                &ResistanceCorrectedModel::new(&self.series, &self.options, self.protocol),
                interval,
            )
        } else {
            self.fit_with(
                &DiffusionModel::new(&self.series, &self.options, self.protocol),
                interval,
            )
        }
    }

    /// Fits all intervals; the report keeps interval order whatever the execution mode.
    pub fn fit_all(&self, intervals: &[Interval]) -> FitReport {
        let mut outcomes = match self.options.execution_mode {
            ExecutionMode::Serial => self.fit_serial(intervals),
            ExecutionMode::Parallel => self.fit_parallel(intervals),
        };
        outcomes.sort_by_key(|(interval, _)| interval.index);

        let mut report = FitReport::default();
        for (interval, outcome) in outcomes {
            match outcome {
                Ok(fit) if fit.bound_saturated && self.options.remove_out_of_bounds => {
                    tracing::warn!(
                        interval = %fit.label,
                        "resistance ratio pinned at its bound; fit discarded"
                    );
                    report.discarded.push(DiscardedFit {
                        interval_index: fit.interval_index,
                        label: fit.label,
                        reason: DiscardReason::BoundSaturated {
                            resistance_ratio: fit.resistance_ratio,
                        },
                    });
                }
                Ok(fit) => {
                    if fit.bound_saturated {
                        tracing::warn!(interval = %fit.label, "resistance ratio pinned at its bound");
                    }
                    report.fits.push(fit);
                }
                Err(error) => {
                    tracing::warn!(interval = %interval.label, %error, "fit failed");
                    report.discarded.push(DiscardedFit {
                        interval_index: interval.index,
                        label: interval.label.clone(),
                        reason: DiscardReason::Failed {
                            message: error.to_string(),
                        },
                    });
                }
            }
        }
        report
    }

    /// Model `(Q, tau)` curve through the fitted parameters of `fit`.
    pub fn model_curve(&self, fit: &FitResult, count: usize) -> Vec<CurvePoint> {
        match fit.resistance_ratio {
            Some(ratio) => {
                let model = ResistanceCorrectedModel::new(&self.series, &self.options, self.protocol);
                let log_ratio = ratio.log10();
                model.model_curve(
                    &[log_ratio - fit.log10_diffusivity, fit.capacity_adjustment, log_ratio],
                    count,
                )
            }
            None => DiffusionModel::new(&self.series, &self.options, self.protocol)
                .model_curve(&[fit.log10_diffusivity, fit.capacity_adjustment], count),
        }
    }

    fn fit_serial<'a>(&self, intervals: &'a [Interval]) -> Vec<(&'a Interval, AmidrResult<FitResult>)> {
        intervals
            .iter()
            .map(|interval| (interval, self.fit(interval)))
            .collect()
    }

    #[cfg(feature = "parallel")]
    fn fit_parallel<'a>(
        &self,
        intervals: &'a [Interval],
    ) -> Vec<(&'a Interval, AmidrResult<FitResult>)> {
        use rayon::prelude::*;

        intervals
            .par_iter()
            .map(|interval| (interval, self.fit(interval)))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn fit_parallel<'a>(
        &self,
        intervals: &'a [Interval],
    ) -> Vec<(&'a Interval, AmidrResult<FitResult>)> {
        tracing::warn!("built without the parallel feature; fitting serially");
        self.fit_serial(intervals)
    }

    fn fit_with<M>(&self, model: &M, interval: &Interval) -> AmidrResult<FitResult>
    where
        M: CapacityModel,
    {
        let fractions = interval.fractions();
        let rates = interval.effective_rates();
        let weights = if self.options.resistance_corrected {
            None
        } else {
            ir_drop_weights(&interval.ir_drops())
        };

        let space = model.parameter_space();
        let solver = BoundedLeastSquares::new(space.lower, space.upper)
            .map_err(|error| AmidrError::computation("FIT.OPTIMIZER", error.to_string()))?
            .with_loss(Loss::SoftL1)
            .with_ftol(self.options.ftol)
            .with_max_evaluations(self.options.max_evaluations);
        let problem = WeightedResiduals {
            model,
            fractions: &fractions,
            rates: &rates,
            sigma: weights.as_deref(),
        };
        let outcome = solver.minimize(&problem, &space.initial).map_err(|error| {
            AmidrError::computation(
                "FIT.OPTIMIZER",
                format!("interval {}: {}", interval.label, error),
            )
        })?;

        let parameters = &outcome.parameters;
        let diffusivity = model.diffusivity(parameters);
        let ratio = model.resistance(parameters);
        let capacity_adjustment = model.capacity_adjustment(parameters);
        let radius = model.particle_radius();

        let points: Vec<FittedPoint> = fractions
            .iter()
            .zip(&rates)
            .map(|(&fraction, &rate)| {
                let q = model.time_constant(diffusivity, rate);
                FittedPoint {
                    q,
                    tau: fraction / capacity_adjustment,
                    model_tau: self.series.solve_tau(q, ratio),
                }
            })
            .collect();
        let tau_min = points.first().map_or(f64::NAN, |point| point.tau);
        let tau_max = points.last().map_or(f64::NAN, |point| point.tau);
        let errors: Vec<f64> = points
            .iter()
            .map(|point| (point.tau - point.model_tau).abs())
            .collect();

        let resistance_corrected = self.options.resistance_corrected;
        let fit_error = if resistance_corrected {
            let scaled: Vec<f64> = errors.iter().map(|error| (error / tau_max).powi(2)).collect();
            mean(&scaled).map_or(f64::NAN, f64::sqrt)
        } else {
            let uniform = vec![1.0 / errors.len() as f64; errors.len()];
            stable_weighted_sum(&errors, weights.as_deref().unwrap_or(&uniform)).unwrap_or(f64::NAN)
        };

        let log10_diffusivity_std = outcome
            .covariance()
            .map(|covariance| model.log10_diffusivity_variance(&covariance))
            .filter(|variance| variance.is_finite() && *variance >= 0.0)
            .map(f64::sqrt);

        let (resistance_ratio, resistance, contact_resistivity, bound_saturated) =
            if resistance_corrected {
                let resistance = (interval.dqdv > 0.0).then(|| {
                    ratio * radius.powi(2)
                        / (SECONDS_PER_HOUR * diffusivity * interval.dqdv)
                });
                let contact = resistance.map(|resistance| {
                    model.series().shape_a() * resistance * self.mass
                        / (radius * self.options.active_material_density)
                });
                (
                    Some(ratio),
                    resistance,
                    contact,
                    self.ratio_on_bound(ratio),
                )
            } else {
                (None, None, None, false)
            };

        let status = match outcome.termination {
            TerminationReason::MaxEvaluations => {
                tracing::warn!(
                    interval = %interval.label,
                    evaluations = outcome.evaluations,
                    "optimizer hit its evaluation budget"
                );
                FitStatus::MaxEvaluations
            }
            _ => FitStatus::Converged,
        };
        tracing::debug!(
            interval = %interval.label,
            model = model.name(),
            diffusivity,
            resistance_ratio = ratio,
            cost = outcome.cost,
            evaluations = outcome.evaluations,
            "fit finished"
        );

        let specific = 1000.0 / self.mass;
        Ok(FitResult {
            interval_index: interval.index,
            label: interval.label.clone(),
            half_cycle: interval.half_cycle,
            initial_voltage: interval.initial_voltage,
            cutoff_voltage: interval.cutoff_voltage,
            midpoint_voltage: interval.midpoint_voltage(),
            voltage_width: interval.voltage_width(),
            initial_specific_capacity: interval.initial_capacity * specific,
            midpoint_specific_capacity: interval.midpoint_capacity() * specific,
            log10_diffusivity: diffusivity.log10(),
            diffusivity,
            log10_diffusivity_std,
            resistance_ratio,
            capacity_adjustment,
            tau_max,
            tau_min,
            tau_span: tau_max - tau_min,
            fit_error,
            dqdv: interval.dqdv * specific,
            resistance,
            contact_resistivity,
            resistance_drop: interval.resistance_drop,
            ion_saturation: None,
            initial_ion_saturation: None,
            tracer_diffusivity: None,
            status,
            bound_saturated,
            evaluations: outcome.evaluations,
            cost: outcome.cost,
            points,
        })
    }

    fn ratio_on_bound(&self, ratio: f64) -> bool {
        let round = |value: f64| {
            let scale = 10f64.powi(BOUND_MATCH_DECIMALS);
            (value * scale).round() / scale
        };
        let fitted = round(ratio.log10());
        fitted == round(self.options.p_bounds.lower.log10())
            || fitted == round(self.options.p_bounds.upper.log10())
    }
}

#[cfg(test)]
mod tests {
    use super::{DiffusivityFitter, FitStatus, ir_drop_weights};
    use crate::common::config::FitOptions;
    use crate::domain::{AmidrErrorCategory, ExecutionMode, HalfCycle, Protocol};
    use crate::modules::normalize::{CapacityPoint, Interval};

    const RADIUS: f64 = 1.0e-4;

    fn options(resistance_corrected: bool) -> FitOptions {
        FitOptions {
            particle_radius: RADIUS,
            resistance_corrected,
            expansion_terms: 400,
            ..FitOptions::default()
        }
    }

    /// Points sampled from the model curve at `D` and `P`, one per decade-ish of Q.
    fn synthetic_interval(
        fitter: &DiffusivityFitter,
        index: usize,
        diffusivity: f64,
        ratio: f64,
    ) -> Interval {
        let points = [0.1, 0.3, 1.0, 3.0, 10.0, 30.0, 100.0]
            .iter()
            .map(|&q| CapacityPoint {
                fraction: fitter.series().solve_tau(q, ratio),
                effective_rate: q * RADIUS * RADIUS / (3600.0 * diffusivity),
                nominal_rate: 1.0,
                ir_drop: 0.01,
            })
            .collect();
        Interval {
            index,
            label: format!("interval {index}"),
            half_cycle: HalfCycle::Discharge,
            initial_voltage: 3.8,
            cutoff_voltage: 3.75,
            initial_capacity: 1.0e-3,
            cutoff_capacity: 1.1e-3,
            dqdv: 2.0e-3,
            resistance_drop: 50.0,
            mean_current: 1.0e-4,
            step_indices: vec![index as i64],
            points,
        }
    }

    #[test]
    fn weights_need_more_than_one_point() {
        assert_eq!(ir_drop_weights(&[0.01]), None);
        let weights = ir_drop_weights(&[0.01, 0.03]).expect("weights");
        assert!((weights[0] - 0.75).abs() < 1.0e-12);
        assert!((weights[1] - 0.25).abs() < 1.0e-12);
    }

    #[test]
    fn plain_fit_recovers_the_generating_diffusivity() {
        let fitter = DiffusivityFitter::new(&options(false), Protocol::SingleRate, 0.01)
            .expect("fitter");
        let interval = synthetic_interval(&fitter, 0, 3.0e-12, 0.0);
        let fit = fitter.fit(&interval).expect("fit");

        assert_eq!(fit.status, FitStatus::Converged);
        assert!((fit.log10_diffusivity - 3.0e-12f64.log10()).abs() < 1.0e-3);
        assert_eq!(fit.resistance_ratio, None);
        assert!(fit.fit_error < 1.0e-4);
        assert!((fit.dqdv - 200.0).abs() < 1.0e-9);
        assert!((fit.initial_specific_capacity - 100.0).abs() < 1.0e-9);
        assert!((fit.midpoint_specific_capacity - 105.0).abs() < 1.0e-9);
        assert!(fit.tau_span > 0.4);
    }

    #[test]
    fn ordering_is_stable_across_execution_modes() {
        let serial = DiffusivityFitter::new(&options(false), Protocol::SingleRate, 0.01)
            .expect("fitter");
        let intervals: Vec<Interval> = [1.0e-12, 1.0e-11, 1.0e-13]
            .iter()
            .enumerate()
            .map(|(index, &diffusivity)| synthetic_interval(&serial, index, diffusivity, 0.0))
            .collect();
        let parallel = DiffusivityFitter::new(
            &FitOptions {
                execution_mode: ExecutionMode::Parallel,
                ..options(false)
            },
            Protocol::SingleRate,
            0.01,
        )
        .expect("fitter");

        let lhs = serial.fit_all(&intervals);
        let rhs = parallel.fit_all(&intervals);
        let order: Vec<usize> = rhs.fits.iter().map(|fit| fit.interval_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn saturated_resistance_is_discarded_when_requested() {
        let fitter = DiffusivityFitter::new(
            &FitOptions {
                p_bounds: crate::common::config::Bounds::new(0.1, 10.0),
                p_guess: 1.0,
                ..options(true)
            },
            Protocol::SingleRate,
            0.01,
        )
        .expect("fitter");
        // generated without resistance, so P runs into its lower bound
        let interval = synthetic_interval(&fitter, 0, 1.0e-12, 0.0);

        let report = fitter.fit_all(std::slice::from_ref(&interval));
        assert!(report.fits.is_empty());
        assert_eq!(report.discarded.len(), 1);
        assert_eq!(report.discarded[0].interval_index, 0);
    }

    #[test]
    fn invalid_options_fail_before_fitting() {
        let error = DiffusivityFitter::new(&FitOptions::default(), Protocol::SingleRate, 0.01)
            .expect_err("missing radius");
        assert_eq!(error.category(), AmidrErrorCategory::ConfigurationError);

        let error = DiffusivityFitter::new(&options(false), Protocol::SingleRate, 0.0)
            .expect_err("missing mass");
        assert_eq!(error.placeholder(), "CONFIG.MASS");
    }

    #[test]
    fn model_curve_spans_more_decades_with_resistance() {
        let fitter = DiffusivityFitter::new(&options(false), Protocol::SingleRate, 0.01)
            .expect("fitter");
        let fit = fitter
            .fit(&synthetic_interval(&fitter, 0, 1.0e-12, 0.0))
            .expect("fit");
        let curve = fitter.model_curve(&fit, 51);
        assert_eq!(curve.len(), 51);
        assert!((curve[0].q - 1.0e-3).abs() < 1.0e-15);
    }
}
