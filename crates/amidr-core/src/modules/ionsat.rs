//! Calibrated ion saturation and the tracer diffusivity derived from it.
//!
//! The measured specific capacity of a cell drifts from the true lithium
//! content, so it is mapped linearly onto an independent reference
//! measurement before the thermodynamic factor is formed.

use crate::common::config::IonSaturationInputs;
use crate::common::constants::{BOLTZMANN, ELEMENTARY_CHARGE};
use crate::domain::{AmidrError, ConfigResult};
use crate::modules::fit::FitResult;
use crate::modules::normalize::Interval;
use crate::numerics::{deterministic_argsort, interpolate_linear};
use serde::{Deserialize, Serialize};

/// Linear map `calibrated = slope * measured + offset` between specific capacities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacityCalibration {
    pub slope: f64,
    pub offset: f64,
}

impl CapacityCalibration {
    /// Passes exactly through `(measured[i], reference[i])`.
    pub fn through(measured: [f64; 2], reference: [f64; 2]) -> ConfigResult<Self> {
        let span = measured[1] - measured[0];
        if !(span.abs() > 0.0) || !span.is_finite() {
            return Err(AmidrError::configuration(
                "CONFIG.ION_SATURATION",
                format!(
                    "measured capacities at the reference voltages coincide ({} and {})",
                    measured[0], measured[1]
                ),
            ));
        }
        let slope = (reference[1] - reference[0]) / span;
        Ok(Self {
            slope,
            offset: reference[0] - slope * measured[0],
        })
    }

    pub fn calibrate(&self, measured: f64) -> f64 {
        self.slope * measured + self.offset
    }
}

pub struct IonSaturationCalculator<'a> {
    inputs: &'a IonSaturationInputs,
    /// Active material mass in g.
    mass: f64,
}

impl<'a> IonSaturationCalculator<'a> {
    pub fn new(inputs: &'a IonSaturationInputs, mass: f64) -> Self {
        Self { inputs, mass }
    }

    /// Calibration from the cell's own (initial voltage, initial capacity) curve.
    ///
    /// `None`, with a warning, when a reference voltage lies outside the
    /// measured range.
    pub fn calibration(&self, intervals: &[Interval]) -> Option<CapacityCalibration> {
        let voltages: Vec<f64> = intervals.iter().map(|interval| interval.initial_voltage).collect();
        let order = deterministic_argsort(&voltages);
        let x: Vec<f64> = order.iter().map(|&index| voltages[index]).collect();
        let y: Vec<f64> = order
            .iter()
            .map(|&index| intervals[index].initial_capacity * 1000.0 / self.mass)
            .collect();

        let [first, second] = self.inputs.reference_points;
        let mut measured = [0.0; 2];
        for (slot, point) in measured.iter_mut().zip([first, second]) {
            match interpolate_linear(point.voltage, &x, &y) {
                Some(value) => *slot = value,
                None => {
                    tracing::warn!(
                        reference_voltage = point.voltage,
                        "reference voltage outside the measured range; ion saturation omitted"
                    );
                    return None;
                }
            }
        }

        match CapacityCalibration::through(
            measured,
            [first.specific_capacity, second.specific_capacity],
        ) {
            Ok(calibration) => Some(calibration),
            Err(error) => {
                tracing::warn!(%error, "ion saturation omitted");
                None
            }
        }
    }

    /// Fills ion saturation and `D_t*` on every fit; returns whether anything was filled.
    pub fn apply(&self, intervals: &[Interval], fits: &mut [FitResult]) -> bool {
        let Some(calibration) = self.calibration(intervals) else {
            return false;
        };
        let theoretical = self.inputs.theoretical_capacity;
        let thermal_voltage = BOLTZMANN * self.inputs.temperature / ELEMENTARY_CHARGE;

        for fit in fits.iter_mut() {
            let calibrated = calibration.calibrate(fit.midpoint_specific_capacity);
            let initial = calibration.calibrate(fit.initial_specific_capacity);
            let saturation = calibrated / theoretical;
            fit.ion_saturation = Some(saturation);
            fit.initial_ion_saturation = Some(initial / theoretical);

            let denominator = calibrated * (1.0 - saturation);
            fit.tracer_diffusivity = (denominator != 0.0)
                .then(|| fit.diffusivity * thermal_voltage * fit.dqdv / denominator)
                .filter(|value| value.is_finite());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::{CapacityCalibration, IonSaturationCalculator};
    use crate::common::config::{IonSaturationInputs, ReferencePoint};
    use crate::domain::HalfCycle;
    use crate::modules::fit::{FitResult, FitStatus};
    use crate::modules::normalize::Interval;

    fn inputs() -> IonSaturationInputs {
        IonSaturationInputs {
            temperature: 298.15,
            theoretical_capacity: 275.0,
            reference_points: [
                ReferencePoint {
                    voltage: 3.7,
                    specific_capacity: 66.0,
                },
                ReferencePoint {
                    voltage: 4.0,
                    specific_capacity: 149.0,
                },
            ],
        }
    }

    fn interval(voltage: f64, capacity: f64) -> Interval {
        Interval {
            index: 0,
            label: String::new(),
            half_cycle: HalfCycle::Charge,
            initial_voltage: voltage,
            cutoff_voltage: voltage + 0.05,
            initial_capacity: capacity,
            cutoff_capacity: capacity,
            dqdv: 1.0e-3,
            resistance_drop: 0.0,
            mean_current: 1.0e-4,
            step_indices: vec![],
            points: vec![],
        }
    }

    fn fit(midpoint: f64) -> FitResult {
        FitResult {
            interval_index: 0,
            label: String::new(),
            half_cycle: HalfCycle::Charge,
            initial_voltage: 3.8,
            cutoff_voltage: 3.85,
            midpoint_voltage: 3.825,
            voltage_width: 0.05,
            initial_specific_capacity: midpoint,
            midpoint_specific_capacity: midpoint,
            log10_diffusivity: -11.0,
            diffusivity: 1.0e-11,
            log10_diffusivity_std: None,
            resistance_ratio: None,
            capacity_adjustment: 1.0,
            tau_max: 1.0,
            tau_min: 0.5,
            tau_span: 0.5,
            fit_error: 0.0,
            dqdv: 300.0,
            resistance: None,
            contact_resistivity: None,
            resistance_drop: 0.0,
            ion_saturation: None,
            initial_ion_saturation: None,
            tracer_diffusivity: None,
            status: FitStatus::Converged,
            bound_saturated: false,
            evaluations: 1,
            cost: 0.0,
            points: vec![],
        }
    }

    #[test]
    fn calibration_is_identity_at_the_reference_points() {
        let calibration =
            CapacityCalibration::through([66.0, 149.0], [66.0, 149.0]).expect("calibration");
        assert!((calibration.calibrate(66.0) - 66.0).abs() < 1.0e-12);
        assert!((calibration.calibrate(149.0) - 149.0).abs() < 1.0e-12);

        let shifted = CapacityCalibration::through([60.0, 140.0], [66.0, 149.0]).expect("calibration");
        assert!((shifted.calibrate(60.0) - 66.0).abs() < 1.0e-12);
        assert!((shifted.calibrate(140.0) - 149.0).abs() < 1.0e-12);
    }

    #[test]
    fn coincident_measurements_cannot_calibrate() {
        let error = CapacityCalibration::through([70.0, 70.0], [66.0, 149.0]).expect_err("flat");
        assert_eq!(error.placeholder(), "CONFIG.ION_SATURATION");
    }

    #[test]
    fn measured_capacity_is_interpolated_at_reference_voltages() {
        let inputs = inputs();
        // mass 0.01 g: 1e-3 Ah is 100 mAh/g
        let intervals = vec![
            interval(4.1, 1.6e-3),
            interval(3.6, 0.6e-3),
            interval(3.85, 1.1e-3),
        ];
        let calibration = IonSaturationCalculator::new(&inputs, 0.01)
            .calibration(&intervals)
            .expect("calibration");

        // 3.7 V sits at 80 mAh/g and 4.0 V at 140 mAh/g
        assert!((calibration.calibrate(80.0) - 66.0).abs() < 1.0e-9);
        assert!((calibration.calibrate(140.0) - 149.0).abs() < 1.0e-9);
    }

    #[test]
    fn out_of_range_reference_omits_ion_saturation() {
        let inputs = inputs();
        let intervals = vec![interval(3.8, 1.0e-3), interval(3.9, 1.2e-3)];
        let mut fits = vec![fit(100.0)];
        let filled = IonSaturationCalculator::new(&inputs, 0.01).apply(&intervals, &mut fits);

        assert!(!filled);
        assert_eq!(fits[0].ion_saturation, None);
        assert_eq!(fits[0].tracer_diffusivity, None);
    }

    #[test]
    fn tracer_diffusivity_uses_the_thermodynamic_factor() {
        let inputs = inputs();
        let intervals = vec![interval(3.6, 0.66e-3), interval(4.1, 1.49e-3)];
        let mut fits = vec![fit(110.0)];
        let calculator = IonSaturationCalculator::new(&inputs, 0.01);
        assert!(calculator.apply(&intervals, &mut fits));

        let calibration = calculator.calibration(&intervals).expect("calibration");
        let calibrated = calibration.calibrate(110.0);
        let saturation = calibrated / 275.0;
        let thermal = 1.380_649e-23 * 298.15 / 1.602_176_634e-19;
        let expected = 1.0e-11 * thermal * 300.0 / (calibrated * (1.0 - saturation));

        assert!((fits[0].ion_saturation.expect("saturation") - saturation).abs() < 1.0e-12);
        let tracer = fits[0].tracer_diffusivity.expect("tracer");
        assert!((tracer - expected).abs() / expected < 1.0e-12);
    }
}
