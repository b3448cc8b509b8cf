use super::single_rate::PulseTrace;
use serde::{Deserialize, Serialize};

/// Constant-current samples needed for the double-layer line fit.
pub const CAPACITANCE_RUN_LENGTH: usize = 8;
const CONSTANT_CURRENT_TOLERANCE: f64 = 0.01;

/// Dataset-wide double-layer estimate, computed once and shared read-only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacitanceCorrection {
    /// Double-layer capacitance in Ah/V.
    pub capacitance: f64,
    /// Ohmic resistance in ohm.
    pub ohmic_resistance: f64,
    /// Position of the reference pulse among the single-rate traces.
    pub reference_pulse: usize,
}

impl CapacitanceCorrection {
    /// Estimates the correction from the pulse with the smallest applied current.
    pub(crate) fn estimate(traces: &[PulseTrace]) -> Option<Self> {
        let reference_pulse = reference_trace(traces)?;
        let trace = &traces[reference_pulse];
        let (voltages, capacities) = constant_current_run(trace)?;
        let capacitance = line_slope(&voltages, &capacities)?.abs();
        let correction = Self {
            capacitance,
            ohmic_resistance: trace.resistance_drop,
            reference_pulse,
        };
        tracing::info!(
            capacitance_nf = 1.0e9 * capacitance,
            ohmic_resistance = correction.ohmic_resistance,
            "estimated double-layer capacitance"
        );
        Some(correction)
    }

    /// Charge (Ah) stored in the double layer at every sample of a pulse.
    ///
    /// The reference is the first sample after the IR drop, so the first
    /// point carries no double-layer charge when `R_ohm = IR / I`.
    pub(crate) fn double_layer_charge(&self, trace: &PulseTrace) -> Vec<f64> {
        let (Some(&reference), Some(&last_voltage)) = (trace.voltages.first(), trace.voltages.last())
        else {
            return Vec::new();
        };
        let falling = reference > last_voltage;
        trace
            .voltages
            .iter()
            .zip(&trace.currents)
            .map(|(&voltage, &current)| {
                let ohmic = current * self.ohmic_resistance;
                let excess = if falling {
                    (reference + trace.ir_drop - ohmic) - voltage
                } else {
                    voltage - (reference - trace.ir_drop + ohmic)
                };
                self.capacitance * excess.max(0.0)
            })
            .collect()
    }

    pub(crate) fn apply(&self, trace: &mut PulseTrace) {
        let charge = self.double_layer_charge(trace);
        for (index, dl) in charge.into_iter().enumerate() {
            trace.capacities[index] = (trace.capacities[index] - dl).max(0.0);
            let ideal = trace.ideal_capacities[index] - dl;
            trace.ideal_capacities[index] = if ideal > 0.0 { ideal } else { f64::NAN };
            if !(trace.cumulative_currents[index] > 0.0) {
                trace.cumulative_currents[index] = f64::NAN;
            }
        }
    }
}

fn reference_trace(traces: &[PulseTrace]) -> Option<usize> {
    (0..traces.len()).min_by(|&lhs, &rhs| {
        traces[lhs]
            .mean_current
            .total_cmp(&traces[rhs].mean_current)
            .then_with(|| {
                traces[lhs]
                    .cutoff_voltage
                    .total_cmp(&traces[rhs].cutoff_voltage)
            })
    })
}

fn constant_current_run(trace: &PulseTrace) -> Option<(Vec<f64>, Vec<f64>)> {
    let mut voltages = Vec::with_capacity(CAPACITANCE_RUN_LENGTH);
    let mut capacities = Vec::with_capacity(CAPACITANCE_RUN_LENGTH);
    for index in 0..trace.currents.len().saturating_sub(1) {
        if voltages.len() == CAPACITANCE_RUN_LENGTH {
            break;
        }
        let ratio = trace.currents[index] / trace.currents[index + 1];
        if (ratio - 1.0).abs() < CONSTANT_CURRENT_TOLERANCE {
            voltages.push(trace.voltages[index + 1]);
            capacities.push(trace.capacities[index + 1]);
        } else {
            voltages.clear();
            capacities.clear();
        }
    }

    if voltages.len() < CAPACITANCE_RUN_LENGTH {
        tracing::warn!(
            found = voltages.len(),
            "reference pulse has no run of constant-current samples; capacitance correction skipped"
        );
        return None;
    }
    Some((voltages, capacities))
}

fn line_slope(x: &[f64], y: &[f64]) -> Option<f64> {
    let count = x.len() as f64;
    let x_mean = x.iter().sum::<f64>() / count;
    let y_mean = y.iter().sum::<f64>() / count;
    let mut covariance = 0.0;
    let mut variance = 0.0;
    for (&xi, &yi) in x.iter().zip(y) {
        covariance += (xi - x_mean) * (yi - y_mean);
        variance += (xi - x_mean).powi(2);
    }
    (variance > 0.0).then(|| covariance / variance)
}
