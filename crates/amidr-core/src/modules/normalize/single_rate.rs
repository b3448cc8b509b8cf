use super::capacitance::CapacitanceCorrection;
use super::{CapacityPoint, Interval};
use crate::common::constants::nearest_nominal_rate;
use crate::domain::{HalfCycle, Sample};
use crate::modules::segment::Segmentation;

/// Raw per-sample quantities of one single-rate pulse, indexed from the second sample.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PulseTrace {
    pub half_cycle: HalfCycle,
    /// Label potential at the end of the trailing relaxation.
    pub cutoff_voltage: f64,
    /// |V1 - V0| across the first pulse sample.
    pub ir_drop: f64,
    pub resistance_drop: f64,
    pub mean_current: f64,
    /// Ah/V across the pulse and its relaxation.
    pub dqdv: f64,
    pub voltages: Vec<f64>,
    pub capacities: Vec<f64>,
    pub ideal_capacities: Vec<f64>,
    pub currents: Vec<f64>,
    pub cumulative_currents: Vec<f64>,
}

impl PulseTrace {
    pub(crate) fn from_segments(pulse: &[Sample], relaxation: &[Sample]) -> Option<Self> {
        if pulse.len() < 2 {
            return None;
        }
        let relaxed = relaxation.last()?;
        let first = &pulse[0];
        let dqdv = ((first.capacity - relaxed.capacity) / (first.voltage - relaxed.voltage)).abs();

        let tail = &pulse[1..];
        let currents: Vec<f64> = tail.iter().map(|sample| sample.current.abs()).collect();
        let mut running = 0.0;
        let cumulative_currents = currents
            .iter()
            .enumerate()
            .map(|(index, current)| {
                running += current;
                running / (index + 1) as f64
            })
            .collect();
        let ir_drop = (pulse[1].voltage - first.voltage).abs();

        Some(Self {
            half_cycle: HalfCycle::from_current(pulse[1].current),
            cutoff_voltage: relaxed.label_voltage(),
            ir_drop,
            resistance_drop: ir_drop / currents[0],
            mean_current: currents.iter().sum::<f64>() / currents.len() as f64,
            dqdv,
            voltages: tail.iter().map(|sample| sample.voltage).collect(),
            capacities: tail
                .iter()
                .map(|sample| (sample.capacity - first.capacity).abs())
                .collect(),
            ideal_capacities: tail
                .iter()
                .map(|sample| (dqdv * (sample.voltage - first.voltage)).abs())
                .collect(),
            currents,
            cumulative_currents,
        })
    }

    fn points(&self, rate_capacity: f64) -> Vec<CapacityPoint> {
        let mut fractions: Vec<f64> = self
            .capacities
            .iter()
            .zip(&self.ideal_capacities)
            .map(|(capacity, ideal)| capacity / ideal)
            .collect();
        let mut rates: Vec<f64> = self
            .ideal_capacities
            .iter()
            .zip(&self.cumulative_currents)
            .map(|(ideal, current)| ideal / current)
            .collect();
        fill_non_finite_pairs(&mut fractions, &mut rates);

        fractions
            .into_iter()
            .zip(rates)
            .zip(&self.cumulative_currents)
            .map(|((fraction, effective_rate), &current)| CapacityPoint {
                fraction,
                effective_rate,
                nominal_rate: nearest_nominal_rate(rate_capacity / current),
                ir_drop: self.ir_drop,
            })
            .collect()
    }
}

/// A non-finite point takes the following point's values; a trailing one takes
/// the nearest finite point before it.
fn fill_non_finite_pairs(fractions: &mut [f64], rates: &mut [f64]) {
    let bad = |fractions: &[f64], rates: &[f64], index: usize| {
        !fractions[index].is_finite() || !rates[index].is_finite()
    };
    let Some(last) = fractions.len().checked_sub(1) else {
        return;
    };
    if bad(fractions, rates, last) {
        if let Some(source) = (0..last).rev().find(|&index| !bad(fractions, rates, index)) {
            fractions[last] = fractions[source];
            rates[last] = rates[source];
        }
    }
    for index in (0..last).rev() {
        if bad(fractions, rates, index) {
            fractions[index] = fractions[index + 1];
            rates[index] = rates[index + 1];
        }
    }
}

/// One interval per pulse, each relaxed by its own open-circuit step.
pub(crate) fn single_rate_intervals(
    samples: &[Sample],
    segmentation: &Segmentation,
    capacitance_correction: bool,
    rate_capacity: f64,
) -> (Vec<Interval>, Option<CapacitanceCorrection>) {
    let mut pulses = Vec::new();
    for (pulse, relaxation) in segmentation.pulse_relaxation_pairs() {
        let pulse_samples = pulse.samples(samples);
        let relaxation_samples = relaxation.samples(samples);
        match PulseTrace::from_segments(pulse_samples, relaxation_samples) {
            Some(trace) => pulses.push((pulse, relaxation_samples, trace)),
            None => tracing::warn!(step = pulse.step_index, "pulse too short to normalise; skipped"),
        }
    }

    let correction = if capacitance_correction {
        let traces: Vec<PulseTrace> = pulses.iter().map(|(_, _, trace)| trace.clone()).collect();
        CapacitanceCorrection::estimate(&traces)
    } else {
        None
    };

    let intervals = pulses
        .into_iter()
        .map(|(pulse, relaxation_samples, mut trace)| {
            if let Some(correction) = &correction {
                correction.apply(&mut trace);
            }
            let first = &samples[pulse.start];
            let relaxed = &relaxation_samples[relaxation_samples.len() - 1];
            Interval::new(
                trace.half_cycle,
                (first.label_voltage(), relaxed.label_voltage()),
                (first.capacity, relaxed.capacity),
                trace.dqdv,
                trace.resistance_drop,
                trace.mean_current,
                vec![pulse.step_index],
                trace.points(rate_capacity),
            )
        })
        .collect();

    (intervals, correction)
}

#[cfg(test)]
mod tests {
    use super::{PulseTrace, fill_non_finite_pairs};
    use crate::domain::Sample;

    fn pulse() -> (Vec<Sample>, Vec<Sample>) {
        let pulse = vec![
            Sample::new(0.0, 3.800, -1.0e-4, 1.0e-3, 2),
            Sample::new(0.1, 3.790, -1.0e-4, 1.01e-3, 2),
            Sample::new(0.2, 3.785, -1.0e-4, 1.02e-3, 2),
            Sample::new(0.3, 3.780, -1.0e-4, 1.03e-3, 2),
        ];
        let relaxation = vec![
            Sample::new(0.4, 3.785, 0.0, 1.03e-3, 3),
            Sample::new(1.4, 3.790, 0.0, 1.03e-3, 3),
        ];
        (pulse, relaxation)
    }

    #[test]
    fn trace_uses_the_relaxed_endpoint_for_dqdv() {
        let (pulse, relaxation) = pulse();
        let trace = PulseTrace::from_segments(&pulse, &relaxation).expect("trace");

        assert!((trace.dqdv - 3.0e-3).abs() < 1.0e-9);
        assert!((trace.ir_drop - 0.010).abs() < 1.0e-12);
        assert!((trace.resistance_drop - 100.0).abs() < 1.0e-6);
        assert_eq!(trace.capacities.len(), 3);
        assert!((trace.capacities[2] - 3.0e-5).abs() < 1.0e-12);
        assert!((trace.ideal_capacities[0] - 3.0e-5).abs() < 1.0e-9);
        assert_eq!(trace.half_cycle, crate::domain::HalfCycle::Discharge);
    }

    #[test]
    fn points_carry_fraction_and_effective_rate() {
        let (pulse, relaxation) = pulse();
        let trace = PulseTrace::from_segments(&pulse, &relaxation).expect("trace");
        let points = trace.points(1.0e-3);

        // last sample: 3e-5 / (3e-3 * 0.02)
        assert!((points[2].fraction - 0.5).abs() < 1.0e-6);
        // 6e-5 Ah ideal over 1e-4 A
        assert!((points[2].effective_rate - 0.6).abs() < 1.0e-6);
        assert_eq!(points[2].nominal_rate, 10.0);
    }

    #[test]
    fn single_sample_pulses_are_rejected() {
        let (pulse, relaxation) = pulse();
        assert!(PulseTrace::from_segments(&pulse[..1], &relaxation).is_none());
        assert!(PulseTrace::from_segments(&pulse, &[]).is_none());
    }

    #[test]
    fn non_finite_points_borrow_from_neighbours() {
        let mut fractions = vec![f64::NAN, 0.2, f64::NAN, 0.4, f64::NAN];
        let mut rates = vec![1.0, 2.0, 3.0, 4.0, f64::INFINITY];
        fill_non_finite_pairs(&mut fractions, &mut rates);

        assert_eq!(fractions, vec![0.2, 0.2, 0.4, 0.4, 0.4]);
        assert_eq!(rates, vec![2.0, 2.0, 4.0, 4.0, 4.0]);
    }
}
