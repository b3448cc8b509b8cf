use super::{CapacityPoint, Interval};
use crate::common::constants::{MULTI_RATE_DQDV_RATE, nearest_nominal_rate};
use crate::domain::{AmidrError, HalfCycle, Sample, SegmentResult};
use crate::modules::segment::{Segment, Segmentation};

/// The cycler reports voltage cutoffs on a 10 mV grid.
const CUTOFF_GRID: f64 = 0.01;
const CUTOFF_GRID_TOLERANCE: f64 = 1.0e-6;
/// A cutoff this close to the previous interval's cutoff is a repeat, not a new interval.
const DUPLICATE_CUTOFF: f64 = 1.0e-3;

#[derive(Debug, Clone, PartialEq)]
struct RatePulse {
    step_index: i64,
    half_cycle: HalfCycle,
    initial_voltage: f64,
    initial_capacity: f64,
    cutoff_voltage: f64,
    cutoff_label_voltage: f64,
    cutoff_capacity: f64,
    capacity: f64,
    mean_current: f64,
    nominal_rate: f64,
    ir_drop: f64,
    dqdv: f64,
}

impl RatePulse {
    /// `None` when the pulse hit its cutoff too early to be measured.
    fn from_samples(pulse: &[Sample], rate_capacity: f64) -> Option<Self> {
        let count = pulse.len();
        if count <= 3 {
            return None;
        }
        let cutoff = if on_cutoff_grid(pulse[count - 2].voltage) {
            count - 2
        } else if count > 4 && on_cutoff_grid(pulse[count - 3].voltage) {
            count - 3
        } else {
            return None;
        };

        let untrimmed_current =
            pulse.iter().map(|sample| sample.current.abs()).sum::<f64>() / count as f64;
        let trimmed = &pulse[1..count - 1];
        let mean_current =
            trimmed.iter().map(|sample| sample.current.abs()).sum::<f64>() / trimmed.len() as f64;

        let (low, high) = pulse.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(low, high), sample| {
            (low.min(sample.capacity), high.max(sample.capacity))
        });
        let before = &pulse[cutoff - 2];
        let at = &pulse[cutoff - 1];

        Some(Self {
            step_index: pulse[0].step_index,
            half_cycle: HalfCycle::from_current(pulse[1].current),
            initial_voltage: pulse[0].label_voltage(),
            initial_capacity: pulse[0].capacity,
            cutoff_voltage: pulse[cutoff].voltage,
            cutoff_label_voltage: pulse[cutoff].label_voltage(),
            cutoff_capacity: pulse[cutoff].capacity,
            capacity: high - low,
            mean_current,
            nominal_rate: nearest_nominal_rate(rate_capacity / untrimmed_current),
            ir_drop: (pulse[0].voltage - pulse[1].voltage).abs(),
            dqdv: ((before.capacity - at.capacity) / (before.voltage - at.voltage)).abs(),
        })
    }
}

fn on_cutoff_grid(voltage: f64) -> bool {
    let steps = voltage / CUTOFF_GRID;
    (steps - steps.round()).abs() * CUTOFF_GRID < CUTOFF_GRID_TOLERANCE
}

/// Groups successive pulses that stop at the same cutoff voltage.
fn group_pulses(pulses: Vec<(RatePulse, f64)>) -> Vec<Vec<RatePulse>> {
    let mut groups: Vec<Vec<RatePulse>> = Vec::new();
    for (pulse, penultimate_voltage) in pulses {
        if let Some(group) = groups.last_mut() {
            let previous = group[group.len() - 1].cutoff_voltage;
            if (pulse.cutoff_voltage - previous).abs() < CUTOFF_GRID_TOLERANCE {
                group.push(pulse);
                continue;
            }
            if (penultimate_voltage - previous).abs() < DUPLICATE_CUTOFF {
                tracing::debug!(step = pulse.step_index, "pulse repeats the previous cutoff; skipped");
                continue;
            }
        }
        groups.push(vec![pulse]);
    }
    groups
}

fn interval_from_group(group: &[RatePulse], rate_capacity: f64, fcap_min: f64) -> Option<Interval> {
    let total: f64 = group.iter().map(|pulse| pulse.capacity).sum();
    let mut running = 0.0;
    let mut kept = Vec::with_capacity(group.len());
    for pulse in group {
        running += pulse.capacity;
        let fraction = running / total;
        if fraction < fcap_min {
            tracing::debug!(step = pulse.step_index, fraction, "pulse below minimum capacity fraction removed");
            continue;
        }
        kept.push((pulse, fraction));
    }
    let first = group.first()?;
    let last = kept.last()?.0;

    let points = kept
        .iter()
        .map(|(pulse, fraction)| CapacityPoint {
            fraction: *fraction,
            effective_rate: total / pulse.mean_current,
            nominal_rate: pulse.nominal_rate,
            ir_drop: pulse.ir_drop,
        })
        .collect();

    let dqdv_pulse = kept
        .iter()
        .map(|(pulse, _)| *pulse)
        .min_by(|lhs, rhs| {
            let lhs_gap = (rate_capacity / lhs.mean_current - MULTI_RATE_DQDV_RATE).abs();
            let rhs_gap = (rate_capacity / rhs.mean_current - MULTI_RATE_DQDV_RATE).abs();
            lhs_gap.total_cmp(&rhs_gap)
        })?;
    let resistance_drop =
        kept.iter().map(|(pulse, _)| pulse.ir_drop / pulse.mean_current).sum::<f64>() / kept.len() as f64;
    let mean_current =
        kept.iter().map(|(pulse, _)| pulse.mean_current).sum::<f64>() / kept.len() as f64;

    Some(Interval::new(
        first.half_cycle,
        (first.initial_voltage, last.cutoff_label_voltage),
        (first.initial_capacity, last.cutoff_capacity),
        dqdv_pulse.dqdv,
        resistance_drop,
        mean_current,
        kept.iter().map(|(pulse, _)| pulse.step_index).collect(),
        points,
    ))
}

/// One interval per cutoff voltage, built from the rate sequence that reached it.
pub(crate) fn multi_rate_intervals(
    samples: &[Sample],
    segmentation: &Segmentation,
    rate_capacity: f64,
    fcap_min: f64,
) -> SegmentResult<Vec<Interval>> {
    let pulse_segments: Vec<&Segment> = segmentation
        .pulse_relaxation_pairs()
        .map(|(pulse, _)| pulse)
        .collect();

    let mut pulses = Vec::with_capacity(pulse_segments.len());
    for segment in &pulse_segments {
        let pulse_samples = segment.samples(samples);
        match RatePulse::from_samples(pulse_samples, rate_capacity) {
            Some(pulse) => pulses.push((pulse, pulse_samples[pulse_samples.len() - 2].voltage)),
            None => tracing::debug!(step = segment.step_index, "pulse reached its cutoff immediately; skipped"),
        }
    }

    let groups = group_pulses(pulses);
    if !groups.is_empty() && groups.iter().all(|group| group.len() < 2) {
        return Err(AmidrError::segmentation(
            "SEGMENT.PROTOCOL_MISMATCH",
            format!(
                "no cutoff voltage was reached by more than one rate (first pulse at step {}); the file looks like a single-rate record",
                groups[0][0].step_index
            ),
        ));
    }

    Ok(groups
        .iter()
        .filter_map(|group| interval_from_group(group, rate_capacity, fcap_min))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::{RatePulse, group_pulses, interval_from_group, on_cutoff_grid};
    use crate::domain::Sample;

    fn rate_pulse(current: f64, start_capacity: f64, cutoff: f64) -> Vec<Sample> {
        trace(&[3.700, 3.690, 3.680, 3.670, cutoff, cutoff - 0.001], current, start_capacity)
    }

    fn trace(voltages: &[f64], current: f64, start_capacity: f64) -> Vec<Sample> {
        voltages
            .iter()
            .enumerate()
            .map(|(index, &voltage)| {
                Sample::new(
                    index as f64,
                    voltage,
                    -current,
                    start_capacity + current * index as f64,
                    1,
                )
            })
            .collect()
    }

    #[test]
    fn cutoff_grid_allows_float_noise() {
        assert!(on_cutoff_grid(3.66));
        assert!(on_cutoff_grid(3.660_000_000_1));
        assert!(!on_cutoff_grid(3.665));
    }

    #[test]
    fn pulse_uses_the_grid_sample_as_cutoff() {
        let pulse = RatePulse::from_samples(&rate_pulse(1.0e-4, 0.0, 3.66), 4.0e-3).expect("pulse");

        assert_eq!(pulse.cutoff_voltage, 3.66);
        assert!((pulse.capacity - 5.0e-4).abs() < 1.0e-15);
        assert!((pulse.ir_drop - 0.01).abs() < 1.0e-12);
        assert_eq!(pulse.nominal_rate, 40.0);
        // capacity 1e-4 per step over the 10 mV before the cutoff
        assert!((pulse.dqdv - 1.0e-2).abs() < 1.0e-9);
    }

    #[test]
    fn off_grid_or_short_pulses_are_skipped() {
        let off_grid = trace(&[3.701, 3.695, 3.687, 3.675, 3.665], 1.0e-4, 0.0);
        assert!(RatePulse::from_samples(&off_grid, 4.0e-3).is_none());
        assert!(RatePulse::from_samples(&rate_pulse(1.0e-4, 0.0, 3.66)[..3], 4.0e-3).is_none());
    }

    #[test]
    fn same_cutoff_pulses_form_one_interval() {
        let first = RatePulse::from_samples(&rate_pulse(1.0e-3, 0.0, 3.66), 4.0e-3).expect("first");
        let second = RatePulse::from_samples(&rate_pulse(1.0e-4, 5.0e-3, 3.66), 4.0e-3).expect("second");
        let repeat = RatePulse::from_samples(&rate_pulse(1.0e-4, 6.0e-3, 3.65), 4.0e-3).expect("repeat");
        let next = RatePulse::from_samples(&rate_pulse(1.0e-3, 7.0e-3, 3.63), 4.0e-3).expect("next");
        let groups = group_pulses(vec![
            (first, 3.66),
            (second, 3.66),
            (repeat, 3.6595),
            (next, 3.63),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1][0].cutoff_voltage, 3.63);

        let interval = interval_from_group(&groups[0], 4.0e-3, 0.0).expect("interval");
        assert_eq!(interval.points.len(), 2);
        let fractions: Vec<f64> = interval.points.iter().map(|point| point.fraction).collect();
        assert!((fractions[0] - 5.0e-3 / 5.5e-3).abs() < 1.0e-12);
        assert!((fractions[1] - 1.0).abs() < 1.0e-12);
        // total interval capacity over each pulse current, in hours
        assert!((interval.points[1].effective_rate - 55.0).abs() < 1.0e-9);
        assert_eq!(interval.step_indices.len(), 2);
        assert!((interval.dqdv - 1.0e-2).abs() < 1.0e-9);
    }

    #[test]
    fn minimum_fraction_drops_leading_pulses() {
        let first = RatePulse::from_samples(&rate_pulse(1.0e-4, 0.0, 3.66), 4.0e-3).expect("first");
        let second = RatePulse::from_samples(&rate_pulse(1.0e-3, 1.0e-3, 3.66), 4.0e-3).expect("second");
        let interval = interval_from_group(&[first, second], 4.0e-3, 0.5).expect("interval");
        assert_eq!(interval.points.len(), 1);
        assert_eq!(interval.points[0].fraction, 1.0);
    }
}
