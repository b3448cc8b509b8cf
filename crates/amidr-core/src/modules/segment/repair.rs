use crate::domain::Sample;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairKind {
    /// Time stepped backwards; time and capacity were replaced by the neighbour midpoint.
    NonMonotonicTime,
    /// Negative potential replaced by the mean of its neighbours.
    NegativeVoltage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRepair {
    pub index: usize,
    pub kind: RepairKind,
}

/// Repairs cycler glitches in place and reports every touched row.
///
/// Neighbour values are read from the unrepaired trace, so two adjacent bad
/// rows never feed each other.
pub fn repair_samples(samples: &mut [Sample]) -> Vec<SampleRepair> {
    let unrepaired = samples.to_vec();
    let mut repairs = Vec::new();

    for index in 1..unrepaired.len() {
        if unrepaired[index].time >= unrepaired[index - 1].time {
            continue;
        }
        let Some(next) = unrepaired.get(index + 1) else {
            tracing::warn!(index, "last sample steps back in time and has no right neighbour");
            continue;
        };
        let previous = &unrepaired[index - 1];
        samples[index].time = 0.5 * (previous.time + next.time);
        samples[index].capacity = 0.5 * (previous.capacity + next.capacity);
        repairs.push(SampleRepair {
            index,
            kind: RepairKind::NonMonotonicTime,
        });
    }

    for (index, sample) in unrepaired.iter().enumerate() {
        if !(sample.voltage < 0.0) {
            continue;
        }
        let neighbours: Vec<f64> = [
            index.checked_sub(1).map(|left| unrepaired[left].voltage),
            unrepaired.get(index + 1).map(|right| right.voltage),
        ]
        .into_iter()
        .flatten()
        .collect();
        if neighbours.is_empty() {
            continue;
        }
        samples[index].voltage = neighbours.iter().sum::<f64>() / neighbours.len() as f64;
        repairs.push(SampleRepair {
            index,
            kind: RepairKind::NegativeVoltage,
        });
    }

    for repair in &repairs {
        tracing::warn!(index = repair.index, kind = ?repair.kind, "repaired cycler sample");
    }
    repairs
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CurrentState {
    Rest,
    Charge,
    Discharge,
}

impl CurrentState {
    pub(super) fn classify(current: f64, threshold: f64) -> Self {
        if current.abs() <= threshold {
            Self::Rest
        } else if current > 0.0 {
            Self::Charge
        } else {
            Self::Discharge
        }
    }
}

/// Overwrites step indices with a run counter of the current state.
///
/// Used when a file carries no step column or is stitched together from
/// several exports whose native step numbers restart.
pub fn derive_logical_steps(samples: &mut [Sample], zero_current_threshold: f64) {
    let mut step = 0_i64;
    let mut previous: Option<CurrentState> = None;
    for sample in samples.iter_mut() {
        let state = CurrentState::classify(sample.current, zero_current_threshold);
        if previous.is_some_and(|last| last != state) {
            step += 1;
        }
        previous = Some(state);
        sample.step_index = step;
    }
}

/// Drops the full-cell potential so the working-electrode potential labels every row.
///
/// Some tools read two-electrode mode the other way round and use the
/// full-cell potential for every calculation; here the working-electrode
/// potential is kept and only the labels change.
pub fn force_two_electrode(samples: &mut [Sample]) {
    for sample in samples.iter_mut() {
        sample.cell_voltage = None;
    }
}
