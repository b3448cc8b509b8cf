//! Locates the block of signature curves inside a record that also carries
//! formation cycles or full charge/discharge steps.

use super::repair::CurrentState;
use crate::domain::{Protocol, Sample};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Step indices bounding the signature curves, both inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureWindow {
    pub first_step: i64,
    pub last_step: i64,
}

#[derive(Debug, Clone, Copy)]
struct StepRun {
    step: i64,
    state: CurrentState,
    start: usize,
    end: usize,
}

impl StepRun {
    fn is_rest(&self) -> bool {
        self.state == CurrentState::Rest
    }
}

/// Finds the signature block and the sample range it covers.
///
/// Single-rate curves are recognised by relaxations split over two or more
/// consecutive rest steps: the block opens at the pulse before the first such
/// relaxation and closes at the last rest step of the last one. Multi-rate
/// curves are recognised by pulses of one direction on both sides of three
/// rest steps; the block runs from the first such pulse to the relaxation
/// after the last one. `None` means no block was recognised.
pub fn find_signature_window(
    samples: &[Sample],
    protocol: Protocol,
    zero_current_threshold: f64,
) -> Option<(SignatureWindow, Range<usize>)> {
    let runs = step_runs(samples, zero_current_threshold);
    let (first, last) = match protocol {
        Protocol::SingleRate => single_rate_bounds(&runs),
        Protocol::MultiRate => multi_rate_bounds(&runs),
    }?;
    let window = SignatureWindow {
        first_step: runs[first].step,
        last_step: runs[last].step,
    };
    Some((window, runs[first].start..runs[last].end))
}

fn step_runs(samples: &[Sample], threshold: f64) -> Vec<StepRun> {
    let mut runs: Vec<StepRun> = Vec::new();
    for (index, sample) in samples.iter().enumerate() {
        match runs.last_mut() {
            Some(run) if run.step == sample.step_index => run.end = index + 1,
            _ => runs.push(StepRun {
                step: sample.step_index,
                state: CurrentState::Rest,
                start: index,
                end: index + 1,
            }),
        }
    }
    for run in &mut runs {
        let slice = &samples[run.start..run.end];
        if slice.iter().all(|sample| sample.current.abs() <= threshold) {
            continue;
        }
        let net: f64 = slice.iter().map(|sample| sample.current).sum();
        run.state = CurrentState::classify(net, 0.0);
    }
    runs
}

fn single_rate_bounds(runs: &[StepRun]) -> Option<(usize, usize)> {
    let split_rest = |position: usize| {
        position >= 1 && runs[position].is_rest() && runs[position - 1].is_rest()
    };
    let opening = (2..runs.len())
        .find(|&position| split_rest(position) && !runs[position - 2].is_rest())?;
    let first = opening - 2;
    let last = (1..runs.len()).rev().find(|&position| split_rest(position))?;
    (first < last).then_some((first, last))
}

fn multi_rate_bounds(runs: &[StepRun]) -> Option<(usize, usize)> {
    let rests: Vec<usize> = (0..runs.len()).filter(|&position| runs[position].is_rest()).collect();
    // pulse before `rests[i]` and pulse after `rests[i + 2]`
    let bracket = |i: usize| -> Option<(usize, usize)> {
        let before = rests[i].checked_sub(1)?;
        let after = rests.get(i + 2)? + 1;
        let (head, tail) = (runs.get(before)?, runs.get(after)?);
        (!head.is_rest() && head.state == tail.state).then_some((before, after))
    };

    let first = (0..rests.len()).find_map(bracket)?.0;
    let last_pulse = (0..rests.len()).rev().find_map(bracket)?.1;
    let mut last = last_pulse;
    while runs.get(last + 1).is_some_and(StepRun::is_rest) {
        last += 1;
    }
    (first < last).then_some((first, last))
}
