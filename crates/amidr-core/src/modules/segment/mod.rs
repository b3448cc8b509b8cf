mod repair;
mod window;

pub use repair::{
    RepairKind, SampleRepair, derive_logical_steps, force_two_electrode, repair_samples,
};
pub use window::{SignatureWindow, find_signature_window};

use crate::common::config::SegmentationOptions;
use crate::domain::{AmidrError, HalfCycle, Sample, SegmentResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Pulse,
    Relaxation,
}

/// A run of samples sharing one step, or a merged run of rest steps.
///
/// `start..end` indexes the prepared sample vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub step_index: i64,
    pub start: usize,
    pub end: usize,
    pub mean_current: f64,
    pub start_capacity: f64,
    pub end_capacity: f64,
    pub start_voltage: f64,
    pub end_voltage: f64,
    pub duration: f64,
}

impl Segment {
    fn from_samples(kind: SegmentKind, samples: &[Sample], start: usize, end: usize) -> Self {
        let slice = &samples[start..end];
        let first = &slice[0];
        let last = &slice[slice.len() - 1];
        let mean_current =
            slice.iter().map(|sample| sample.current).sum::<f64>() / slice.len() as f64;
        Self {
            kind,
            step_index: first.step_index,
            start,
            end,
            mean_current,
            start_capacity: first.capacity,
            end_capacity: last.capacity,
            start_voltage: first.voltage,
            end_voltage: last.voltage,
            duration: last.time - first.time,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn samples<'a>(&self, samples: &'a [Sample]) -> &'a [Sample] {
        &samples[self.start..self.end]
    }

    pub fn half_cycle(&self) -> HalfCycle {
        HalfCycle::from_current(self.mean_current)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segmentation {
    pub segments: Vec<Segment>,
    /// Position in `segments` of a trailing pulse that never relaxed.
    pub unmatched_pulse: Option<usize>,
}

impl Segmentation {
    /// Pulses paired with the relaxation that follows them, in file order.
    pub fn pulse_relaxation_pairs(&self) -> impl Iterator<Item = (&Segment, &Segment)> {
        self.segments.windows(2).filter_map(|pair| {
            (pair[0].kind == SegmentKind::Pulse && pair[1].kind == SegmentKind::Relaxation)
                .then_some((&pair[0], &pair[1]))
        })
    }

    pub fn pulse_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| segment.kind == SegmentKind::Pulse)
            .count()
    }
}

/// Samples ready for segmentation, plus what was done to them.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSamples {
    pub samples: Vec<Sample>,
    /// Indices refer to the record's samples, before trimming.
    pub repairs: Vec<SampleRepair>,
    pub window: Option<SignatureWindow>,
}

/// Applies the optional sample transforms, repairs glitches and trims the
/// record to its signature curves.
///
/// A record with no recognisable signature block is kept whole.
pub fn prepare_samples(samples: &[Sample], options: &SegmentationOptions) -> PreparedSamples {
    let mut prepared = samples.to_vec();
    if options.force_two_electrode {
        force_two_electrode(&mut prepared);
    }
    let repairs = repair_samples(&mut prepared);
    if options.spliced {
        derive_logical_steps(&mut prepared, options.zero_current_threshold);
    }

    let window = match find_signature_window(
        &prepared,
        options.protocol,
        options.zero_current_threshold,
    ) {
        Some((window, range)) => {
            tracing::info!(
                first_step = window.first_step,
                last_step = window.last_step,
                "found signature curves"
            );
            prepared.truncate(range.end);
            prepared.drain(..range.start);
            Some(window)
        }
        None => {
            tracing::info!("no signature block recognised; analysing the whole record");
            None
        }
    };

    PreparedSamples {
        samples: prepared,
        repairs,
        window,
    }
}

pub struct RecordSegmenter<'a> {
    options: &'a SegmentationOptions,
}

impl<'a> RecordSegmenter<'a> {
    pub fn new(options: &'a SegmentationOptions) -> Self {
        Self { options }
    }

    /// Splits prepared samples into alternating pulses and relaxations.
    ///
    /// Errors carry the step index that broke the expected pattern. A pulse
    /// left open at the end of the file is reported through
    /// [`Segmentation::unmatched_pulse`] instead.
    pub fn segment(&self, samples: &[Sample]) -> SegmentResult<Segmentation> {
        if samples.is_empty() {
            return Err(AmidrError::segmentation(
                "SEGMENT.EMPTY",
                "record contains no samples",
            ));
        }
        if !self.options.spliced {
            validate_step_order(samples)?;
        }

        let mut segments: Vec<Segment> = Vec::new();
        for (start, end) in step_runs(samples) {
            let kind = self.classify(&samples[start..end])?;
            if let Some(last) = segments.last_mut() {
                if last.kind == SegmentKind::Relaxation && kind == SegmentKind::Relaxation {
                    *last = Segment::from_samples(kind, samples, last.start, end);
                    continue;
                }
                if last.kind == SegmentKind::Pulse && kind == SegmentKind::Pulse {
                    return Err(AmidrError::segmentation(
                        "SEGMENT.MISSING_RELAXATION",
                        format!(
                            "pulse at step {} is followed by pulse at step {} without a relaxation",
                            last.step_index, samples[start].step_index
                        ),
                    ));
                }
            }
            segments.push(Segment::from_samples(kind, samples, start, end));
        }

        let unmatched_pulse = segments
            .last()
            .filter(|segment| segment.kind == SegmentKind::Pulse)
            .map(|_| segments.len() - 1);
        if let Some(position) = unmatched_pulse {
            tracing::warn!(
                step = segments[position].step_index,
                "trailing pulse has no relaxation and will not be analysed"
            );
        }

        Ok(Segmentation {
            segments,
            unmatched_pulse,
        })
    }

    fn classify(&self, run: &[Sample]) -> SegmentResult<SegmentKind> {
        let threshold = self.options.zero_current_threshold;
        let charging = run.iter().any(|sample| sample.current > threshold);
        let discharging = run.iter().any(|sample| sample.current < -threshold);
        match (charging, discharging) {
            (false, false) => Ok(SegmentKind::Relaxation),
            (true, true) => Err(AmidrError::segmentation(
                "SEGMENT.MIXED_CURRENT",
                format!(
                    "step {} switches between charge and discharge current",
                    run[0].step_index
                ),
            )),
            _ => Ok(SegmentKind::Pulse),
        }
    }
}

fn step_runs(samples: &[Sample]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start = 0;
    for index in 1..=samples.len() {
        if index == samples.len() || samples[index].step_index != samples[start].step_index {
            runs.push((start, index));
            start = index;
        }
    }
    runs
}

/// Step numbers must never decrease unless the record was re-stepped as spliced.
pub fn validate_step_order(samples: &[Sample]) -> SegmentResult<()> {
    for pair in samples.windows(2) {
        if pair[1].step_index < pair[0].step_index {
            return Err(AmidrError::segmentation(
                "SEGMENT.STEP_ORDER",
                format!(
                    "step index decreases from {} to {}; mark the file as spliced",
                    pair[0].step_index, pair[1].step_index
                ),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{RecordSegmenter, RepairKind, SegmentKind, prepare_samples, validate_step_order};
    use crate::common::config::SegmentationOptions;
    use crate::domain::{AmidrErrorCategory, Sample};

    fn trace(steps: &[(i64, f64, usize)]) -> Vec<Sample> {
        let mut samples = Vec::new();
        let mut time = 0.0;
        let mut capacity = 0.0;
        for &(step, current, count) in steps {
            for _ in 0..count {
                capacity += current * 0.1;
                samples.push(Sample::new(time, 3.7, current, capacity, step));
                time += 0.1;
            }
        }
        samples
    }

    #[test]
    fn alternating_steps_become_pulse_relaxation_pairs() {
        let options = SegmentationOptions::default();
        let samples = trace(&[(1, 0.0, 3), (2, -1.0e-3, 4), (3, 0.0, 3), (4, -1.0e-3, 4), (5, 0.0, 2)]);
        let segmentation = RecordSegmenter::new(&options)
            .segment(&samples)
            .expect("segmentation");

        assert_eq!(segmentation.segments.len(), 5);
        assert_eq!(segmentation.pulse_count(), 2);
        assert_eq!(segmentation.unmatched_pulse, None);
        let pairs: Vec<_> = segmentation.pulse_relaxation_pairs().collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0.step_index, 2);
        assert_eq!(pairs[1].1.step_index, 5);
        assert_eq!(pairs[0].0.len(), 4);
    }

    #[test]
    fn consecutive_rest_steps_merge() {
        let options = SegmentationOptions::default();
        let samples = trace(&[(1, 1.0e-3, 3), (2, 0.0, 3), (3, 0.0, 3)]);
        let segmentation = RecordSegmenter::new(&options)
            .segment(&samples)
            .expect("segmentation");

        assert_eq!(segmentation.segments.len(), 2);
        assert_eq!(segmentation.segments[1].kind, SegmentKind::Relaxation);
        assert_eq!(segmentation.segments[1].len(), 6);
    }

    #[test]
    fn trailing_pulse_is_flagged_not_dropped() {
        let options = SegmentationOptions::default();
        let samples = trace(&[(1, 1.0e-3, 3), (2, 0.0, 3), (3, 1.0e-3, 3)]);
        let segmentation = RecordSegmenter::new(&options)
            .segment(&samples)
            .expect("segmentation");

        assert_eq!(segmentation.unmatched_pulse, Some(2));
        assert_eq!(segmentation.pulse_relaxation_pairs().count(), 1);
    }

    #[test]
    fn back_to_back_pulses_report_the_step() {
        let options = SegmentationOptions::default();
        let samples = trace(&[(1, 1.0e-3, 3), (2, 5.0e-4, 3), (3, 0.0, 3)]);
        let error = RecordSegmenter::new(&options)
            .segment(&samples)
            .expect_err("missing relaxation");

        assert_eq!(error.category(), AmidrErrorCategory::SegmentationError);
        assert_eq!(error.placeholder(), "SEGMENT.MISSING_RELAXATION");
        assert!(error.message().contains("step 1"));
    }

    #[test]
    fn mixed_current_sign_inside_a_step_is_rejected() {
        let options = SegmentationOptions::default();
        let mut samples = trace(&[(1, 1.0e-3, 3), (2, 0.0, 2)]);
        samples[1].current = -1.0e-3;
        let error = RecordSegmenter::new(&options)
            .segment(&samples)
            .expect_err("mixed current");
        assert_eq!(error.placeholder(), "SEGMENT.MIXED_CURRENT");
    }

    #[test]
    fn empty_records_are_rejected() {
        let options = SegmentationOptions::default();
        let error = RecordSegmenter::new(&options)
            .segment(&[])
            .expect_err("empty");
        assert_eq!(error.placeholder(), "SEGMENT.EMPTY");
    }

    #[test]
    fn decreasing_steps_need_splicing() {
        let samples = trace(&[(4, 1.0e-3, 2), (5, 0.0, 2), (1, 1.0e-3, 2), (2, 0.0, 2)]);
        let error = validate_step_order(&samples).expect_err("step order");
        assert_eq!(error.placeholder(), "SEGMENT.STEP_ORDER");

        let options = SegmentationOptions {
            spliced: true,
            ..SegmentationOptions::default()
        };
        let prepared = prepare_samples(&samples, &options).samples;
        validate_step_order(&prepared).expect("spliced steps increase");
        let segmentation = RecordSegmenter::new(&options)
            .segment(&prepared)
            .expect("segmentation");
        assert_eq!(segmentation.pulse_relaxation_pairs().count(), 2);
    }

    #[test]
    fn preparation_reports_repairs_and_trims_to_the_signature_block() {
        let options = SegmentationOptions::default();
        // formation charge and rest, then pulses relaxing over two rest steps
        let mut samples = trace(&[
            (1, 1.0e-3, 3),
            (2, 0.0, 3),
            (3, 1.0e-3, 3),
            (4, 0.0, 2),
            (5, 0.0, 2),
            (6, 1.0e-3, 3),
            (7, 0.0, 2),
            (8, 0.0, 2),
        ]);
        samples[4].voltage = -1.0;

        let prepared = prepare_samples(&samples, &options);

        assert_eq!(prepared.repairs.len(), 1);
        assert_eq!(prepared.repairs[0].index, 4);
        assert_eq!(prepared.repairs[0].kind, RepairKind::NegativeVoltage);
        assert_eq!(prepared.window.map(|window| window.first_step), Some(3));
        assert_eq!(prepared.samples.len(), 14);
        assert_eq!(prepared.samples[0].step_index, 3);

        let segmentation = RecordSegmenter::new(&options)
            .segment(&prepared.samples)
            .expect("segmentation");
        assert_eq!(segmentation.pulse_relaxation_pairs().count(), 2);
    }
}
