mod capacitance;
mod multi_rate;
mod single_rate;

pub use capacitance::{CAPACITANCE_RUN_LENGTH, CapacitanceCorrection};

use crate::common::config::{NormalizationOptions, SegmentationOptions};
use crate::domain::{AmidrError, CellRecord, HalfCycle, Protocol, Sample, SegmentResult};
use crate::modules::segment::Segmentation;
use serde::{Deserialize, Serialize};

/// Intervals need this many points above [`MIN_VALID_FRACTION`] to be fit.
pub const MIN_VALID_POINTS: usize = 4;
pub const MIN_VALID_FRACTION: f64 = 1.0e-3;

/// One fitting target: the capacity fraction reached after `effective_rate` hours.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacityPoint {
    pub fraction: f64,
    pub effective_rate: f64,
    pub nominal_rate: f64,
    pub ir_drop: f64,
}

/// A voltage window measured by one pulse (single-rate) or one rate sequence (multi-rate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub index: usize,
    pub label: String,
    pub half_cycle: HalfCycle,
    pub initial_voltage: f64,
    pub cutoff_voltage: f64,
    /// Ah at the start of the first pulse.
    pub initial_capacity: f64,
    pub cutoff_capacity: f64,
    /// Ah/V.
    pub dqdv: f64,
    /// Mean IR drop over current, in ohm.
    pub resistance_drop: f64,
    pub mean_current: f64,
    pub step_indices: Vec<i64>,
    pub points: Vec<CapacityPoint>,
}

impl Interval {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        half_cycle: HalfCycle,
        (initial_voltage, cutoff_voltage): (f64, f64),
        (initial_capacity, cutoff_capacity): (f64, f64),
        dqdv: f64,
        resistance_drop: f64,
        mean_current: f64,
        step_indices: Vec<i64>,
        points: Vec<CapacityPoint>,
    ) -> Self {
        Self {
            index: 0,
            label: format!("{initial_voltage:.3} V - {cutoff_voltage:.3} V"),
            half_cycle,
            initial_voltage,
            cutoff_voltage,
            initial_capacity,
            cutoff_capacity,
            dqdv,
            resistance_drop,
            mean_current,
            step_indices,
            points,
        }
    }

    pub fn midpoint_voltage(&self) -> f64 {
        0.5 * (self.initial_voltage + self.cutoff_voltage)
    }

    pub fn midpoint_capacity(&self) -> f64 {
        0.5 * (self.initial_capacity + self.cutoff_capacity)
    }

    pub fn voltage_width(&self) -> f64 {
        (self.initial_voltage - self.cutoff_voltage).abs()
    }

    pub fn fractions(&self) -> Vec<f64> {
        self.points.iter().map(|point| point.fraction).collect()
    }

    pub fn effective_rates(&self) -> Vec<f64> {
        self.points.iter().map(|point| point.effective_rate).collect()
    }

    pub fn ir_drops(&self) -> Vec<f64> {
        self.points.iter().map(|point| point.ir_drop).collect()
    }

    fn valid_point_count(&self) -> usize {
        self.points
            .iter()
            .filter(|point| point.fraction > MIN_VALID_FRACTION)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedInterval {
    pub label: String,
    pub valid_points: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalSet {
    pub protocol: Protocol,
    /// Capacity (Ah) used to turn currents into C/n rates.
    pub rate_capacity: f64,
    pub capacitance: Option<CapacitanceCorrection>,
    pub intervals: Vec<Interval>,
    pub dropped: Vec<DroppedInterval>,
}

pub struct CapacityNormalizer<'a> {
    segmentation: &'a SegmentationOptions,
    normalization: &'a NormalizationOptions,
}

impl<'a> CapacityNormalizer<'a> {
    pub fn new(
        segmentation: &'a SegmentationOptions,
        normalization: &'a NormalizationOptions,
    ) -> Self {
        Self {
            segmentation,
            normalization,
        }
    }

    /// Turns pulse/relaxation pairs into fitting targets.
    ///
    /// `samples` must be the same prepared trace that produced `segments`.
    pub fn normalize(
        &self,
        record: &CellRecord,
        samples: &[Sample],
        segments: &Segmentation,
    ) -> SegmentResult<IntervalSet> {
        let rate_capacity = self.rate_capacity(record, samples)?;
        let protocol = self.segmentation.protocol;

        let (raw, capacitance) = match protocol {
            Protocol::SingleRate => {
                if self.normalization.fcap_min != 0.0 {
                    tracing::warn!("minimum capacity fraction applies to multi-rate data only; ignored");
                }
                single_rate::single_rate_intervals(
                    samples,
                    segments,
                    self.normalization.capacitance_correction,
                    rate_capacity,
                )
            }
            Protocol::MultiRate => {
                if self.normalization.capacitance_correction {
                    tracing::warn!("capacitance correction applies to single-rate data only; ignored");
                }
                let intervals = multi_rate::multi_rate_intervals(
                    samples,
                    segments,
                    rate_capacity,
                    self.normalization.fcap_min,
                )?;
                (intervals, None)
            }
        };

        let mut intervals = Vec::with_capacity(raw.len());
        let mut dropped = Vec::new();
        for mut interval in raw {
            let valid_points = interval.valid_point_count();
            if valid_points < MIN_VALID_POINTS {
                tracing::warn!(
                    interval = %interval.label,
                    valid_points,
                    "too few capacity points to fit; interval dropped"
                );
                dropped.push(DroppedInterval {
                    label: interval.label,
                    valid_points,
                });
                continue;
            }
            interval.index = intervals.len();
            intervals.push(interval);
        }
        tracing::info!(
            cell = %record.label,
            %protocol,
            count = intervals.len(),
            "found voltage intervals"
        );

        Ok(IntervalSet {
            protocol,
            rate_capacity,
            capacitance,
            intervals,
            dropped,
        })
    }

    fn rate_capacity(&self, record: &CellRecord, samples: &[Sample]) -> SegmentResult<f64> {
        if self.segmentation.use_input_capacity && record.nominal_capacity > 0.0 {
            return Ok(record.nominal_capacity);
        }
        let (low, high) = samples.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY),
            |(low, high), sample| (low.min(sample.capacity), high.max(sample.capacity)),
        );
        let span = high - low;
        if !(span > 0.0) {
            return Err(AmidrError::segmentation(
                "SEGMENT.CAPACITY",
                format!("cell '{}' has no usable capacity span", record.label),
            ));
        }
        if self.segmentation.use_input_capacity {
            tracing::warn!(cell = %record.label, span, "no nominal capacity in header; using measured span");
        }
        Ok(span)
    }
}
