//! Outlier screening and voltage-binned averaging of per-interval fits.
//!
//! Fits from several cells of one material are screened cell by cell and
//! half-cycle by half-cycle, then every accepted fit lands in a fixed-width
//! voltage bin. Diffusivities and resistances span decades and are averaged
//! geometrically; everything else arithmetically.

mod table;

pub use table::render_bin_table;

use crate::common::config::BinningOptions;
use crate::domain::{ConfigResult, HalfCycle};
use crate::modules::fit::FitResult;
use crate::numerics::{deterministic_argsort, mean, sample_std};
use serde::{Deserialize, Serialize};

/// Keeps `3.70 / 0.025` in bin 148 despite binary rounding.
const BIN_EDGE_EPSILON: f64 = 1.0e-9;

pub fn bin_index(voltage: f64, bin_width: f64) -> i64 {
    (voltage / bin_width + BIN_EDGE_EPSILON).floor() as i64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellFits {
    pub cell: String,
    pub fits: Vec<FitResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// τ span below the configured minimum.
    IncompletePulse,
    /// dq/dV changes too much relative to a voltage neighbour.
    DqdvJump,
    /// First or last fit of a sequence; only one neighbour to compare against.
    EdgeFit,
    NonFinite,
}

impl RejectionReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IncompletePulse => "incomplete_pulse",
            Self::DqdvJump => "dqdv_jump",
            Self::EdgeFit => "edge_fit",
            Self::NonFinite => "non_finite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenedFit {
    pub cell: String,
    pub fit: FitResult,
    pub rejections: Vec<RejectionReason>,
}

impl ScreenedFit {
    pub fn accepted(&self) -> bool {
        self.rejections.is_empty()
    }
}

pub struct OutlierFilter<'a> {
    options: &'a BinningOptions,
}

impl<'a> OutlierFilter<'a> {
    pub fn new(options: &'a BinningOptions) -> Self {
        Self { options }
    }

    /// Screens each cell's charge and discharge sequences separately, ordered by voltage.
    pub fn screen(&self, cells: &[CellFits]) -> Vec<ScreenedFit> {
        let mut screened = Vec::new();
        for cell in cells {
            for half_cycle in [HalfCycle::Charge, HalfCycle::Discharge] {
                let sequence: Vec<&FitResult> = cell
                    .fits
                    .iter()
                    .filter(|fit| fit.half_cycle == half_cycle)
                    .collect();
                let voltages: Vec<f64> = sequence.iter().map(|fit| fit.midpoint_voltage).collect();
                let ordered: Vec<&FitResult> = deterministic_argsort(&voltages)
                    .into_iter()
                    .map(|index| sequence[index])
                    .collect();
                screened.extend(self.screen_sequence(&cell.cell, &ordered));
            }
        }

        let rejected = screened.iter().filter(|fit| !fit.accepted()).count();
        tracing::info!(
            screened = screened.len(),
            rejected,
            "screened fits for binning"
        );
        screened
    }

    fn screen_sequence(&self, cell: &str, sequence: &[&FitResult]) -> Vec<ScreenedFit> {
        let last = sequence.len().saturating_sub(1);
        sequence
            .iter()
            .enumerate()
            .map(|(position, fit)| {
                let mut rejections = Vec::new();
                if !(fit.diffusivity.is_finite() && fit.diffusivity > 0.0) {
                    rejections.push(RejectionReason::NonFinite);
                }
                if !(fit.tau_span >= self.options.tau_min) {
                    rejections.push(RejectionReason::IncompletePulse);
                }
                if let Some(limit) = self.options.max_dqdv_change {
                    if position == 0 || position == last {
                        rejections.push(RejectionReason::EdgeFit);
                    }
                    let neighbours = [
                        position.checked_sub(1).map(|index| sequence[index]),
                        sequence.get(position + 1).copied(),
                    ];
                    let jumps = neighbours
                        .into_iter()
                        .flatten()
                        .any(|neighbour| !dqdv_within(fit.dqdv, neighbour.dqdv, limit));
                    if jumps {
                        rejections.push(RejectionReason::DqdvJump);
                    }
                }
                ScreenedFit {
                    cell: cell.to_string(),
                    fit: (*fit).clone(),
                    rejections,
                }
            })
            .collect()
    }
}

/// Both ratios positive and strictly below `limit`.
fn dqdv_within(value: f64, neighbour: f64, limit: f64) -> bool {
    let forward = value / neighbour;
    let backward = neighbour / value;
    forward > 0.0 && forward < limit && backward > 0.0 && backward < limit
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spread {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation; `None` below two values. Geometric spreads
    /// report the multiplicative factor `exp(std(ln x))`.
    pub std: Option<f64>,
}

impl Spread {
    pub fn arithmetic(values: &[f64]) -> Option<Self> {
        let finite: Vec<f64> = values.iter().copied().filter(|value| value.is_finite()).collect();
        Some(Self {
            count: finite.len(),
            mean: mean(&finite)?,
            std: sample_std(&finite),
        })
    }

    /// Skips non-positive values, which have no logarithm.
    pub fn geometric(values: &[f64]) -> Option<Self> {
        let logs: Vec<f64> = values
            .iter()
            .filter(|value| value.is_finite() && **value > 0.0)
            .map(|value| value.ln())
            .collect();
        Some(Self {
            count: logs.len(),
            mean: mean(&logs)?.exp(),
            std: sample_std(&logs).map(f64::exp),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinSummary {
    pub index: i64,
    pub center: f64,
    /// Fits whose midpoint voltage falls in the bin.
    pub count: usize,
    pub diffusivity: Option<Spread>,
    pub tracer_diffusivity: Option<Spread>,
    pub resistance: Option<Spread>,
    pub contact_resistivity: Option<Spread>,
    pub resistance_drop: Option<Spread>,
    pub voltage_std: Option<f64>,
    pub ion_saturation: Option<Spread>,
    pub dqdv: Option<Spread>,
    pub tau_span: Option<Spread>,
    pub fit_error: Option<Spread>,
}

impl BinSummary {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn collect(index: i64, bin_width: f64, fits: &[&FitResult]) -> Self {
        let by_midpoint: Vec<&FitResult> = fits
            .iter()
            .copied()
            .filter(|fit| bin_index(fit.midpoint_voltage, bin_width) == index)
            .collect();
        let by_initial: Vec<&FitResult> = fits
            .iter()
            .copied()
            .filter(|fit| bin_index(fit.initial_voltage, bin_width) == index)
            .collect();
        let by_either: Vec<&FitResult> = fits
            .iter()
            .copied()
            .filter(|fit| {
                bin_index(fit.midpoint_voltage, bin_width) == index
                    || bin_index(fit.initial_voltage, bin_width) == index
            })
            .collect();

        let voltages = field_values(&by_either, |fit| Some(fit.midpoint_voltage));

        Self {
            index,
            center: (index as f64 + 0.5) * bin_width,
            count: by_midpoint.len(),
            diffusivity: Spread::geometric(&field_values(&by_midpoint, |fit| Some(fit.diffusivity))),
            tracer_diffusivity: Spread::geometric(&field_values(&by_midpoint, |fit| fit.tracer_diffusivity)),
            resistance: Spread::geometric(&field_values(&by_initial, |fit| fit.resistance)),
            contact_resistivity: Spread::geometric(&field_values(&by_initial, |fit| {
                fit.contact_resistivity
            })),
            resistance_drop: Spread::geometric(&field_values(&by_initial, |fit| Some(fit.resistance_drop))),
            voltage_std: sample_std(&voltages),
            ion_saturation: Spread::arithmetic(&field_values(&by_either, |fit| fit.ion_saturation)),
            dqdv: Spread::arithmetic(&field_values(&by_midpoint, |fit| Some(fit.dqdv))),
            tau_span: Spread::arithmetic(&field_values(&by_midpoint, |fit| Some(fit.tau_span))),
            fit_error: Spread::arithmetic(&field_values(&by_midpoint, |fit| Some(fit.fit_error))),
        }
    }
}

fn field_values(selection: &[&FitResult], field: impl Fn(&FitResult) -> Option<f64>) -> Vec<f64> {
    selection.iter().filter_map(|fit| field(fit)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinSelection {
    #[default]
    All,
    Charge,
    Discharge,
}

/// All, charge-only and discharge-only bins on one shared voltage axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinTable {
    pub bin_width: f64,
    pub all: Vec<BinSummary>,
    pub charge: Vec<BinSummary>,
    pub discharge: Vec<BinSummary>,
}

impl BinTable {
    pub fn select(&self, selection: BinSelection) -> &[BinSummary] {
        match selection {
            BinSelection::All => &self.all,
            BinSelection::Charge => &self.charge,
            BinSelection::Discharge => &self.discharge,
        }
    }

    /// Inclusive bin index range of the axis, `None` when nothing was accepted.
    pub fn index_range(&self) -> Option<(i64, i64)> {
        Some((self.all.first()?.index, self.all.last()?.index))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialBins {
    pub material: String,
    pub screened: Vec<ScreenedFit>,
    pub table: BinTable,
}

impl MaterialBins {
    pub fn accepted(&self) -> impl Iterator<Item = &ScreenedFit> {
        self.screened.iter().filter(|fit| fit.accepted())
    }
}

pub struct BinAverager<'a> {
    options: &'a BinningOptions,
}

impl<'a> BinAverager<'a> {
    pub fn new(options: &'a BinningOptions) -> ConfigResult<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn average(&self, material: impl Into<String>, cells: &[CellFits]) -> MaterialBins {
        let material = material.into();
        let screened = OutlierFilter::new(self.options).screen(cells);
        let accepted: Vec<&FitResult> = screened
            .iter()
            .filter(|fit| fit.accepted())
            .map(|fit| &fit.fit)
            .collect();
        let table = self.table(&accepted);
        tracing::info!(
            material = %material,
            accepted = accepted.len(),
            bins = table.all.len(),
            "averaged fits into voltage bins"
        );
        MaterialBins {
            material,
            screened,
            table,
        }
    }

    /// Bins span every midpoint and initial voltage of the accepted fits.
    pub fn table(&self, accepted: &[&FitResult]) -> BinTable {
        let width = self.options.bin_width;
        let indices: Vec<i64> = accepted
            .iter()
            .flat_map(|fit| {
                [
                    bin_index(fit.midpoint_voltage, width),
                    bin_index(fit.initial_voltage, width),
                ]
            })
            .collect();
        let (Some(&first), Some(&last)) = (indices.iter().min(), indices.iter().max()) else {
            return BinTable {
                bin_width: width,
                all: Vec::new(),
                charge: Vec::new(),
                discharge: Vec::new(),
            };
        };

        let charge: Vec<&FitResult> = accepted
            .iter()
            .copied()
            .filter(|fit| fit.half_cycle == HalfCycle::Charge)
            .collect();
        let discharge: Vec<&FitResult> = accepted
            .iter()
            .copied()
            .filter(|fit| fit.half_cycle == HalfCycle::Discharge)
            .collect();
        let axis = |fits: &[&FitResult]| -> Vec<BinSummary> {
            (first..=last)
                .map(|index| BinSummary::collect(index, width, fits))
                .collect()
        };

        BinTable {
            bin_width: width,
            all: axis(accepted),
            charge: axis(&charge),
            discharge: axis(&discharge),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BinAverager, CellFits, OutlierFilter, RejectionReason, Spread, bin_index,
    };
    use crate::common::config::BinningOptions;
    use crate::domain::HalfCycle;
    use crate::modules::fit::{FitResult, FitStatus};

    pub(super) fn fit(voltage: f64, dqdv: f64, diffusivity: f64) -> FitResult {
        FitResult {
            interval_index: 0,
            label: format!("{voltage:.3} V"),
            half_cycle: HalfCycle::Charge,
            initial_voltage: voltage,
            cutoff_voltage: voltage,
            midpoint_voltage: voltage,
            voltage_width: 0.01,
            initial_specific_capacity: 100.0,
            midpoint_specific_capacity: 100.0,
            log10_diffusivity: diffusivity.log10(),
            diffusivity,
            log10_diffusivity_std: None,
            resistance_ratio: None,
            capacity_adjustment: 1.0,
            tau_max: 0.95,
            tau_min: 0.2,
            tau_span: 0.75,
            fit_error: 1.0e-3,
            dqdv,
            resistance: None,
            contact_resistivity: None,
            resistance_drop: 20.0,
            ion_saturation: None,
            initial_ion_saturation: None,
            tracer_diffusivity: None,
            status: FitStatus::Converged,
            bound_saturated: false,
            evaluations: 10,
            cost: 0.0,
            points: Vec::new(),
        }
    }

    fn cell(fits: Vec<FitResult>) -> Vec<CellFits> {
        vec![CellFits {
            cell: "cell-a".to_string(),
            fits,
        }]
    }

    #[test]
    fn oscillating_dqdv_rejects_every_fit() {
        let options = BinningOptions::default();
        let screened = OutlierFilter::new(&options).screen(&cell(vec![
            fit(3.70, 500.0, 1.0e-11),
            fit(3.75, 200.0, 1.0e-11),
            fit(3.80, 500.0, 1.0e-11),
        ]));

        assert_eq!(screened.len(), 3);
        assert!(screened.iter().all(|fit| !fit.accepted()));
        assert!(screened.iter().all(|fit| fit.rejections.contains(&RejectionReason::DqdvJump)));
        assert!(screened[0].rejections.contains(&RejectionReason::EdgeFit));
        assert!(screened[2].rejections.contains(&RejectionReason::EdgeFit));
        assert!(!screened[1].rejections.contains(&RejectionReason::EdgeFit));
    }

    #[test]
    fn disabling_the_dqdv_check_keeps_edges() {
        let options = BinningOptions {
            max_dqdv_change: None,
            ..BinningOptions::default()
        };
        let screened = OutlierFilter::new(&options).screen(&cell(vec![
            fit(3.70, 500.0, 1.0e-11),
            fit(3.75, 200.0, 1.0e-11),
        ]));
        assert!(screened.iter().all(|fit| fit.accepted()));
    }

    #[test]
    fn short_tau_span_is_rejected_regardless_of_fit_quality() {
        let options = BinningOptions::default();
        let mut incomplete = fit(3.75, 210.0, 1.0e-11);
        incomplete.tau_span = 0.3;
        incomplete.fit_error = 0.0;
        let screened = OutlierFilter::new(&options).screen(&cell(vec![
            fit(3.70, 200.0, 1.0e-11),
            incomplete,
            fit(3.80, 220.0, 1.0e-11),
        ]));

        assert_eq!(screened[1].rejections, vec![RejectionReason::IncompletePulse]);
    }

    #[test]
    fn sequences_are_screened_in_voltage_order_per_half_cycle() {
        let options = BinningOptions::default();
        let mut discharge = fit(3.72, 210.0, 1.0e-11);
        discharge.half_cycle = HalfCycle::Discharge;
        let screened = OutlierFilter::new(&options).screen(&cell(vec![
            fit(3.80, 220.0, 1.0e-11),
            fit(3.70, 200.0, 1.0e-11),
            fit(3.75, 210.0, 1.0e-11),
            discharge,
        ]));

        let charge: Vec<f64> = screened
            .iter()
            .filter(|fit| fit.fit.half_cycle == HalfCycle::Charge)
            .map(|fit| fit.fit.midpoint_voltage)
            .collect();
        assert_eq!(charge, vec![3.70, 3.75, 3.80]);
        assert!(screened[1].accepted());
        // a lone discharge fit is its own first and last
        assert_eq!(screened[3].rejections, vec![RejectionReason::EdgeFit]);
    }

    #[test]
    fn nearby_voltages_share_a_bin() {
        assert_eq!(bin_index(3.70, 0.025), 148);
        assert_eq!(bin_index(3.71, 0.025), 148);
        assert_eq!(bin_index(3.76, 0.025), 150);
    }

    #[test]
    fn empty_bins_stay_on_the_axis() {
        let options = BinningOptions {
            max_dqdv_change: None,
            ..BinningOptions::default()
        };
        let averager = BinAverager::new(&options).expect("valid options");
        let bins = averager.average(
            "NMC",
            &cell(vec![
                fit(3.70, 200.0, 1.0e-11),
                fit(3.71, 200.0, 1.0e-12),
                fit(3.76, 200.0, 1.0e-11),
            ]),
        );

        let counts: Vec<usize> = bins.table.all.iter().map(|bin| bin.count).collect();
        assert_eq!(counts, vec![2, 0, 1]);
        assert!(bins.table.all[1].diffusivity.is_none());
        assert!(bins.table.discharge.iter().all(|bin| bin.is_empty()));
        assert_eq!(bins.table.charge.len(), 3);

        let geometric = bins.table.all[0].diffusivity.expect("populated bin");
        assert!((geometric.mean.log10() + 11.5).abs() < 1.0e-12);
        assert!((bins.table.all[0].center - 3.7125).abs() < 1.0e-12);
    }

    #[test]
    fn spreads_need_two_values_for_a_deviation() {
        let single = Spread::arithmetic(&[2.0]).expect("one value");
        assert_eq!(single.std, None);
        assert!(Spread::geometric(&[-1.0, 0.0]).is_none());

        let geometric = Spread::geometric(&[1.0, 100.0, -5.0]).expect("positive values");
        assert_eq!(geometric.count, 2);
        assert!((geometric.mean - 10.0).abs() < 1.0e-9);
    }
}
