//! End-to-end analysis of one cell record and of a material's set of cells.

use crate::common::config::AnalysisConfig;
use crate::domain::{AmidrResult, CellRecord, Protocol};
use crate::modules::binning::{BinAverager, CellFits, MaterialBins};
use crate::modules::fit::{DiffusivityFitter, FitReport};
use crate::modules::ionsat::IonSaturationCalculator;
use crate::modules::normalize::{CapacityNormalizer, IntervalSet};
use crate::modules::segment::{RecordSegmenter, SampleRepair, SignatureWindow, prepare_samples};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellAnalysis {
    pub cell: String,
    /// Active material mass in g.
    pub mass: f64,
    pub protocol: Protocol,
    /// A final pulse had no relaxation after it and was left out.
    pub unmatched_pulse: bool,
    /// Cycler glitches fixed before segmentation, indexed into the record's samples.
    #[serde(default)]
    pub repairs: Vec<SampleRepair>,
    #[serde(default)]
    pub signature_window: Option<SignatureWindow>,
    pub intervals: IntervalSet,
    pub report: FitReport,
    pub ion_saturation_applied: bool,
}

impl CellAnalysis {
    pub fn cell_fits(&self) -> CellFits {
        CellFits {
            cell: self.cell.clone(),
            fits: self.report.fits.clone(),
        }
    }
}

/// Segments, normalizes and fits one record.
///
/// Configuration and segmentation problems abort the record; fit-level
/// problems are kept in [`FitReport::discarded`].
pub fn analyze_cell(record: &CellRecord, config: &AnalysisConfig) -> AmidrResult<CellAnalysis> {
    config.validate()?;
    let fitter = DiffusivityFitter::new(&config.fit, config.segmentation.protocol, record.mass)?;

    let prepared = prepare_samples(&record.samples, &config.segmentation);
    let segmentation = RecordSegmenter::new(&config.segmentation).segment(&prepared.samples)?;
    let intervals = CapacityNormalizer::new(&config.segmentation, &config.normalization)
        .normalize(record, &prepared.samples, &segmentation)?;

    let mut report = fitter.fit_all(&intervals.intervals);
    let ion_saturation_applied = config.ion_saturation.as_ref().is_some_and(|inputs| {
        IonSaturationCalculator::new(inputs, record.mass).apply(&intervals.intervals, &mut report.fits)
    });

    tracing::info!(
        cell = %record.label,
        fitted = report.fits.len(),
        discarded = report.discarded.len(),
        repaired = prepared.repairs.len(),
        "cell analysis complete"
    );
    Ok(CellAnalysis {
        cell: record.label.clone(),
        mass: record.mass,
        protocol: config.segmentation.protocol,
        unmatched_pulse: segmentation.unmatched_pulse.is_some(),
        repairs: prepared.repairs,
        signature_window: prepared.window,
        intervals,
        report,
        ion_saturation_applied,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialAnalysis {
    pub cells: Vec<CellAnalysis>,
    pub bins: MaterialBins,
}

/// Analyzes every record, then screens and bins the pooled fits.
pub fn analyze_material(
    material: &str,
    records: &[CellRecord],
    config: &AnalysisConfig,
) -> AmidrResult<MaterialAnalysis> {
    let averager = BinAverager::new(&config.binning)?;
    let cells = records
        .iter()
        .map(|record| analyze_cell(record, config))
        .collect::<AmidrResult<Vec<_>>>()?;
    let fits: Vec<CellFits> = cells.iter().map(CellAnalysis::cell_fits).collect();
    let bins = averager.average(material, &fits);
    Ok(MaterialAnalysis { cells, bins })
}
