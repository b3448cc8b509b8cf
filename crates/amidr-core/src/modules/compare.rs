//! Side-by-side view of several materials' bin tables on one voltage axis.

use crate::domain::{AmidrError, ConfigResult};
use crate::modules::binning::{BinSelection, BinSummary, MaterialBins, Spread};
use crate::modules::serialization::{
    TABLE_COLUMN_WIDTH, format_fixed_f64, format_optional_f64, render_text_table,
};
use serde::{Deserialize, Serialize};

pub const MAX_COMPARED_MATERIALS: usize = 4;
const BIN_WIDTH_TOLERANCE: f64 = 1.0e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub index: i64,
    pub center: f64,
    /// One entry per compared material; `None` where its axis does not reach.
    pub bins: Vec<Option<BinSummary>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialComparison {
    pub bin_width: f64,
    pub selection: BinSelection,
    pub materials: Vec<String>,
    pub rows: Vec<ComparisonRow>,
}

pub fn compare_materials(
    materials: &[MaterialBins],
    selection: BinSelection,
) -> ConfigResult<MaterialComparison> {
    let Some(first) = materials.first() else {
        return Err(AmidrError::configuration(
            "CONFIG.COMPARE_EMPTY",
            "at least one material is required for a comparison",
        ));
    };
    if materials.len() > MAX_COMPARED_MATERIALS {
        let dropped: Vec<&str> = materials[MAX_COMPARED_MATERIALS..]
            .iter()
            .map(|material| material.material.as_str())
            .collect();
        tracing::warn!(
            limit = MAX_COMPARED_MATERIALS,
            dropped = ?dropped,
            "too many materials to compare; extras dropped"
        );
    }
    let compared = &materials[..materials.len().min(MAX_COMPARED_MATERIALS)];

    let bin_width = first.table.bin_width;
    if let Some(mismatch) = compared
        .iter()
        .find(|material| (material.table.bin_width - bin_width).abs() > BIN_WIDTH_TOLERANCE)
    {
        return Err(AmidrError::configuration(
            "CONFIG.BIN_WIDTH_MISMATCH",
            format!(
                "material '{}' was binned at {} V but '{}' at {} V",
                mismatch.material, mismatch.table.bin_width, first.material, bin_width
            ),
        ));
    }

    let ranges: Vec<(i64, i64)> = compared
        .iter()
        .filter_map(|material| material.table.index_range())
        .collect();
    let rows = match (
        ranges.iter().map(|range| range.0).min(),
        ranges.iter().map(|range| range.1).max(),
    ) {
        (Some(low), Some(high)) => (low..=high)
            .map(|index| ComparisonRow {
                index,
                center: (index as f64 + 0.5) * bin_width,
                bins: compared
                    .iter()
                    .map(|material| {
                        material
                            .table
                            .select(selection)
                            .iter()
                            .find(|bin| bin.index == index)
                            .cloned()
                    })
                    .collect(),
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(MaterialComparison {
        bin_width,
        selection,
        materials: compared
            .iter()
            .map(|material| material.material.clone())
            .collect(),
        rows,
    })
}

/// `D_c`, its geometric deviation and `micR` per material.
pub fn render_comparison(comparison: &MaterialComparison) -> String {
    let width = TABLE_COLUMN_WIDTH;
    let mut columns = vec!["V_center".to_string()];
    for material in &comparison.materials {
        columns.push(format!("{material}:D_c"));
        columns.push(format!("{material}:D_c_gstd"));
        columns.push(format!("{material}:micR"));
    }
    let column_refs: Vec<&str> = columns.iter().map(String::as_str).collect();

    let rows: Vec<Vec<String>> = comparison
        .rows
        .iter()
        .map(|row| {
            let mut cells = vec![format_fixed_f64(row.center, width, 4)];
            for bin in &row.bins {
                let diffusivity: Option<Spread> = bin.as_ref().and_then(|bin| bin.diffusivity);
                let contact = bin.as_ref().and_then(|bin| bin.contact_resistivity);
                cells.push(format_optional_f64(diffusivity.map(|spread| spread.mean), width, 4));
                cells.push(format_optional_f64(diffusivity.and_then(|spread| spread.std), width, 4));
                cells.push(format_optional_f64(contact.map(|spread| spread.mean), width, 4));
            }
            cells
        })
        .collect();
    render_text_table(&column_refs, &rows)
}

#[cfg(test)]
mod tests {
    use super::{MAX_COMPARED_MATERIALS, compare_materials, render_comparison};
    use crate::modules::binning::{BinSelection, BinSummary, BinTable, MaterialBins};

    fn bin(index: i64, width: f64, diffusivity: f64) -> BinSummary {
        BinSummary {
            index,
            center: (index as f64 + 0.5) * width,
            count: 1,
            diffusivity: crate::modules::binning::Spread::geometric(&[diffusivity]),
            tracer_diffusivity: None,
            resistance: None,
            contact_resistivity: None,
            resistance_drop: None,
            voltage_std: None,
            ion_saturation: None,
            dqdv: None,
            tau_span: None,
            fit_error: None,
        }
    }

    fn material(name: &str, width: f64, indices: std::ops::RangeInclusive<i64>) -> MaterialBins {
        let bins: Vec<BinSummary> = indices.map(|index| bin(index, width, 1.0e-11)).collect();
        MaterialBins {
            material: name.to_string(),
            screened: Vec::new(),
            table: BinTable {
                bin_width: width,
                all: bins.clone(),
                charge: bins,
                discharge: Vec::new(),
            },
        }
    }

    #[test]
    fn axes_are_aligned_by_bin_index() {
        let comparison = compare_materials(
            &[material("A", 0.025, 140..=142), material("B", 0.025, 141..=144)],
            BinSelection::All,
        )
        .expect("comparison");

        assert_eq!(comparison.rows.len(), 5);
        assert_eq!(comparison.rows[0].index, 140);
        assert!(comparison.rows[0].bins[1].is_none());
        assert!(comparison.rows[4].bins[0].is_none());
        assert!(comparison.rows[2].bins.iter().all(Option::is_some));

        let rendered = render_comparison(&comparison);
        let header: Vec<&str> = rendered.lines().next().expect("header").split_whitespace().collect();
        assert_eq!(header.len(), 1 + 1 + 2 * 3);
    }

    #[test]
    fn mismatched_bin_widths_are_rejected() {
        let error = compare_materials(
            &[material("A", 0.025, 140..=141), material("B", 0.05, 70..=71)],
            BinSelection::All,
        )
        .expect_err("widths differ");
        assert_eq!(error.placeholder(), "CONFIG.BIN_WIDTH_MISMATCH");
    }

    #[test]
    fn extra_materials_are_dropped() {
        let materials: Vec<MaterialBins> = (0..6)
            .map(|index| material(&format!("M{index}"), 0.025, 140..=140))
            .collect();
        let comparison = compare_materials(&materials, BinSelection::Charge).expect("comparison");
        assert_eq!(comparison.materials.len(), MAX_COMPARED_MATERIALS);
        assert_eq!(comparison.rows[0].bins.len(), MAX_COMPARED_MATERIALS);
    }
}
