use super::{BinSummary, Spread};
use crate::modules::serialization::{
    TABLE_COLUMN_WIDTH, format_fixed_f64, format_optional_f64, render_text_table,
};

const BIN_COLUMNS: [&str; 21] = [
    "V_center",
    "count",
    "D_c",
    "D_c_gstd",
    "D_t*",
    "D_t*_gstd",
    "R_fit",
    "R_fit_gstd",
    "micR",
    "micR_gstd",
    "R_drop",
    "R_drop_gstd",
    "V_std",
    "ion_sat",
    "ion_sat_std",
    "dqdv",
    "dqdv_std",
    "tau_span",
    "tau_span_std",
    "fit_err",
    "fit_err_std",
];

fn spread_cells(spread: Option<Spread>) -> [String; 2] {
    let width = TABLE_COLUMN_WIDTH;
    [
        format_optional_f64(spread.map(|spread| spread.mean), width, 4),
        format_optional_f64(spread.and_then(|spread| spread.std), width, 4),
    ]
}

/// Empty bins keep their row with `nan` statistics.
pub fn render_bin_table(bins: &[BinSummary]) -> String {
    let width = TABLE_COLUMN_WIDTH;
    let rows: Vec<Vec<String>> = bins
        .iter()
        .map(|bin| {
            let mut row = vec![
                format_fixed_f64(bin.center, width, 4),
                format!("{:>width$}", bin.count),
            ];
            for spread in [
                bin.diffusivity,
                bin.tracer_diffusivity,
                bin.resistance,
                bin.contact_resistivity,
                bin.resistance_drop,
            ] {
                row.extend(spread_cells(spread));
            }
            row.push(format_optional_f64(bin.voltage_std, width, 4));
            for spread in [bin.ion_saturation, bin.dqdv, bin.tau_span, bin.fit_error] {
                row.extend(spread_cells(spread));
            }
            row
        })
        .collect();
    render_text_table(&BIN_COLUMNS, &rows)
}

#[cfg(test)]
mod tests {
    use super::{BIN_COLUMNS, render_bin_table};
    use crate::common::config::BinningOptions;
    use crate::modules::binning::tests::fit;
    use crate::modules::binning::{BinAverager, CellFits};

    #[test]
    fn every_bin_renders_a_full_row() {
        let options = BinningOptions {
            max_dqdv_change: None,
            ..BinningOptions::default()
        };
        let bins = BinAverager::new(&options).expect("valid options").average(
            "LFP",
            &[CellFits {
                cell: "cell-1".to_string(),
                fits: vec![fit(3.40, 100.0, 1.0e-13), fit(3.46, 120.0, 1.0e-13)],
            }],
        );
        let table = render_bin_table(&bins.table.all);
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines.len(), 1 + bins.table.all.len());
        for line in &lines[1..] {
            assert_eq!(line.split_whitespace().count(), BIN_COLUMNS.len());
        }
        let empty: Vec<&str> = lines[2].split_whitespace().collect();
        assert_eq!(empty[1], "0");
        assert_eq!(empty[2], "nan");
    }
}
