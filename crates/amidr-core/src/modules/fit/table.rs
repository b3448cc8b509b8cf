use super::FitResult;
use crate::modules::serialization::{
    TABLE_COLUMN_WIDTH, format_fixed_f64, format_optional_f64, format_scientific_f64,
    render_text_table,
};
use crate::numerics::atlung::CurvePoint;

const FIT_COLUMNS: [&str; 20] = [
    "V_mid",
    "V_init",
    "V_width",
    "half_cycle",
    "D_c",
    "log10_D_std",
    "D_t*",
    "P",
    "cap_adj",
    "tau_max",
    "tau_span",
    "fit_err",
    "dqdv",
    "R_fit",
    "micR",
    "R_drop",
    "ion_sat",
    "ion_sat_init",
    "converged",
    "P_at_bound",
];

pub fn render_fit_table(fits: &[FitResult]) -> String {
    let width = TABLE_COLUMN_WIDTH;
    let rows: Vec<Vec<String>> = fits
        .iter()
        .map(|fit| {
            vec![
                format_fixed_f64(fit.midpoint_voltage, width, 4),
                format_fixed_f64(fit.initial_voltage, width, 4),
                format_fixed_f64(fit.voltage_width, width, 4),
                format!("{:>width$}", fit.half_cycle.as_str()),
                format_scientific_f64(fit.diffusivity, width, 4),
                format_optional_f64(fit.log10_diffusivity_std, width, 4),
                format_optional_f64(fit.tracer_diffusivity, width, 4),
                format_optional_f64(fit.resistance_ratio, width, 4),
                format_fixed_f64(fit.capacity_adjustment, width, 6),
                format_fixed_f64(fit.tau_max, width, 4),
                format_fixed_f64(fit.tau_span, width, 4),
                format_scientific_f64(fit.fit_error, width, 4),
                format_scientific_f64(fit.dqdv, width, 4),
                format_optional_f64(fit.resistance, width, 4),
                format_optional_f64(fit.contact_resistivity, width, 4),
                format_scientific_f64(fit.resistance_drop, width, 4),
                format_optional_f64(fit.ion_saturation, width, 4),
                format_optional_f64(fit.initial_ion_saturation, width, 4),
                format!("{:>width$}", fit.status == super::FitStatus::Converged),
                format!("{:>width$}", fit.bound_saturated),
            ]
        })
        .collect();
    render_text_table(&FIT_COLUMNS, &rows)
}

/// One block per fit, blocks separated by a blank line.
pub fn render_model_curves(curves: &[(String, Vec<CurvePoint>)]) -> String {
    let width = TABLE_COLUMN_WIDTH;
    curves
        .iter()
        .map(|(label, points)| {
            let rows: Vec<Vec<String>> = points
                .iter()
                .map(|point| {
                    vec![
                        format_scientific_f64(point.q, width, 6),
                        format_fixed_f64(point.tau, width, 8),
                    ]
                })
                .collect();
            format!("# {label}\n{}", render_text_table(&["Q", "tau"], &rows))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::{FIT_COLUMNS, render_fit_table, render_model_curves};
    use crate::modules::fit::{FitResult, FitStatus};
    use crate::domain::HalfCycle;
    use crate::numerics::atlung::CurvePoint;

    fn fit() -> FitResult {
        FitResult {
            interval_index: 0,
            label: "3.800 V - 3.750 V".to_string(),
            half_cycle: HalfCycle::Discharge,
            initial_voltage: 3.8,
            cutoff_voltage: 3.75,
            midpoint_voltage: 3.775,
            voltage_width: 0.05,
            initial_specific_capacity: 100.0,
            midpoint_specific_capacity: 105.0,
            log10_diffusivity: -12.0,
            diffusivity: 1.0e-12,
            log10_diffusivity_std: Some(0.01),
            resistance_ratio: None,
            capacity_adjustment: 1.0,
            tau_max: 0.99,
            tau_min: 0.4,
            tau_span: 0.59,
            fit_error: 1.0e-4,
            dqdv: 200.0,
            resistance: None,
            contact_resistivity: None,
            resistance_drop: 50.0,
            ion_saturation: None,
            initial_ion_saturation: None,
            tracer_diffusivity: None,
            status: FitStatus::Converged,
            bound_saturated: false,
            evaluations: 12,
            cost: 1.0e-20,
            points: Vec::new(),
        }
    }

    #[test]
    fn fit_table_has_one_row_per_fit() {
        let table = render_fit_table(&[fit(), fit()]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        let fields: Vec<&str> = lines[1].split_whitespace().collect();
        assert_eq!(fields.len(), FIT_COLUMNS.len());
        assert_eq!(fields[0], "3.7750");
        assert_eq!(fields[3], "Discharge");
        assert_eq!(fields[7], "nan");
        assert_eq!(fields[18], "true");
    }

    #[test]
    fn curves_are_separated_by_blank_lines() {
        let points = vec![CurvePoint { q: 0.1, tau: 0.4 }, CurvePoint { q: 1.0, tau: 0.8 }];
        let rendered = render_model_curves(&[
            ("first".to_string(), points.clone()),
            ("second".to_string(), points),
        ]);
        assert_eq!(rendered.matches("\n\n").count(), 1);
        assert!(rendered.starts_with("# first\n#"));
    }
}
