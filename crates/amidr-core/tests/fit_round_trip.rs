use amidr_core::common::config::FitOptions;
use amidr_core::domain::{HalfCycle, Protocol};
use amidr_core::modules::fit::{DiffusivityFitter, FitStatus};
use amidr_core::modules::normalize::{CapacityPoint, Interval};
use amidr_core::numerics::AtlungSeries;

const RADIUS: f64 = 1.0e-4;
const MASS: f64 = 0.005;

/// Log-spaced `Q` between `start` and `end`, sampled exactly on the model curve.
fn model_interval(
    series: &AtlungSeries,
    diffusivity: f64,
    ratio: f64,
    (start, end): (f64, f64),
) -> Interval {
    let count = 12;
    let points = (0..count)
        .map(|index| {
            let exponent = start.log10()
                + (end.log10() - start.log10()) * index as f64 / (count - 1) as f64;
            let q = 10f64.powf(exponent);
            CapacityPoint {
                fraction: series.solve_tau(q, ratio),
                effective_rate: q * RADIUS * RADIUS / (3600.0 * diffusivity),
                nominal_rate: 10.0,
                ir_drop: 0.005 + 0.001 * index as f64,
            }
        })
        .collect();

    Interval {
        index: 0,
        label: "3.900 V - 3.950 V".to_string(),
        half_cycle: HalfCycle::Charge,
        initial_voltage: 3.9,
        cutoff_voltage: 3.95,
        initial_capacity: 4.0e-4,
        cutoff_capacity: 5.0e-4,
        dqdv: 2.0e-3,
        resistance_drop: 40.0,
        mean_current: 2.0e-5,
        step_indices: vec![4],
        points,
    }
}

fn relative_error(actual: f64, expected: f64) -> f64 {
    (actual - expected).abs() / expected.abs()
}

#[test]
fn resistance_corrected_fit_recovers_diffusivity_and_ratio() {
    let options = FitOptions {
        particle_radius: RADIUS,
        ..FitOptions::default()
    };
    let fitter = DiffusivityFitter::new(&options, Protocol::SingleRate, MASS).expect("fitter");
    let interval = model_interval(fitter.series(), 1.0e-12, 0.05, (0.08, 100.0));

    let fit = fitter.fit(&interval).expect("fit should succeed");

    assert_eq!(fit.status, FitStatus::Converged);
    assert!(
        relative_error(fit.diffusivity, 1.0e-12) < 0.01,
        "diffusivity {} should be within 1% of 1e-12",
        fit.diffusivity
    );
    let ratio = fit.resistance_ratio.expect("resistance-corrected fit reports P");
    assert!(relative_error(ratio, 0.05) < 0.01, "P {ratio} should be within 1% of 0.05");
    assert!(!fit.bound_saturated);
    assert!((fit.capacity_adjustment - 1.0).abs() < 1.0e-6);
}

#[test]
fn derived_resistances_follow_the_fitted_ratio() {
    let options = FitOptions {
        particle_radius: RADIUS,
        ..FitOptions::default()
    };
    let fitter = DiffusivityFitter::new(&options, Protocol::SingleRate, MASS).expect("fitter");
    let interval = model_interval(fitter.series(), 1.0e-12, 0.05, (0.08, 100.0));
    let fit = fitter.fit(&interval).expect("fit should succeed");

    let ratio = fit.resistance_ratio.expect("ratio");
    let expected_resistance = ratio * RADIUS * RADIUS / (3600.0 * fit.diffusivity * interval.dqdv);
    let resistance = fit.resistance.expect("resistance");
    assert!(relative_error(resistance, expected_resistance) < 1.0e-9);

    let expected_contact = 3.0 * resistance * MASS / (RADIUS * options.active_material_density);
    let contact = fit.contact_resistivity.expect("contact resistivity");
    assert!(relative_error(contact, expected_contact) < 1.0e-9);

    // dq/dV is reported per gram of active material in mAh/(g V)
    assert!(relative_error(fit.dqdv, 2.0e-3 * 1000.0 / MASS) < 1.0e-12);
}

#[test]
fn plain_fit_recovers_diffusivity_on_multi_rate_curves() {
    let options = FitOptions {
        particle_radius: RADIUS,
        resistance_corrected: false,
        expansion_terms: 1000,
        ..FitOptions::default()
    };
    let fitter = DiffusivityFitter::new(&options, Protocol::MultiRate, MASS).expect("fitter");
    let interval = model_interval(fitter.series(), 5.0e-11, 0.0, (0.01, 100.0));

    let fit = fitter.fit(&interval).expect("fit should succeed");

    assert!(relative_error(fit.diffusivity, 5.0e-11) < 0.01);
    assert!((fit.capacity_adjustment - 1.0).abs() < 0.01);
    assert_eq!(fit.resistance_ratio, None);
    assert_eq!(fitter.model_curve(&fit, 40).len(), 40);
}
