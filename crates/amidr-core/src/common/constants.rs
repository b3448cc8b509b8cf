//! Physical constants and protocol tables shared by the analysis modules.

/// Nominal C/n rates programmed on the cycler; measured rates snap to the nearest.
pub const NOMINAL_RATES: [f64; 18] = [
    0.01,
    0.05,
    0.1,
    0.2,
    1.0 / 3.0,
    0.5,
    1.0,
    2.0,
    2.5,
    5.0,
    10.0,
    20.0,
    40.0,
    80.0,
    160.0,
    320.0,
    640.0,
    1280.0,
];

pub const BOLTZMANN: f64 = 1.380_649e-23;
pub const ELEMENTARY_CHARGE: f64 = 1.602_176_634e-19;
pub const SECONDS_PER_HOUR: f64 = 3600.0;

/// Shape factors of the spherical Atlung expression, `tau + (1/(A Q))(1/B - 2 S)`.
pub const SPHERE_SHAPE_A: f64 = 3.0;
pub const SPHERE_SHAPE_B: f64 = 5.0;

/// The multi-rate dq/dV is taken from the pulse closest to this C/n.
pub const MULTI_RATE_DQDV_RATE: f64 = 40.0;

pub fn nearest_nominal_rate(rate: f64) -> f64 {
    NOMINAL_RATES
        .iter()
        .copied()
        .min_by(|lhs, rhs| (lhs - rate).abs().total_cmp(&(rhs - rate).abs()))
        .unwrap_or(rate)
}

#[cfg(test)]
mod tests {
    use super::{NOMINAL_RATES, nearest_nominal_rate};

    #[test]
    fn nominal_rates_are_strictly_increasing() {
        assert!(NOMINAL_RATES.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn measured_rates_snap_to_the_nearest_nominal_rate() {
        assert_eq!(nearest_nominal_rate(38.7), 40.0);
        assert_eq!(nearest_nominal_rate(0.34), 1.0 / 3.0);
        assert_eq!(nearest_nominal_rate(5000.0), 1280.0);
    }
}
