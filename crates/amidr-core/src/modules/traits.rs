use crate::common::constants::SECONDS_PER_HOUR;
use crate::numerics::AtlungSeries;
use crate::numerics::atlung::CurvePoint;
use crate::numerics::log_grid;
use faer::Mat;

/// Box and starting point handed to the optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpace {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    pub initial: Vec<f64>,
}

/// A parameterisation of the Atlung relation that the fitter can optimise.
///
/// Implementations are pure and shared across worker threads.
pub trait CapacityModel: Sync {
    fn name(&self) -> &'static str;

    fn series(&self) -> &AtlungSeries;

    /// Particle radius in cm.
    fn particle_radius(&self) -> f64;

    fn parameter_space(&self) -> ParameterSpace;

    /// Chemical diffusivity in cm^2/s.
    fn diffusivity(&self, parameters: &[f64]) -> f64;

    /// Resistance ratio `P`, zero for models without it.
    fn resistance(&self, parameters: &[f64]) -> f64;

    fn capacity_adjustment(&self, parameters: &[f64]) -> f64;

    /// Atlung left-hand side at each point; one on the model curve.
    fn balance(&self, parameters: &[f64], fractions: &[f64], rates: &[f64]) -> Vec<f64>;

    /// Variance of `log10 D` propagated from the parameter covariance.
    fn log10_diffusivity_variance(&self, covariance: &Mat<f64>) -> f64;

    /// Decades of `Q` spanned by exported model curves.
    fn curve_decades(&self) -> (f64, f64);

    /// Dimensionless time `Q = 3600 n D / r^2` for a pulse of `rate` hours.
    fn time_constant(&self, diffusivity: f64, rate: f64) -> f64 {
        SECONDS_PER_HOUR * rate * diffusivity / self.particle_radius().powi(2)
    }
}

/// Curve export for plotting, available for every model.
pub trait ModelCurve {
    fn model_curve(&self, parameters: &[f64], count: usize) -> Vec<CurvePoint>;
}

impl<T> ModelCurve for T
where
    T: CapacityModel + ?Sized,
{
    fn model_curve(&self, parameters: &[f64], count: usize) -> Vec<CurvePoint> {
        let (start, end) = self.curve_decades();
        let Some(grid) = log_grid(start, end, count) else {
            return Vec::new();
        };
        self.series().curve(&grid, self.resistance(parameters))
    }
}

#[cfg(test)]
mod tests {
    use super::{CapacityModel, ModelCurve, ParameterSpace};
    use crate::numerics::AtlungSeries;
    use faer::Mat;

    struct FixedModel {
        series: AtlungSeries,
    }

    impl CapacityModel for FixedModel {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn series(&self) -> &AtlungSeries {
            &self.series
        }

        fn particle_radius(&self) -> f64 {
            1.0e-4
        }

        fn parameter_space(&self) -> ParameterSpace {
            ParameterSpace {
                lower: vec![-15.0],
                upper: vec![-9.0],
                initial: vec![-12.0],
            }
        }

        fn diffusivity(&self, parameters: &[f64]) -> f64 {
            10f64.powf(parameters[0])
        }

        fn resistance(&self, _parameters: &[f64]) -> f64 {
            0.0
        }

        fn capacity_adjustment(&self, _parameters: &[f64]) -> f64 {
            1.0
        }

        fn balance(&self, _parameters: &[f64], fractions: &[f64], _rates: &[f64]) -> Vec<f64> {
            fractions.to_vec()
        }

        fn log10_diffusivity_variance(&self, covariance: &Mat<f64>) -> f64 {
            covariance[(0, 0)]
        }

        fn curve_decades(&self) -> (f64, f64) {
            (-3.0, 2.0)
        }
    }

    #[test]
    fn time_constant_scales_with_rate_and_radius() {
        let model = FixedModel {
            series: AtlungSeries::sphere(50).expect("series"),
        };
        // 3600 * 10 h * 1e-12 / 1e-8
        assert!((model.time_constant(1.0e-12, 10.0) - 3.6).abs() < 1.0e-12);
    }

    #[test]
    fn every_model_exports_a_log_spaced_curve() {
        let model = FixedModel {
            series: AtlungSeries::sphere(200).expect("series"),
        };
        let curve = model.model_curve(&[-12.0], 11);

        assert_eq!(curve.len(), 11);
        assert!((curve[0].q - 1.0e-3).abs() < 1.0e-15);
        assert_eq!(curve[10].q, 100.0);
        assert!(curve.windows(2).all(|pair| pair[0].tau <= pair[1].tau));
        assert!(model.model_curve(&[-12.0], 1).is_empty());
    }
}
