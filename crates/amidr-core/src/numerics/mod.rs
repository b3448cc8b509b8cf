pub mod atlung;
pub mod least_squares;
pub mod linalg;

pub use atlung::{AtlungSeries, AtlungSeriesError};
pub use least_squares::{
    BoundedLeastSquares, LeastSquaresError, LeastSquaresOutcome, LeastSquaresProblem, Loss,
    TerminationReason,
};
pub use linalg::{Cholesky, CholeskyError, invert_normal_matrix, solve_normal_system};

pub(crate) fn kahan_add(sum: &mut f64, correction: &mut f64, value: f64) {
    let corrected = value - *correction;
    let next = *sum + corrected;
    *correction = (next - *sum) - corrected;
    *sum = next;
}

pub fn stable_sum(values: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut correction = 0.0;

    for &value in values {
        kahan_add(&mut sum, &mut correction, value);
    }

    sum
}

pub fn stable_weighted_sum(values: &[f64], weights: &[f64]) -> Option<f64> {
    if values.len() != weights.len() {
        return None;
    }

    let mut sum = 0.0;
    let mut correction = 0.0;
    for (&value, &weight) in values.iter().zip(weights) {
        kahan_add(&mut sum, &mut correction, value * weight);
    }

    Some(sum)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(stable_sum(values) / values.len() as f64)
}

/// Standard deviation with one delta degree of freedom; undefined below two values.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let center = mean(values)?;
    let squared: Vec<f64> = values.iter().map(|value| (value - center).powi(2)).collect();
    Some((stable_sum(&squared) / (values.len() - 1) as f64).sqrt())
}

pub fn deterministic_argsort(values: &[f64]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..values.len()).collect();
    indices.sort_unstable_by(|lhs, rhs| {
        values[*lhs]
            .total_cmp(&values[*rhs])
            .then_with(|| lhs.cmp(rhs))
    });
    indices
}

/// `count` points spaced evenly in log10 between `10^start_exponent` and `10^end_exponent`.
pub fn log_grid(start_exponent: f64, end_exponent: f64, count: usize) -> Option<Vec<f64>> {
    if count < 2 {
        return None;
    }

    let step = (end_exponent - start_exponent) / ((count - 1) as f64);
    let mut grid: Vec<f64> = (0..count)
        .map(|index| 10f64.powf(start_exponent + step * index as f64))
        .collect();

    if let Some(last) = grid.last_mut() {
        *last = 10f64.powf(end_exponent);
    }

    Some(grid)
}

/// Linear interpolation on an ascending grid; `None` outside `[x_grid[0], x_grid[last]]`.
pub fn interpolate_linear(x: f64, x_grid: &[f64], y_grid: &[f64]) -> Option<f64> {
    if x_grid.len() < 2 || x_grid.len() != y_grid.len() {
        return None;
    }

    if !x_grid.windows(2).all(|window| window[0] <= window[1]) {
        return None;
    }

    let last_index = x_grid.len() - 1;
    if !(x >= x_grid[0] && x <= x_grid[last_index]) {
        return None;
    }

    let upper = x_grid
        .windows(2)
        .position(|window| x <= window[1])
        .map(|index| index + 1)?;
    let lower = upper - 1;
    let x0 = x_grid[lower];
    let x1 = x_grid[upper];
    if x1 == x0 {
        return Some(y_grid[upper]);
    }

    let interpolation = (x - x0) / (x1 - x0);
    Some(y_grid[lower] + interpolation * (y_grid[upper] - y_grid[lower]))
}

#[cfg(test)]
mod tests {
    use super::{
        deterministic_argsort, interpolate_linear, log_grid, mean, sample_std, stable_sum,
        stable_weighted_sum,
    };

    #[test]
    fn stable_sum_reduces_order_loss_for_large_and_small_values() {
        let input = [1.0e16, 1.0, -1.0e16];
        assert_eq!(stable_sum(&input), 0.0);
    }

    #[test]
    fn stable_weighted_sum_validates_shape() {
        assert_eq!(stable_weighted_sum(&[1.0, 2.0], &[0.25]), None);
        let weighted = stable_weighted_sum(&[2.0, 4.0], &[0.5, 0.5]).expect("sum");
        assert!((weighted - 3.0).abs() < 1.0e-12);
    }

    #[test]
    fn sample_statistics_use_one_degree_of_freedom() {
        assert_eq!(mean(&[]), None);
        assert_eq!(sample_std(&[3.0]), None);
        let spread = sample_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).expect("std");
        assert!((spread - 2.138_089_935_299_395).abs() < 1.0e-12);
    }

    #[test]
    fn deterministic_argsort_orders_by_value_then_index() {
        let values = [2.0, 1.0, f64::NAN, 1.0, -0.0, 0.0];
        let order = deterministic_argsort(&values);
        assert_eq!(order, vec![4, 5, 1, 3, 0, 2]);
    }

    #[test]
    fn log_grid_spans_decades_inclusively() {
        assert_eq!(log_grid(-3.0, 2.0, 1), None);
        let grid = log_grid(-3.0, 2.0, 6).expect("grid");
        assert_eq!(grid.len(), 6);
        assert!((grid[0] - 1.0e-3).abs() < 1.0e-15);
        assert!((grid[3] - 1.0).abs() < 1.0e-12);
        assert_eq!(grid[5], 100.0);
    }

    #[test]
    fn interpolate_linear_refuses_to_extrapolate() {
        let x_grid = [0.0, 1.0, 2.0];
        let y_grid = [10.0, 20.0, 30.0];

        assert_eq!(interpolate_linear(-1.0, &x_grid, &y_grid), None);
        assert_eq!(interpolate_linear(3.0, &x_grid, &y_grid), None);
        assert_eq!(interpolate_linear(2.0, &x_grid, &y_grid), Some(30.0));
        assert_eq!(interpolate_linear(0.5, &x_grid, &y_grid), Some(15.0));
        assert_eq!(
            interpolate_linear(0.5, &[0.0, 2.0, 1.0], &[0.0, 2.0, 1.0]),
            None
        );
    }
}
