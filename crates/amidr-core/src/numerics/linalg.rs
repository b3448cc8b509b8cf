//! Cholesky factorization of the small symmetric normal matrices `J^T J + mu D`
//! assembled by the bounded least-squares solver.

use faer::Mat;

const RELATIVE_PIVOT_EPSILON: f64 = 1.0e-14;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CholeskyError {
    #[error("normal matrix must be square and non-empty, got {rows}x{cols}")]
    Shape { rows: usize, cols: usize },
    #[error("normal matrix is not positive definite at column {column}")]
    NotPositiveDefinite { column: usize },
    #[error("right-hand side length mismatch: expected {expected}, got {actual}")]
    RhsLengthMismatch { expected: usize, actual: usize },
}

/// Lower-triangular `L` with `A = L L^T`.
#[derive(Debug, Clone, PartialEq)]
pub struct Cholesky {
    lower: Mat<f64>,
}

impl Cholesky {
    /// Reads only the lower triangle of `matrix`.
    ///
    /// A pivot at or below `1e-14` of the largest diagonal entry is treated as
    /// zero, so the normal matrix of a rank-deficient Jacobian is reported
    /// rather than factorized into noise.
    pub fn factorize(matrix: &Mat<f64>) -> Result<Self, CholeskyError> {
        let dimension = matrix.nrows();
        if dimension == 0 || matrix.ncols() != dimension {
            return Err(CholeskyError::Shape {
                rows: dimension,
                cols: matrix.ncols(),
            });
        }

        let largest = (0..dimension)
            .map(|index| matrix[(index, index)].abs())
            .fold(0.0_f64, f64::max);
        let threshold = largest * RELATIVE_PIVOT_EPSILON;

        let mut lower = Mat::zeros(dimension, dimension);
        for col in 0..dimension {
            let mut diagonal = matrix[(col, col)];
            for k in 0..col {
                diagonal -= lower[(col, k)] * lower[(col, k)];
            }
            if !(diagonal > threshold) {
                return Err(CholeskyError::NotPositiveDefinite { column: col });
            }

            let pivot = diagonal.sqrt();
            lower[(col, col)] = pivot;
            for row in (col + 1)..dimension {
                let mut value = matrix[(row, col)];
                for k in 0..col {
                    value -= lower[(row, k)] * lower[(col, k)];
                }
                lower[(row, col)] = value / pivot;
            }
        }

        Ok(Self { lower })
    }

    pub fn dimension(&self) -> usize {
        self.lower.nrows()
    }

    pub fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>, CholeskyError> {
        let dimension = self.dimension();
        if rhs.len() != dimension {
            return Err(CholeskyError::RhsLengthMismatch {
                expected: dimension,
                actual: rhs.len(),
            });
        }
        Ok(self.substitute(rhs))
    }

    pub fn inverse(&self) -> Mat<f64> {
        let dimension = self.dimension();
        let mut inverse = Mat::zeros(dimension, dimension);
        let mut basis = vec![0.0; dimension];
        for col in 0..dimension {
            basis.fill(0.0);
            basis[col] = 1.0;
            for (row, value) in self.substitute(&basis).into_iter().enumerate() {
                inverse[(row, col)] = value;
            }
        }
        inverse
    }

    /// `L y = b`, then `L^T x = y`.
    fn substitute(&self, rhs: &[f64]) -> Vec<f64> {
        let dimension = self.dimension();
        let mut forward = vec![0.0; dimension];
        for row in 0..dimension {
            let mut value = rhs[row];
            for col in 0..row {
                value -= self.lower[(row, col)] * forward[col];
            }
            forward[row] = value / self.lower[(row, row)];
        }

        let mut solution = vec![0.0; dimension];
        for row in (0..dimension).rev() {
            let mut value = forward[row];
            for col in (row + 1)..dimension {
                value -= self.lower[(col, row)] * solution[col];
            }
            solution[row] = value / self.lower[(row, row)];
        }
        solution
    }
}

pub fn solve_normal_system(matrix: &Mat<f64>, rhs: &[f64]) -> Result<Vec<f64>, CholeskyError> {
    Cholesky::factorize(matrix)?.solve(rhs)
}

pub fn invert_normal_matrix(matrix: &Mat<f64>) -> Result<Mat<f64>, CholeskyError> {
    Ok(Cholesky::factorize(matrix)?.inverse())
}
