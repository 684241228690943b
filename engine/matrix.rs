//! # Dense Matrix Primitive
//!
//! The minimal set of dense operations the estimator needs, expressed over `ndarray`
//! arrays and backed by LAPACK through `ndarray-linalg`. Every operation validates the
//! shapes it is given and reports a `MatrixError` rather than truncating or panicking.
//!
//! The 4×4 crosstalk and precision matrices and the cycle-sized phasing matrices share
//! the same `Array2<f64>` representation; their dimensions are checked once where the
//! model state is built and again at each operation boundary.

use ndarray::{Array2, ArrayBase, ArrayView2, Data, Ix2};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Determinant, Inverse, InverseC, SVD};
use thiserror::Error;

/// Default tolerance below which a determinant is considered numerically degenerate.
pub const DEFAULT_DETERMINANT_TOLERANCE: f64 = 3e-8;

/// A comprehensive error type for the dense matrix operations.
#[derive(Error, Debug)]
pub enum MatrixError {
    #[error(
        "Dimension mismatch in {operation}: expected {expected_rows}x{expected_cols}, found {found_rows}x{found_cols}."
    )]
    DimensionMismatch {
        operation: &'static str,
        expected_rows: usize,
        expected_cols: usize,
        found_rows: usize,
        found_cols: usize,
    },

    #[error("{operation} requires a square matrix, but was given {rows}x{cols}.")]
    NotSquare {
        operation: &'static str,
        rows: usize,
        cols: usize,
    },

    #[error("Matrix is singular or not positive definite and cannot be inverted.")]
    Singular,

    #[error("Determinant {determinant:e} is below the tolerance {tolerance:e}; cannot normalise.")]
    DegenerateDeterminant { determinant: f64, tolerance: f64 },

    #[error("Expected {expected} values to fill a {rows}x{cols} matrix, found {found}.")]
    WrongElementCount {
        rows: usize,
        cols: usize,
        expected: usize,
        found: usize,
    },

    #[error("LAPACK routine failed: {0}")]
    Linalg(#[from] LinalgError),
}

/// Checks that `a` has exactly the shape `(rows, cols)`.
pub fn ensure_shape<S: Data<Elem = f64>>(
    a: &ArrayBase<S, Ix2>,
    rows: usize,
    cols: usize,
    operation: &'static str,
) -> Result<(), MatrixError> {
    if a.dim() != (rows, cols) {
        return Err(MatrixError::DimensionMismatch {
            operation,
            expected_rows: rows,
            expected_cols: cols,
            found_rows: a.nrows(),
            found_cols: a.ncols(),
        });
    }
    Ok(())
}

fn ensure_square<S: Data<Elem = f64>>(
    a: &ArrayBase<S, Ix2>,
    operation: &'static str,
) -> Result<usize, MatrixError> {
    if !a.is_square() {
        return Err(MatrixError::NotSquare {
            operation,
            rows: a.nrows(),
            cols: a.ncols(),
        });
    }
    Ok(a.nrows())
}

/// The `n`×`n` identity.
pub fn identity(n: usize) -> Array2<f64> {
    Array2::eye(n)
}

/// A `rows`×`cols` matrix of zeros.
pub fn zeros(rows: usize, cols: usize) -> Array2<f64> {
    Array2::zeros((rows, cols))
}

/// Builds a matrix from values listed row by row.
pub fn from_row_slice(rows: usize, cols: usize, values: &[f64]) -> Result<Array2<f64>, MatrixError> {
    if values.len() != rows * cols {
        return Err(MatrixError::WrongElementCount {
            rows,
            cols,
            expected: rows * cols,
            found: values.len(),
        });
    }
    Array2::from_shape_vec((rows, cols), values.to_vec()).map_err(|_| {
        MatrixError::WrongElementCount {
            rows,
            cols,
            expected: rows * cols,
            found: values.len(),
        }
    })
}

/// General inverse through an LU factorisation.
pub fn invert<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Result<Array2<f64>, MatrixError> {
    ensure_square(a, "invert")?;
    let inverse = a.inv().map_err(|_| MatrixError::Singular)?;
    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(MatrixError::Singular);
    }
    Ok(inverse)
}

/// Inverse of a symmetric positive definite matrix through its Cholesky factor.
/// Used for the per-cycle residual covariances.
pub fn invert_symmetric<S: Data<Elem = f64>>(
    a: &ArrayBase<S, Ix2>,
) -> Result<Array2<f64>, MatrixError> {
    ensure_square(a, "invert_symmetric")?;
    let inverse = a.invc().map_err(|_| MatrixError::Singular)?;
    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(MatrixError::Singular);
    }
    Ok(inverse)
}

/// Owned, standard-layout transpose.
pub fn transpose<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Array2<f64> {
    a.t().as_standard_layout().into_owned()
}

/// Replaces `a` with its transpose. Square matrices are swapped element by element;
/// rectangular ones are rebuilt in standard layout.
pub fn transpose_in_place(a: &mut Array2<f64>) {
    if a.is_square() {
        let n = a.nrows();
        for i in 0..n {
            for j in (i + 1)..n {
                a.swap((i, j), (j, i));
            }
        }
    } else {
        *a = transpose(a);
    }
}

/// Multiplies every entry of `a` by `f`.
pub fn scale(a: &mut Array2<f64>, f: f64) {
    a.mapv_inplace(|v| v * f);
}

/// Rescales a square matrix so that `|det(a)| = 1`.
///
/// The matrix is divided by `f = |det(a)|^(1/n)` and `f` is returned so the caller can
/// push the reciprocal scale into whatever quantity multiplies `a` in the model.
pub fn normalize_determinant(a: &mut Array2<f64>, tolerance: f64) -> Result<f64, MatrixError> {
    let n = ensure_square(a, "normalize_determinant")?;
    let determinant = a.det()?;
    if !determinant.is_finite() || determinant.abs() < tolerance {
        return Err(MatrixError::DegenerateDeterminant {
            determinant,
            tolerance,
        });
    }
    let factor = determinant.abs().powf(1.0 / n as f64);
    a.mapv_inplace(|v| v / factor);
    Ok(factor)
}

/// Solves the normal equations `lhs · X = rhs` in the least-squares sense.
///
/// `lhs` is the symmetric left-hand side of a set of normal equations. It is decomposed
/// as `U Σ Vᵗ` and `X = V Σ⁺ Uᵗ rhs`, where singular values smaller than
/// `max(Σ) · dim · ε` are dropped. Rank-deficient systems therefore return the
/// minimum-norm solution instead of failing.
pub fn solve_generalized_least_squares(
    lhs: ArrayView2<f64>,
    rhs: ArrayView2<f64>,
) -> Result<Array2<f64>, MatrixError> {
    let n = ensure_square(&lhs, "solve_generalized_least_squares")?;
    if rhs.nrows() != n {
        return Err(MatrixError::DimensionMismatch {
            operation: "solve_generalized_least_squares",
            expected_rows: n,
            expected_cols: rhs.ncols(),
            found_rows: rhs.nrows(),
            found_cols: rhs.ncols(),
        });
    }

    let (u, singular, vt) = lhs.svd(true, true)?;
    let (u, vt) = match (u, vt) {
        (Some(u), Some(vt)) => (u, vt),
        _ => return Err(MatrixError::Singular),
    };

    let largest = singular.iter().copied().fold(0.0_f64, f64::max);
    let cutoff = largest * n as f64 * f64::EPSILON;

    // Σ⁺ Uᵗ rhs, row by row; rows belonging to dropped singular values stay zero.
    let mut projected = u.t().dot(&rhs);
    for (mut row, &s) in projected.rows_mut().into_iter().zip(singular.iter()) {
        if s > cutoff {
            row.mapv_inplace(|v| v / s);
        } else {
            row.fill(0.0);
        }
    }
    Ok(vt.t().dot(&projected))
}
