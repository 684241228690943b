//! # Intensity Transform
//!
//! Maps raw cluster intensities into "processed" space, where an error-free read of
//! brightness `λ` looks like `λ` times a one-hot column per cycle, and back again.
//!
//! The forward model is `I = λ·M·S·P + N`. Undoing it needs `M⁻¹ (I − N) P⁻¹`, which
//! as a vector is `(P⁻ᵗ ⊗ M⁻¹) vec(I − N)`. The Kronecker product is never formed: the
//! two factors are applied one after the other, and the inverses are passed in
//! transposed so that the inner loops walk contiguous rows.

use crate::matrix::{MatrixError, ensure_shape};
use crate::nucleotide::{Base, NBASE};
use ndarray::linalg::general_mat_mul;
use ndarray::{Array2, ArrayView2};

/// Computes `M⁻¹ (observed − noise) P⁻¹` for one cluster.
///
/// # Arguments
/// * `observed` - Raw intensities, `NBASE × ncycle`.
/// * `minv_t` - Transpose of the inverse crosstalk matrix, `NBASE × NBASE`.
/// * `pinv_t` - Transpose of the inverse phasing matrix, `ncycle × ncycle`.
/// * `noise` - Additive noise, `NBASE × ncycle`.
pub fn process_intensities(
    observed: ArrayView2<f64>,
    minv_t: ArrayView2<f64>,
    pinv_t: ArrayView2<f64>,
    noise: ArrayView2<f64>,
) -> Result<Array2<f64>, MatrixError> {
    let mut out = Array2::zeros(observed.raw_dim());
    process_intensities_into(observed, minv_t, pinv_t, noise, &mut out)?;
    Ok(out)
}

/// As [`process_intensities`], writing into a caller-owned buffer so that sweeps over
/// a tile can reuse one allocation per worker.
pub fn process_intensities_into(
    observed: ArrayView2<f64>,
    minv_t: ArrayView2<f64>,
    pinv_t: ArrayView2<f64>,
    noise: ArrayView2<f64>,
    out: &mut Array2<f64>,
) -> Result<(), MatrixError> {
    let ncycle = observed.ncols();
    ensure_shape(&observed, NBASE, ncycle, "process_intensities (observed)")?;
    ensure_shape(&minv_t, NBASE, NBASE, "process_intensities (inverse crosstalk)")?;
    ensure_shape(&pinv_t, ncycle, ncycle, "process_intensities (inverse phasing)")?;
    ensure_shape(&noise, NBASE, ncycle, "process_intensities (noise)")?;
    if out.dim() != (NBASE, ncycle) {
        *out = Array2::zeros((NBASE, ncycle));
    }

    // tmp[base, icol] = Σ_chan Minv[base, chan] · (I − N)[chan, icol]
    let centred = &observed - &noise;
    let tmp = minv_t.t().dot(&centred);

    // out[base, pcol] = Σ_icol tmp[base, icol] · Pinv[icol, pcol]
    general_mat_mul(1.0, &tmp, &pinv_t.t(), 0.0, out);
    Ok(())
}

/// The noiseless intensities a cluster would produce: `λ · M · onehot(bases) · P + N`.
///
/// Ambiguous bases contribute a zero column to the one-hot matrix.
pub fn expected_intensities(
    lambda: f64,
    bases: &[Base],
    crosstalk: ArrayView2<f64>,
    phasing: ArrayView2<f64>,
    noise: ArrayView2<f64>,
) -> Result<Array2<f64>, MatrixError> {
    let ncycle = bases.len();
    ensure_shape(&crosstalk, NBASE, NBASE, "expected_intensities (crosstalk)")?;
    ensure_shape(&phasing, ncycle, ncycle, "expected_intensities (phasing)")?;
    ensure_shape(&noise, NBASE, ncycle, "expected_intensities (noise)")?;

    // onehot(bases) · P: row `b` accumulates the phasing rows of every cycle called `b`.
    let mut sp = Array2::<f64>::zeros((NBASE, ncycle));
    for (cycle, base) in bases.iter().enumerate() {
        if let Some(b) = base.index() {
            let mut row = sp.row_mut(b);
            row += &phasing.row(cycle);
        }
    }

    let mut expected = noise.to_owned();
    general_mat_mul(lambda, &crosstalk, &sp, 1.0, &mut expected);
    Ok(expected)
}

/// Sum of squared differences between observed and expected intensities.
pub fn residual_sum_of_squares(observed: ArrayView2<f64>, expected: ArrayView2<f64>) -> f64 {
    observed
        .iter()
        .zip(expected.iter())
        .map(|(o, e)| (o - e) * (o - e))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{invert, transpose};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn crosstalk() -> Array2<f64> {
        array![
            [1.6, 0.4, 0.1, 0.05],
            [0.5, 1.4, 0.1, 0.1],
            [0.05, 0.1, 1.2, 0.3],
            [0.1, 0.05, 0.6, 1.1]
        ]
    }

    fn phasing() -> Array2<f64> {
        array![
            [0.95, 0.04, 0.0, 0.0, 0.0],
            [0.02, 0.93, 0.05, 0.0, 0.0],
            [0.0, 0.03, 0.92, 0.05, 0.0],
            [0.0, 0.0, 0.03, 0.91, 0.06],
            [0.0, 0.0, 0.0, 0.04, 0.9]
        ]
    }

    #[test]
    fn processing_expected_intensities_recovers_scaled_one_hot() {
        let bases = [Base::G, Base::A, Base::N, Base::T, Base::C];
        let lambda = 850.0;
        let m = crosstalk();
        let p = phasing();
        let n = Array2::from_shape_fn((NBASE, 5), |(ch, cy)| 3.0 + ch as f64 + 0.5 * cy as f64);

        let expected = expected_intensities(lambda, &bases, m.view(), p.view(), n.view()).unwrap();
        let minv_t = transpose(&invert(&m).unwrap());
        let pinv_t = transpose(&invert(&p).unwrap());
        let processed =
            process_intensities(expected.view(), minv_t.view(), pinv_t.view(), n.view()).unwrap();

        for (cycle, base) in bases.iter().enumerate() {
            for b in 0..NBASE {
                let target = if base.index() == Some(b) { lambda } else { 0.0 };
                assert_abs_diff_eq!(processed[[b, cycle]], target, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn identity_transform_only_removes_noise() {
        let observed = array![[5.0, 1.0], [2.0, 3.0], [0.0, 4.0], [1.0, 1.0]];
        let noise = Array2::from_elem((NBASE, 2), 1.0);
        let processed = process_intensities(
            observed.view(),
            Array2::eye(NBASE).view(),
            Array2::eye(2).view(),
            noise.view(),
        )
        .unwrap();
        assert_eq!(processed, &observed - 1.0);
    }

    #[test]
    fn mismatched_phasing_is_rejected() {
        let observed = Array2::<f64>::zeros((NBASE, 3));
        let err = process_intensities(
            observed.view(),
            Array2::eye(NBASE).view(),
            Array2::eye(2).view(),
            observed.view(),
        )
        .unwrap_err();
        assert!(matches!(err, MatrixError::DimensionMismatch { .. }));

        let bad = expected_intensities(1.0, &[Base::A], crosstalk().view(), Array2::eye(2).view(), Array2::zeros((NBASE, 1)).view());
        assert!(bad.is_err());
    }

    #[test]
    fn into_variant_reuses_wrongly_sized_buffer() {
        let observed = Array2::from_elem((NBASE, 3), 2.0);
        let mut out = Array2::zeros((1, 1));
        process_intensities_into(
            observed.view(),
            Array2::eye(NBASE).view(),
            Array2::eye(3).view(),
            Array2::zeros((NBASE, 3)).view(),
            &mut out,
        )
        .unwrap();
        assert_eq!(out, observed);
    }

    #[test]
    fn residuals_are_summed_squares() {
        let a = array![[1.0, 2.0], [3.0, 4.0]];
        let b = array![[0.0, 2.0], [1.0, 4.0]];
        assert_abs_diff_eq!(residual_sum_of_squares(a.view(), b.view()), 5.0);
    }
}
