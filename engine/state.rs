//! # Model State
//!
//! Everything the estimator and caller learn about one block: the shared distortion
//! matrices, per-cluster brightness and weight, per-cycle residual variance, and the
//! current calls. The state is created by [`initialise`], then handed by mutable
//! reference to the estimator and the caller in turn; nothing else holds it.

use crate::config::InitialMatrices;
use crate::intensity::process_intensities_into;
use crate::matrix::{self, MatrixError};
use crate::nucleotide::{Base, MIN_QUALITY, NBASE};
use crate::tile::Tile;
use ndarray::{Array1, Array2, ArrayView2};
use rayon::prelude::*;

#[derive(Debug, Clone)]
pub struct ModelState {
    /// Crosstalk `M`, `NBASE × NBASE`, indexed `[channel, base]`.
    pub crosstalk: Array2<f64>,
    /// Phasing `P`, `ncycle × ncycle`.
    pub phasing: Array2<f64>,
    /// Additive noise `N`, `NBASE × ncycle`.
    pub noise: Array2<f64>,
    /// Per-cluster brightness, never negative.
    pub lambda: Array1<f64>,
    /// Per-cluster robustness weights from the last reweighting.
    pub weights: Array1<f64>,
    /// Per-cycle residual variance, the trace of that cycle's covariance.
    pub cycle_var: Array1<f64>,
    pub bases: Vec<Vec<Base>>,
    pub qualities: Vec<Vec<u8>>,
}

impl ModelState {
    pub fn ncluster(&self) -> usize {
        self.lambda.len()
    }

    pub fn ncycle(&self) -> usize {
        self.phasing.nrows()
    }

    /// `(M⁻¹)ᵗ` and `(P⁻¹)ᵗ`, the form [`crate::intensity::process_intensities`] expects.
    pub fn inverse_transposes(&self) -> Result<(Array2<f64>, Array2<f64>), MatrixError> {
        let minv_t = matrix::transpose(&matrix::invert(&self.crosstalk)?);
        let pinv_t = matrix::transpose(&matrix::invert(&self.phasing)?);
        Ok((minv_t, pinv_t))
    }
}

/// Calls each cycle as the base with the largest processed intensity.
pub fn argmax_calls(processed: ArrayView2<f64>) -> Vec<Base> {
    processed
        .columns()
        .into_iter()
        .map(|column| {
            let mut best = 0;
            for (b, &v) in column.iter().enumerate() {
                if v > column[best] {
                    best = b;
                }
            }
            Base::from_index(best)
        })
        .collect()
}

/// Ordinary least-squares brightness: the mean processed intensity of the called base
/// over non-ambiguous cycles, clamped at zero.
pub fn brightness_ols(processed: ArrayView2<f64>, bases: &[Base]) -> f64 {
    let (sum, count) = bases
        .iter()
        .enumerate()
        .filter_map(|(cycle, base)| base.index().map(|b| processed[[b, cycle]]))
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).max(0.0)
}

/// Builds the starting state of a block.
///
/// `M`, `N` and `P` come from the supplied matrices or their defaults; weights and
/// cycle variances start at one. Each cluster is then called by arg-max of its
/// processed intensities, its brightness fitted by least squares against those calls,
/// and every quality set to the minimum.
pub fn initialise(tile: &Tile, initial: &InitialMatrices) -> Result<ModelState, MatrixError> {
    let ncycle = tile.ncycle();
    let ncluster = tile.ncluster();
    let start = initial.for_block(ncycle)?;

    let minv_t = matrix::transpose(&matrix::invert(&start.crosstalk)?);
    let pinv_t = matrix::transpose(&matrix::invert(&start.phasing)?);

    let fitted: Vec<(Vec<Base>, f64)> = tile
        .clusters()
        .par_iter()
        .map_init(
            || Array2::zeros((NBASE, ncycle)),
            |processed, cluster| {
                process_intensities_into(
                    cluster.signals.view(),
                    minv_t.view(),
                    pinv_t.view(),
                    start.noise.view(),
                    processed,
                )?;
                let calls = argmax_calls(processed.view());
                let lambda = brightness_ols(processed.view(), &calls);
                Ok::<_, MatrixError>((calls, lambda))
            },
        )
        .collect::<Result<_, MatrixError>>()?;

    let (bases, lambdas): (Vec<_>, Vec<_>) = fitted.into_iter().unzip();
    log::debug!(
        "Initialised {} clusters over {} cycles; mean brightness {:.2}.",
        ncluster,
        ncycle,
        lambdas.iter().sum::<f64>() / ncluster.max(1) as f64
    );

    Ok(ModelState {
        crosstalk: start.crosstalk,
        phasing: start.phasing,
        noise: start.noise,
        lambda: Array1::from(lambdas),
        weights: Array1::ones(ncluster),
        cycle_var: Array1::ones(ncycle),
        bases,
        qualities: vec![vec![MIN_QUALITY; ncycle]; ncluster],
    })
}
