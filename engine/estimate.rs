//! # Parameter Estimator
//!
//! One call to [`estimate_parameters`] is one pass of the estimator over a block:
//!
//! 1. Clusters are reweighted with a Cauchy kernel on their squared residual, so that
//!    outlying clusters contribute less to the fit.
//! 2. The weighted sufficient statistics of the tile are accumulated once.
//! 3. Phasing (with noise) and crosstalk (with noise) are solved alternately by
//!    generalized least squares for a fixed number of rounds. After every solve the
//!    new matrix is rescaled to unit determinant and the scale is pushed into the
//!    statistics and into the cluster brightness, so `λ·M·S·P` is unchanged.
//!
//! The pass returns the reduction in weighted loss, which is reported for diagnostics
//! and never used to stop early.

use crate::config::ModelConfig;
use crate::intensity::{expected_intensities, residual_sum_of_squares};
use crate::matrix::{self, MatrixError};
use crate::nucleotide::{Base, NBASE};
use crate::state::ModelState;
use crate::tile::Tile;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Total cluster weight is zero; there are no clusters to estimate parameters from.")]
    ZeroTotalWeight,

    #[error("Model state describes {found} clusters, but the tile holds {expected}.")]
    ClusterCountMismatch { expected: usize, found: usize },

    #[error("Numerical fault during parameter estimation: {0}")]
    Matrix(#[from] MatrixError),
}

/// Squared residual of every cluster under the current parameters.
pub fn cluster_losses(state: &ModelState, tile: &Tile) -> Result<Vec<f64>, MatrixError> {
    tile.clusters()
        .par_iter()
        .enumerate()
        .map(|(i, cluster)| {
            let expected = expected_intensities(
                state.lambda[i],
                &state.bases[i],
                state.crosstalk.view(),
                state.phasing.view(),
                state.noise.view(),
            )?;
            Ok(residual_sum_of_squares(cluster.signals.view(), expected.view()))
        })
        .collect()
}

/// Cauchy-kernel weights `1 / (1 + (loss − mean)² / var)`.
///
/// `var` is the sample variance of the losses. When it is zero or not finite every
/// cluster gets weight one.
pub fn robust_weights(losses: &[f64]) -> Array1<f64> {
    let n = losses.len();
    if n == 0 {
        return Array1::zeros(0);
    }
    let mean = losses.iter().sum::<f64>() / n as f64;
    let var = if n > 1 {
        losses.iter().map(|l| (l - mean) * (l - mean)).sum::<f64>() / (n - 1) as f64
    } else {
        0.0
    };
    if !(var.is_finite() && var > 0.0) {
        return Array1::ones(n);
    }
    losses
        .iter()
        .map(|l| 1.0 / (1.0 + (l - mean) * (l - mean) / var))
        .collect()
}

/// Recomputes the cluster weights from the current residuals and returns the total
/// unweighted loss.
pub fn reweight(state: &mut ModelState, tile: &Tile) -> Result<f64, MatrixError> {
    let losses = cluster_losses(state, tile)?;
    state.weights = robust_weights(&losses);
    Ok(losses.iter().sum())
}

/// Σ wᵢ · lossᵢ under the current parameters and weights.
pub fn weighted_loss(state: &ModelState, tile: &Tile) -> Result<f64, MatrixError> {
    let losses = cluster_losses(state, tile)?;
    Ok(losses
        .iter()
        .zip(state.weights.iter())
        .map(|(l, w)| l * w)
        .sum())
}

/// Weighted sums over clusters that the least-squares solves need.
///
/// Rows and columns of `j` and `k` are indexed `cycle * NBASE + inner`, where `inner`
/// is a base for `j` and for the rows of `k`, and a channel for the columns of `k`.
#[derive(Debug, Clone)]
pub struct SufficientStatistics {
    /// `Σ w λ² [s_a = b₁][s_c = b₂]`.
    pub j: Array2<f64>,
    /// `Σ w λ [s_a = b] I[ch, c]`.
    pub k: Array2<f64>,
    /// `Σ w λ [s_a = b]`, indexed `[base, cycle]`.
    pub sbar: Array2<f64>,
    /// `Σ w I`, indexed `[channel, cycle]`.
    pub ibar: Array2<f64>,
    /// `Σ w`.
    pub wbar: f64,
}

impl SufficientStatistics {
    pub fn zeros(ncycle: usize) -> Self {
        let dim = NBASE * ncycle;
        Self {
            j: Array2::zeros((dim, dim)),
            k: Array2::zeros((dim, dim)),
            sbar: Array2::zeros((NBASE, ncycle)),
            ibar: Array2::zeros((NBASE, ncycle)),
            wbar: 0.0,
        }
    }

    pub fn ncycle(&self) -> usize {
        self.sbar.ncols()
    }

    fn add_cluster(&mut self, weight: f64, lambda: f64, bases: &[Base], signals: ArrayView2<f64>) {
        let ncycle = self.ncycle();
        let wl = weight * lambda;
        let wl2 = wl * lambda;

        for (a, base_a) in bases.iter().enumerate() {
            let Some(b1) = base_a.index() else { continue };
            let row = a * NBASE + b1;
            self.sbar[[b1, a]] += wl;
            for (c, base_c) in bases.iter().enumerate() {
                if let Some(b2) = base_c.index() {
                    self.j[[row, c * NBASE + b2]] += wl2;
                }
            }
            for c in 0..ncycle {
                for ch in 0..NBASE {
                    self.k[[row, c * NBASE + ch]] += wl * signals[[ch, c]];
                }
            }
        }
        self.ibar.scaled_add(weight, &signals);
        self.wbar += weight;
    }

    fn merge(mut self, other: Self) -> Self {
        self.j += &other.j;
        self.k += &other.k;
        self.sbar += &other.sbar;
        self.ibar += &other.ibar;
        self.wbar += other.wbar;
        self
    }

    /// Accumulates the statistics of every cluster in parallel.
    pub fn accumulate(state: &ModelState, tile: &Tile) -> Self {
        let ncycle = tile.ncycle();
        tile.clusters()
            .par_iter()
            .enumerate()
            .fold(
                || SufficientStatistics::zeros(ncycle),
                |mut acc, (i, cluster)| {
                    acc.add_cluster(
                        state.weights[i],
                        state.lambda[i],
                        &state.bases[i],
                        cluster.signals.view(),
                    );
                    acc
                },
            )
            .reduce(|| SufficientStatistics::zeros(ncycle), SufficientStatistics::merge)
    }

    /// Absorbs a rescaling of the brightness by `f`.
    pub fn rescale(&mut self, f: f64) {
        self.j.mapv_inplace(|v| v * f * f);
        self.k.mapv_inplace(|v| v * f);
        self.sbar.mapv_inplace(|v| v * f);
    }
}

/// Solves for phasing and noise given the transposed crosstalk `mt[base, channel]`.
///
/// The unknown is `X = [P; N]`, `(ncycle + NBASE) × ncycle`. Every column of the data
/// shares one design, so the per-cycle variances cancel and are not needed here.
pub fn solve_phasing(
    stats: &SufficientStatistics,
    mt: ArrayView2<f64>,
) -> Result<(Array2<f64>, Array2<f64>), MatrixError> {
    let n = stats.ncycle();
    matrix::ensure_shape(&mt, NBASE, NBASE, "solve_phasing (crosstalk)")?;
    let dim = n + NBASE;
    let mtm = mt.dot(&mt.t());

    let mut lhs = Array2::<f64>::zeros((dim, dim));
    let mut rhs = Array2::<f64>::zeros((dim, n));

    // --- Phasing block ---
    for a in 0..n {
        for c in 0..n {
            let block = stats.j.slice(s![a * NBASE..(a + 1) * NBASE, c * NBASE..(c + 1) * NBASE]);
            lhs[[a, c]] = (&block * &mtm).sum();
        }
        for c in 0..n {
            let block = stats.k.slice(s![a * NBASE..(a + 1) * NBASE, c * NBASE..(c + 1) * NBASE]);
            rhs[[a, c]] = (&block * &mt).sum();
        }
    }

    // --- Noise coupling and noise block ---
    for a in 0..n {
        for ch in 0..NBASE {
            let coupling = mt.column(ch).dot(&stats.sbar.column(a));
            lhs[[a, n + ch]] = coupling;
            lhs[[n + ch, a]] = coupling;
        }
    }
    for ch in 0..NBASE {
        lhs[[n + ch, n + ch]] = stats.wbar;
        rhs.row_mut(n + ch).assign(&stats.ibar.row(ch));
    }

    let x = matrix::solve_generalized_least_squares(lhs.view(), rhs.view())?;
    let phasing = x.slice(s![0..n, ..]).to_owned();
    let noise = x.slice(s![n.., ..]).to_owned();
    Ok((phasing, noise))
}

/// Solves for the transposed crosstalk and noise given phasing, weighting each cycle by
/// the reciprocal of its residual variance.
///
/// The unknown is `X = [Mᵗ; Nᵗ]`, `(NBASE + ncycle) × NBASE`; the returned noise is
/// transposed back to `NBASE × ncycle`.
pub fn solve_crosstalk(
    stats: &SufficientStatistics,
    phasing: ArrayView2<f64>,
    cycle_var: ArrayView1<f64>,
) -> Result<(Array2<f64>, Array2<f64>), MatrixError> {
    let n = stats.ncycle();
    matrix::ensure_shape(&phasing, n, n, "solve_crosstalk (phasing)")?;
    if cycle_var.len() != n {
        return Err(MatrixError::DimensionMismatch {
            operation: "solve_crosstalk (cycle variances)",
            expected_rows: n,
            expected_cols: 1,
            found_rows: cycle_var.len(),
            found_cols: 1,
        });
    }
    let dim = NBASE + n;
    let inv_var = cycle_var.mapv(|v| 1.0 / v);

    // P diag(1/v): column c of P scaled by 1/v_c.
    let pv = &phasing * &inv_var;
    let pvpt = pv.dot(&phasing.t());

    let mut lhs = Array2::<f64>::zeros((dim, dim));
    let mut rhs = Array2::<f64>::zeros((dim, NBASE));

    // --- Crosstalk block ---
    for a1 in 0..n {
        for a2 in 0..n {
            let weight = pvpt[[a1, a2]];
            let block = stats.j.slice(s![a1 * NBASE..(a1 + 1) * NBASE, a2 * NBASE..(a2 + 1) * NBASE]);
            lhs.slice_mut(s![0..NBASE, 0..NBASE]).scaled_add(weight, &block);
        }
    }
    for a in 0..n {
        for c in 0..n {
            let weight = pv[[a, c]];
            let block = stats.k.slice(s![a * NBASE..(a + 1) * NBASE, c * NBASE..(c + 1) * NBASE]);
            rhs.slice_mut(s![0..NBASE, ..]).scaled_add(weight, &block);
        }
    }

    // --- Noise coupling and noise block ---
    let coupling = stats.sbar.dot(&pv);
    for b in 0..NBASE {
        for c in 0..n {
            lhs[[b, NBASE + c]] = coupling[[b, c]];
            lhs[[NBASE + c, b]] = coupling[[b, c]];
        }
    }
    for c in 0..n {
        lhs[[NBASE + c, NBASE + c]] = stats.wbar * inv_var[c];
        for ch in 0..NBASE {
            rhs[[NBASE + c, ch]] = stats.ibar[[ch, c]] * inv_var[c];
        }
    }

    let x = matrix::solve_generalized_least_squares(lhs.view(), rhs.view())?;
    let mt = x.slice(s![0..NBASE, ..]).to_owned();
    let noise = matrix::transpose(&x.slice(s![NBASE.., ..]));
    Ok((mt, noise))
}

/// Runs one estimator pass, updating `M`, `P`, `N`, weights and brightness in place.
///
/// Returns the weighted loss before the update minus the weighted loss after it, both
/// under the weights assigned at the start of the pass.
pub fn estimate_parameters(
    state: &mut ModelState,
    tile: &Tile,
    config: &ModelConfig,
) -> Result<f64, EstimationError> {
    if state.ncluster() != tile.ncluster() {
        return Err(EstimationError::ClusterCountMismatch {
            expected: tile.ncluster(),
            found: state.ncluster(),
        });
    }

    // --- 1. Reweighting ---
    let total_loss = reweight(state, tile)?;
    let pre_update = weighted_loss(state, tile)?;

    // --- 2. Sufficient statistics ---
    let mut stats = SufficientStatistics::accumulate(state, tile);
    if !(stats.wbar > 0.0) {
        return Err(EstimationError::ZeroTotalWeight);
    }

    // --- 3. Alternating solves ---
    let tolerance = config.determinant_tolerance;
    let mut mt = matrix::transpose(&state.crosstalk);
    let mut phasing = state.phasing.clone();
    let mut noise = state.noise.clone();
    let mut lambda_scale = 1.0;

    for _ in 0..config.estimator_rounds {
        let (new_phasing, _) = solve_phasing(&stats, mt.view())?;
        phasing = new_phasing;
        let f = matrix::normalize_determinant(&mut phasing, tolerance)?;
        stats.rescale(f);
        lambda_scale *= f;

        let (new_mt, new_noise) = solve_crosstalk(&stats, phasing.view(), state.cycle_var.view())?;
        mt = new_mt;
        noise = new_noise;
        let f = matrix::normalize_determinant(&mut mt, tolerance)?;
        stats.rescale(f);
        lambda_scale *= f;
    }

    // --- 4. Write back ---
    matrix::transpose_in_place(&mut mt);
    state.crosstalk = mt;
    state.phasing = phasing;
    state.noise = noise;
    state.lambda.mapv_inplace(|l| l * lambda_scale);

    // --- 5. Loss reduction ---
    let post_update = weighted_loss(state, tile)?;
    log::debug!(
        "Estimator pass: total loss {:.6e}, weighted loss {:.6e} -> {:.6e}.",
        total_loss,
        pre_update,
        post_update
    );
    Ok(pre_update - post_update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InitialMatrices;
    use crate::state::initialise;
    use crate::tile::Cluster;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_linalg::Determinant;
    use rand::prelude::*;
    use rand::rngs::StdRng;

    #[test]
    fn single_outlier_is_downweighted() {
        let mut losses = vec![10.0; 8];
        losses.extend([0.0, 20.0]);
        let weights = robust_weights(&losses);
        assert!(weights[9] < weights[0], "outlier weight {} should be below {}", weights[9], weights[0]);
        assert!(weights[8] < weights[0]);
        assert_abs_diff_eq!(weights[0], 1.0, epsilon = 1e-12);
        assert!(weights.iter().all(|&w| w > 0.0 && w <= 1.0));
    }

    #[test]
    fn constant_losses_give_unit_weights() {
        assert_eq!(robust_weights(&[3.0, 3.0, 3.0]), Array1::ones(3));
        assert_eq!(robust_weights(&[5.0]), Array1::ones(1));
        assert_eq!(robust_weights(&[1.0, f64::INFINITY]), Array1::ones(2));
    }

    #[test]
    fn statistics_of_a_single_cluster() {
        let mut stats = SufficientStatistics::zeros(2);
        let signals = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0], [7.0, 8.0]];
        stats.add_cluster(0.5, 2.0, &[Base::C, Base::N], signals.view());

        assert_abs_diff_eq!(stats.wbar, 0.5);
        assert_abs_diff_eq!(stats.sbar[[1, 0]], 1.0);
        assert_abs_diff_eq!(stats.sbar.sum(), 1.0);
        // Only (cycle 0, base C) against itself contributes to J.
        assert_abs_diff_eq!(stats.j[[1, 1]], 2.0);
        assert_abs_diff_eq!(stats.j.sum(), 2.0);
        // K row for (cycle 0, base C) is w λ times the signals, cycle-major.
        assert_abs_diff_eq!(stats.k[[1, NBASE + 2]], 6.0);
        assert_abs_diff_eq!(stats.ibar[[3, 1]], 4.0);

        stats.rescale(2.0);
        assert_abs_diff_eq!(stats.j[[1, 1]], 8.0);
        assert_abs_diff_eq!(stats.k[[1, NBASE + 2]], 12.0);
        assert_abs_diff_eq!(stats.sbar[[1, 0]], 2.0);
        assert_abs_diff_eq!(stats.wbar, 0.5);
    }

    fn noiseless_tile(rng: &mut StdRng, ncluster: usize, ncycle: usize) -> Tile {
        let m = array![
            [1.2, 0.3, 0.05, 0.05],
            [0.2, 1.1, 0.05, 0.1],
            [0.05, 0.05, 0.9, 0.3],
            [0.1, 0.05, 0.2, 1.0]
        ];
        let p = Array2::from_shape_fn((ncycle, ncycle), |(a, c)| match (a, c) {
            _ if a == c => 0.94,
            _ if c == a + 1 => 0.05,
            _ if a == c + 1 => 0.01,
            _ => 0.0,
        });
        let n = Array2::from_elem((NBASE, ncycle), 5.0);
        let clusters = (0..ncluster)
            .map(|i| {
                let bases: Vec<Base> = (0..ncycle).map(|_| Base::from_index(rng.gen_range(0..NBASE))).collect();
                let lambda = 500.0 * (1.0 + 0.5 * rng.r#gen::<f64>());
                let mut signals =
                    expected_intensities(lambda, &bases, m.view(), p.view(), n.view()).unwrap();
                signals.mapv_inplace(|v| v + rng.gen_range(-2.0..2.0));
                Cluster::new(i as u32, 0, signals)
            })
            .collect();
        Tile::new(1, 1, ncycle, clusters).unwrap()
    }

    #[test]
    fn estimator_pass_normalises_and_reduces_loss() {
        let mut rng = StdRng::seed_from_u64(42);
        let tile = noiseless_tile(&mut rng, 120, 6);
        let mut state = initialise(&tile, &InitialMatrices::default()).unwrap();
        let config = ModelConfig::default();

        for _ in 0..2 {
            let reduction = estimate_parameters(&mut state, &tile, &config).unwrap();
            let pre = weighted_loss(&state, &tile).unwrap() + reduction;
            assert!(reduction >= -1e-6 * pre, "loss increased by {}", -reduction);
            assert_abs_diff_eq!(state.phasing.det().unwrap().abs(), 1.0, epsilon = 1e-6);
            assert_abs_diff_eq!(state.crosstalk.det().unwrap().abs(), 1.0, epsilon = 1e-6);
        }
        assert!(state.lambda.iter().all(|&l| l >= 0.0));
    }

    #[test]
    fn mismatched_state_is_rejected() {
        let mut rng = StdRng::seed_from_u64(7);
        let tile = noiseless_tile(&mut rng, 4, 3);
        let other = noiseless_tile(&mut rng, 5, 3);
        let mut state = initialise(&tile, &InitialMatrices::default()).unwrap();
        assert!(matches!(
            estimate_parameters(&mut state, &other, &ModelConfig::default()),
            Err(EstimationError::ClusterCountMismatch { expected: 5, found: 4 })
        ));
    }

    #[test]
    fn empty_tile_has_no_weight() {
        let tile = Tile::new(1, 1, 3, Vec::new()).unwrap();
        let mut state = initialise(&tile, &InitialMatrices::default()).unwrap();
        assert!(matches!(
            estimate_parameters(&mut state, &tile, &ModelConfig::default()),
            Err(EstimationError::ZeroTotalWeight)
        ));
    }
}
