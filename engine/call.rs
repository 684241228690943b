//! # Base Caller
//!
//! Given the current distortion matrices, the caller
//!
//! * estimates a 4×4 residual covariance for every cycle from the processed
//!   intensities of all clusters, weighted by the estimator's robustness weights,
//! * records each cycle's total variance and inverts its covariance to a precision,
//! * and for every cluster fits the brightness, picks the base minimising the
//!   Mahalanobis-type statistic per cycle, and turns the competing statistics into a
//!   posterior probability and Phred quality.

use crate::config::ModelConfig;
use crate::diagnostics::DiagnosticsSink;
use crate::intensity::process_intensities_into;
use crate::matrix::{self, MatrixError};
use crate::nucleotide::{Base, MIN_QUALITY, NBASE, quality_from_probability};
use crate::state::ModelState;
use crate::tile::Tile;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Residual covariance of cycle {cycle} is not positive definite: {source}")]
    SingularCovariance {
        cycle: usize,
        #[source]
        source: MatrixError,
    },

    #[error("Total cluster weight is zero; residual covariances cannot be estimated.")]
    ZeroTotalWeight,

    #[error("Model state describes {found} clusters, but the tile holds {expected}.")]
    ClusterCountMismatch { expected: usize, found: usize },

    #[error("Model state describes {found} cycles, but the tile holds {expected}.")]
    CycleCountMismatch { expected: usize, found: usize },

    #[error("Numerical fault during base calling: {0}")]
    Matrix(#[from] MatrixError),
}

/// A called base with its quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseQuality {
    pub base: Base,
    pub quality: u8,
}

impl BaseQuality {
    /// Returned when the cluster carries no signal.
    pub const NULL: BaseQuality = BaseQuality {
        base: Base::A,
        quality: MIN_QUALITY,
    };
}

/// Weighted per-cycle residual covariances, shape `[ncycle, NBASE, NBASE]`.
///
/// The residual of a cycle is `p − λ e_b`, with `e_b` the unit vector of the called
/// base (zero for an ambiguous call). Its outer product is accumulated in expanded
/// form, `ppᵗ − λ(e_b pᵗ + p e_bᵗ) + λ² e_b e_bᵗ`, so only the called row and column
/// need correcting.
pub fn residual_covariances(
    state: &ModelState,
    tile: &Tile,
    minv_t: ArrayView2<f64>,
    pinv_t: ArrayView2<f64>,
) -> Result<Array3<f64>, CallError> {
    let ncycle = tile.ncycle();
    let zero = || (Array3::<f64>::zeros((ncycle, NBASE, NBASE)), 0.0_f64);

    let (mut covariance, total_weight) = tile
        .clusters()
        .par_iter()
        .enumerate()
        .fold(
            || (Ok::<_, MatrixError>(zero()), Array2::<f64>::zeros((NBASE, ncycle))),
            |(acc, mut processed), (i, cluster)| {
                let acc = acc.and_then(|(mut sum, wsum)| {
                    process_intensities_into(
                        cluster.signals.view(),
                        minv_t,
                        pinv_t,
                        state.noise.view(),
                        &mut processed,
                    )?;
                    let w = state.weights[i];
                    add_residual_products(&mut sum, processed.view(), &state.bases[i], state.lambda[i], w);
                    Ok((sum, wsum + w))
                });
                (acc, processed)
            },
        )
        .map(|(acc, _)| acc)
        .try_reduce(&zero, |(a, wa), (b, wb)| Ok((a + b, wa + wb)))?;

    if !(total_weight > 0.0) {
        return Err(CallError::ZeroTotalWeight);
    }
    covariance.mapv_inplace(|v| v / total_weight);
    Ok(covariance)
}

fn add_residual_products(
    sum: &mut Array3<f64>,
    processed: ArrayView2<f64>,
    bases: &[Base],
    lambda: f64,
    w: f64,
) {
    for (cy, base) in bases.iter().enumerate() {
        let p = processed.column(cy);
        let mut v = sum.index_axis_mut(Axis(0), cy);
        for j in 0..NBASE {
            for k in 0..NBASE {
                v[[j, k]] += w * p[j] * p[k];
            }
        }
        if let Some(b) = base.index() {
            for k in 0..NBASE {
                v[[b, k]] -= w * lambda * p[k];
                v[[k, b]] -= w * lambda * p[k];
            }
            v[[b, b]] += w * lambda * lambda;
        }
    }
}

/// Weighted least-squares brightness against the given calls, weighting each cycle by
/// the reciprocal of its variance and skipping ambiguous cycles. Clamped at zero.
pub fn brightness_wls(processed: ArrayView2<f64>, bases: &[Base], cycle_var: ArrayView1<f64>) -> f64 {
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (cy, base) in bases.iter().enumerate() {
        if let Some(b) = base.index() {
            let precision = 1.0 / cycle_var[cy];
            numerator += processed[[b, cy]] * precision;
            denominator += precision;
        }
    }
    if !(denominator > 0.0) {
        return 0.0;
    }
    (numerator / denominator).max(0.0)
}

/// Calls one cycle of one cluster.
///
/// # Arguments
/// * `p` - Processed intensities of the cycle.
/// * `lambda` - Brightness of the cluster. Zero gives [`BaseQuality::NULL`].
/// * `penalty` - Prior penalty per base, added to the call statistic.
/// * `omega` - Precision matrix of the cycle.
/// * `mu` - Controls the spread of the quality scores.
pub fn call_base(
    p: ArrayView1<f64>,
    lambda: f64,
    penalty: &[f64; NBASE],
    omega: ArrayView2<f64>,
    mu: f64,
) -> BaseQuality {
    if lambda == 0.0 {
        return BaseQuality::NULL;
    }

    let mut stat = [0.0; NBASE];
    let mut call = 0;
    let mut min_stat = f64::INFINITY;
    for b in 0..NBASE {
        let cross = omega.row(b).dot(&p);
        stat[b] = lambda * (lambda * omega[[b, b]] - 2.0 * cross) + penalty[b];
        if stat[b] < min_stat {
            min_stat = stat[b];
            call = b;
        }
    }

    // Probabilities relative to the best call; the common factor exp(-(K + min)/2)
    // is carried separately as `max_prob`.
    let tot: f64 = stat.iter().map(|s| (-0.5 * (s - min_stat)).exp()).sum();
    let k = p.dot(&omega.dot(&p));
    let max_prob = (-0.5 * (k + min_stat)).exp();

    let exp_pen = (-0.5 * penalty[call]).exp();
    let posterior = if max_prob < mu {
        (exp_pen * mu + max_prob) / (4.0 * mu + max_prob * tot)
    } else {
        (exp_pen * mu / max_prob + 1.0) / (4.0 * mu / max_prob + tot)
    };

    BaseQuality {
        base: Base::from_index(call),
        quality: quality_from_probability(posterior),
    }
}

/// Recomputes cycle variances and precisions, then calls every cluster and refits its
/// brightness. Updates `state` in place.
pub fn call_bases(
    state: &mut ModelState,
    tile: &Tile,
    config: &ModelConfig,
    sink: &dyn DiagnosticsSink,
) -> Result<(), CallError> {
    if state.ncluster() != tile.ncluster() {
        return Err(CallError::ClusterCountMismatch {
            expected: tile.ncluster(),
            found: state.ncluster(),
        });
    }
    let ncycle = tile.ncycle();
    if state.ncycle() != ncycle {
        return Err(CallError::CycleCountMismatch {
            expected: ncycle,
            found: state.ncycle(),
        });
    }

    let (minv_t, pinv_t) = state.inverse_transposes()?;
    sink.matrix("Inverse crosstalk (transposed)", minv_t.view());

    let covariance = residual_covariances(state, tile, minv_t.view(), pinv_t.view())?;
    let mut omega = Array3::<f64>::zeros((ncycle, NBASE, NBASE));
    for (cy, v) in covariance.outer_iter().enumerate() {
        state.cycle_var[cy] = v.diag().sum();
        let inverse = matrix::invert_symmetric(&v)
            .map_err(|source| CallError::SingularCovariance { cycle: cy, source })?;
        omega.index_axis_mut(Axis(0), cy).assign(&inverse);
        sink.matrix(&format!("Covariance of cycle {}", cy + 1), v);
        sink.matrix(&format!("Precision of cycle {}", cy + 1), inverse.view());
    }

    let penalties = config.penalties();
    let mu = config.mu;
    let cycle_var = state.cycle_var.view();
    let detail = sink.wants_cluster_detail();

    let called: Vec<(Vec<BaseQuality>, f64)> = tile
        .clusters()
        .par_iter()
        .enumerate()
        .map_init(
            || Array2::zeros((NBASE, ncycle)),
            |processed, (i, cluster)| {
                process_intensities_into(
                    cluster.signals.view(),
                    minv_t.view(),
                    pinv_t.view(),
                    state.noise.view(),
                    processed,
                )?;
                if detail {
                    sink.cluster_matrix(i, "Processed intensities", processed.view());
                }
                let lambda = brightness_wls(processed.view(), &state.bases[i], cycle_var);
                let calls: Vec<BaseQuality> = (0..ncycle)
                    .map(|cy| {
                        call_base(
                            processed.column(cy),
                            lambda,
                            &penalties,
                            omega.index_axis(Axis(0), cy),
                            mu,
                        )
                    })
                    .collect();
                let bases: Vec<Base> = calls.iter().map(|c| c.base).collect();
                let refit = brightness_wls(processed.view(), &bases, cycle_var);
                Ok::<_, MatrixError>((calls, refit))
            },
        )
        .collect::<Result<_, MatrixError>>()?;

    let mut lambda = Array1::zeros(called.len());
    for (i, (calls, refit)) in called.into_iter().enumerate() {
        state.bases[i] = calls.iter().map(|c| c.base).collect();
        state.qualities[i] = calls.iter().map(|c| c.quality).collect();
        lambda[i] = refit;
    }
    state.lambda = lambda;
    sink.vector("Brightness", state.lambda.view());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InitialMatrices;
    use crate::diagnostics::NoDiagnostics;
    use crate::state::initialise;
    use crate::tile::Cluster;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn zero_brightness_gives_null_call() {
        let p = array![0.0, 5.0, 0.0, 0.0];
        let omega = Array2::eye(NBASE);
        let call = call_base(p.view(), 0.0, &[0.0; NBASE], omega.view(), 1e-5);
        assert_eq!(call, BaseQuality::NULL);
        assert_eq!(call.base, Base::A);
        assert_eq!(call.quality, MIN_QUALITY);
    }

    #[test]
    fn clear_signal_is_called_with_high_quality() {
        let p = array![0.3, 0.1, 9.8, -0.2];
        let omega = Array2::eye(NBASE);
        let call = call_base(p.view(), 10.0, &[0.0; NBASE], omega.view(), 1e-5);
        assert_eq!(call.base, Base::G);
        assert!(call.quality >= 40, "quality {}", call.quality);
    }

    #[test]
    fn residual_far_from_every_base_falls_back_to_the_prior() {
        let omega = Array2::eye(NBASE);
        // K + min = 400, so exp(-(K + min)/2) is far below mu and the posterior
        // collapses towards a uniform 1/4.
        let outlier = call_base(array![30.0, 0.0, 0.0, 0.0].view(), 10.0, &[0.0; NBASE], omega.view(), 1e-5);
        assert_eq!(outlier.base, Base::A);
        assert_eq!(outlier.quality, 1);

        let fitted = call_base(array![10.0, 0.0, 0.0, 0.0].view(), 10.0, &[0.0; NBASE], omega.view(), 1e-5);
        assert_eq!(fitted.base, Base::A);
        assert!(fitted.quality > 40, "quality {}", fitted.quality);
    }

    #[test]
    fn ambiguous_signal_gets_lower_quality() {
        let omega = Array2::eye(NBASE);
        let clear = call_base(array![0.0, 10.0, 0.0, 0.0].view(), 10.0, &[0.0; NBASE], omega.view(), 1e-5);
        let split = call_base(array![0.0, 5.2, 4.8, 0.0].view(), 10.0, &[0.0; NBASE], omega.view(), 1e-5);
        assert_eq!(split.base, Base::C);
        assert!(split.quality < clear.quality);
    }

    #[test]
    fn penalty_breaks_a_tie() {
        let omega = Array2::eye(NBASE);
        let p = array![5.0, 5.0, 0.0, 0.0];
        let call = call_base(p.view(), 10.0, &[0.5, 0.0, 0.0, 0.5], omega.view(), 1e-5);
        assert_eq!(call.base, Base::C);
    }

    #[test]
    fn wls_brightness_weights_by_precision() {
        let processed = array![[10.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 20.0, 0.0], [0.0, 0.0, 7.0]];
        let bases = [Base::A, Base::G, Base::N];
        let var = array![1.0, 3.0, 1.0];
        // (10 / 1 + 20 / 3) / (1 + 1/3) = 12.5
        assert_abs_diff_eq!(brightness_wls(processed.view(), &bases, var.view()), 12.5, epsilon = 1e-12);
        assert_eq!(brightness_wls(processed.view(), &[Base::N; 3], var.view()), 0.0);
    }

    fn identity_tile() -> (Tile, InitialMatrices) {
        let signals = |called: &[usize], lambda: f64, jitter: f64| {
            let mut s = Array2::from_elem((NBASE, called.len()), jitter);
            for (cy, &b) in called.iter().enumerate() {
                s[[b, cy]] = lambda + jitter;
            }
            s
        };
        let clusters = vec![
            Cluster::new(0, 0, signals(&[0, 2, 1], 100.0, 1.0)),
            Cluster::new(1, 0, signals(&[3, 3, 0], 80.0, -2.0)),
            Cluster::new(2, 0, signals(&[1, 0, 2], 120.0, 3.0)),
            Cluster::new(3, 0, signals(&[2, 1, 3], 90.0, -1.5)),
            Cluster::new(4, 0, signals(&[0, 3, 3], 110.0, 0.5)),
        ];
        let tile = Tile::new(1, 1, 3, clusters).unwrap();
        let initial = InitialMatrices {
            crosstalk: Some(Array2::eye(NBASE)),
            noise: Some(Array2::zeros((NBASE, 3))),
            phasing: Some(Array2::eye(3)),
        };
        (tile, initial)
    }

    #[test]
    fn covariances_are_symmetric_and_positive() {
        let (tile, initial) = identity_tile();
        let state = initialise(&tile, &initial).unwrap();
        let eye3 = Array2::eye(3);
        let covariance =
            residual_covariances(&state, &tile, Array2::eye(NBASE).view(), eye3.view()).unwrap();
        for v in covariance.outer_iter() {
            for j in 0..NBASE {
                assert!(v[[j, j]] > 0.0);
                for k in 0..NBASE {
                    assert_abs_diff_eq!(v[[j, k]], v[[k, j]], epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn call_bases_recovers_brightest_channels() {
        let (tile, initial) = identity_tile();
        let mut state = initialise(&tile, &initial).unwrap();
        call_bases(&mut state, &tile, &ModelConfig::default(), &NoDiagnostics).unwrap();

        let expected = [[0, 2, 1], [3, 3, 0], [1, 0, 2], [2, 1, 3], [0, 3, 3]];
        for (i, row) in expected.iter().enumerate() {
            let want: Vec<Base> = row.iter().map(|&b| Base::from_index(b)).collect();
            assert_eq!(state.bases[i], want, "cluster {i}");
        }
        assert!(state.cycle_var.iter().all(|&v| v > 0.0));
        assert!(state.lambda.iter().all(|&l| l > 0.0));
    }

    #[test]
    fn state_and_tile_must_agree_on_cycles() {
        let (tile, initial) = identity_tile();
        let mut state = initialise(&tile, &initial).unwrap();
        assert_eq!(state.ncycle(), 3);
        let shorter = tile.select_cycles(&[0..2]).unwrap();
        let err = call_bases(&mut state, &shorter, &ModelConfig::default(), &NoDiagnostics).unwrap_err();
        assert!(matches!(err, CallError::CycleCountMismatch { expected: 2, found: 3 }));
    }
}
