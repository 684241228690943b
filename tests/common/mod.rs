//! Synthetic tiles drawn from the forward model with a fixed seed.

use ndarray::Array2;
use phasecall::config::default_crosstalk;
use phasecall::intensity::expected_intensities;
use phasecall::nucleotide::{Base, NBASE};
use phasecall::tile::{Cluster, Tile};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};

pub struct Synthetic {
    pub tile: Tile,
    pub truth: Vec<Vec<Base>>,
}

/// Each cycle keeps most of its signal and lags a little into the next.
pub fn lagging_phasing(ncycle: usize) -> Array2<f64> {
    Array2::from_shape_fn((ncycle, ncycle), |(i, j)| {
        if i == j {
            0.96
        } else if j == i + 1 {
            0.04
        } else {
            0.0
        }
    })
}

pub fn synthetic_tile(ncluster: usize, ncycle: usize, seed: u64) -> Synthetic {
    let mut rng = StdRng::seed_from_u64(seed);
    let brightness = Uniform::new(600.0, 1400.0);
    let jitter = Normal::new(0.0, 4.0).unwrap();
    let crosstalk = default_crosstalk();
    let phasing = lagging_phasing(ncycle);
    let noise = Array2::from_elem((NBASE, ncycle), 15.0);

    let mut clusters = Vec::with_capacity(ncluster);
    let mut truth = Vec::with_capacity(ncluster);
    for i in 0..ncluster {
        let bases: Vec<Base> = (0..ncycle)
            .map(|_| Base::from_index(rng.gen_range(0..NBASE)))
            .collect();
        let lambda = brightness.sample(&mut rng);
        let mut signals =
            expected_intensities(lambda, &bases, crosstalk.view(), phasing.view(), noise.view()).unwrap();
        signals.mapv_inplace(|v| v + jitter.sample(&mut rng));
        clusters.push(Cluster::new(i as u32, 2 * i as u32, signals));
        truth.push(bases);
    }

    Synthetic {
        tile: Tile::new(1, 1, ncycle, clusters).unwrap(),
        truth,
    }
}

/// Fraction of calls that agree with the truth over the given cycles.
pub fn accuracy(calls: &[Vec<Base>], truth: &[Vec<Base>], cycles: std::ops::Range<usize>) -> f64 {
    let mut agree = 0;
    let mut total = 0;
    for (called, expected) in calls.iter().zip(truth) {
        for (c, t) in called.iter().zip(&expected[cycles.clone()]) {
            agree += usize::from(c == t);
            total += 1;
        }
    }
    agree as f64 / total as f64
}
