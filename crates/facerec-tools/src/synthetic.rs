//! Seeded synthetic training data and fixed test fixtures.
//!
//! Every generator starts from a fresh `ChaCha8Rng` seeded with [`SEED`], so
//! equal calls produce equal data. Values are uniform in `[a, b)`, computed
//! as `v * (b - a) + a` from uniform `v` in `[0, 1)`.

use facerec_core::machine::GmmStats;
use ndarray::{Array, Dimension};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub const SEED: u64 = 42;

fn generator() -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(SEED)
}

fn uniform_like<D: Dimension>(rng: &mut ChaCha8Rng, template: &Array<f64, D>, a: f64, b: f64) -> Array<f64, D> {
    Array::from_shape_fn(template.raw_dim(), |_| rng.gen::<f64>() * (b - a) + a)
}

/// `count` random arrays shaped like `template`.
pub fn train_set<D: Dimension>(template: &Array<f64, D>, count: usize, a: f64, b: f64) -> Vec<Array<f64, D>> {
    let mut rng = generator();
    (0..count).map(|_| uniform_like(&mut rng, template, a, b)).collect()
}

/// `count` clients with `count` random arrays each.
pub fn train_set_by_id<D: Dimension>(
    template: &Array<f64, D>,
    count: usize,
    a: f64,
    b: f64,
) -> Vec<Vec<Array<f64, D>>> {
    let mut rng = generator();
    (0..count)
        .map(|_| (0..count).map(|_| uniform_like(&mut rng, template, a, b)).collect())
        .collect()
}

/// `count` clients with `count` copies of `template` each, with random
/// first and second order sums.
pub fn train_gmm_stats(template: &GmmStats, count: usize, a: f64, b: f64) -> Vec<Vec<GmmStats>> {
    let mut rng = generator();
    (0..count)
        .map(|_| {
            (0..count)
                .map(|_| {
                    let mut stats = template.clone();
                    stats.sum_px = uniform_like(&mut rng, &template.sum_px, a, b);
                    stats.sum_pxx = uniform_like(&mut rng, &template.sum_pxx, a, b);
                    stats
                })
                .collect()
        })
        .collect()
}

/// Deterministic features standing in for extractor output.
pub mod fixtures {
    use facerec_core::{Histogram, JetGraph, MachineError};
    use ndarray::{Array1, Array2};
    use std::f64::consts::PI;

    /// A linearized 8×8 gray image.
    pub fn linearize() -> Array1<f64> {
        Array1::from_shape_fn(64, |i| ((i * 97 + 13) % 256) as f64)
    }

    /// 30 blocks of 6 DCT coefficients.
    pub fn dct_blocks() -> Array2<f64> {
        Array2::from_shape_fn((30, 6), |(b, j)| 5.0 * (((b * 7 + j * 3) as f64) * 0.37).sin())
    }

    /// A 20-node graph with jets of length 8 and their phases.
    pub fn graph_with_phase() -> Result<JetGraph, MachineError> {
        let absolute = Array2::from_shape_fn((20, 8), |(n, j)| 0.5 + (((n * 8 + j) as f64) * 0.73).sin().abs());
        let phase = Array2::from_shape_fn((20, 8), |(n, j)| (((n * 5 + j * 3) as f64) * 0.41).sin() * PI);
        JetGraph::new(absolute, Some(phase))
    }

    /// 168 non-zero bins of value 200 at every third index.
    pub fn lgbphs_sparse() -> Result<Histogram, MachineError> {
        Histogram::sparse((0..168).map(|i| (i * 3, 200.0)).collect())
    }

    /// A dense 512-bin histogram with 255 in every third bin.
    pub fn lgbphs_no_phase() -> Histogram {
        Histogram::Dense(Array1::from_shape_fn(512, |i| if i % 3 == 0 { 255.0 } else { 0.0 }))
    }
}
