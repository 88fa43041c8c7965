//! K-means clustering used to initialize Gaussian mixtures.

use super::{check_dim, MachineError};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Cluster means, one row per cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansMachine {
    pub means: Array2<f64>,
}

impl KMeansMachine {
    /// Index of the closest mean and the squared distance to it.
    pub fn closest(&self, x: ArrayView1<'_, f64>) -> (usize, f64) {
        let mut best = (0, f64::INFINITY);
        for (i, mean) in self.means.rows().into_iter().enumerate() {
            let distance: f64 = mean.iter().zip(x.iter()).map(|(m, v)| (m - v).powi(2)).sum();
            if distance < best.1 {
                best = (i, distance);
            }
        }
        best
    }

    /// Per-cluster variances (divided by the cluster size) and the fraction
    /// of samples each cluster holds.
    pub fn variances_and_weights(
        &self,
        data: &Array2<f64>,
    ) -> Result<(Array2<f64>, Array1<f64>), MachineError> {
        check_dim(self.means.ncols(), data.ncols())?;
        let (k, d) = self.means.dim();
        let mut counts = vec![0usize; k];
        let mut sums = Array2::<f64>::zeros((k, d));
        let mut squares = Array2::<f64>::zeros((k, d));
        for row in data.rows() {
            let (i, _) = self.closest(row);
            counts[i] += 1;
            let mut sum = sums.row_mut(i);
            sum += &row;
            let mut square = squares.row_mut(i);
            square += &row.mapv(|v| v * v);
        }

        let mut variances = Array2::<f64>::zeros((k, d));
        for (i, &count) in counts.iter().enumerate() {
            if count == 0 {
                return Err(MachineError::EmptyCluster(i));
            }
            let mean = sums.row(i).to_owned() / count as f64;
            let variance = squares.row(i).to_owned() / count as f64 - mean.mapv(|v| v * v);
            variances.row_mut(i).assign(&variance);
        }
        let weights = Array1::from_iter(counts.iter().map(|&c| c as f64 / data.nrows() as f64));
        Ok((variances, weights))
    }
}

#[derive(Debug, Clone)]
pub struct KMeansTrainer {
    pub max_iterations: usize,
    pub convergence_threshold: f64,
    pub seed: u64,
}

impl KMeansTrainer {
    /// Cluster the rows of `data` into `k` groups.
    ///
    /// Means start at `k` distinct samples drawn with the seeded generator.
    /// Each iteration recomputes the means and stops early once the relative
    /// change of the average squared distance falls below the threshold.
    pub fn train(&self, data: &Array2<f64>, k: usize) -> Result<KMeansMachine, MachineError> {
        let n = data.nrows();
        if n == 0 {
            return Err(MachineError::EmptyData);
        }
        if k == 0 || k > n {
            return Err(MachineError::InvalidParameter(format!(
                "cannot form {k} clusters from {n} samples"
            )));
        }

        let mut machine = KMeansMachine {
            means: self.initial_means(data, k)?,
        };
        let mut assignment = assign(&machine, data);

        for iteration in 0..self.max_iterations {
            let previous = assignment.average_distance;
            machine.means = update_means(data, &assignment.labels, k)?;
            assignment = assign(&machine, data);

            let change = if previous > 0.0 {
                ((assignment.average_distance - previous) / previous).abs()
            } else {
                0.0
            };
            tracing::debug!(
                iteration,
                average_distance = assignment.average_distance,
                change,
                "k-means iteration"
            );
            if change <= self.convergence_threshold {
                break;
            }
        }
        Ok(machine)
    }

    fn initial_means(&self, data: &Array2<f64>, k: usize) -> Result<Array2<f64>, MachineError> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut order: Vec<usize> = (0..data.nrows()).collect();
        order.shuffle(&mut rng);

        let mut chosen: Vec<usize> = Vec::with_capacity(k);
        for index in order {
            let row = data.row(index);
            if chosen.iter().all(|&c| data.row(c) != row) {
                chosen.push(index);
                if chosen.len() == k {
                    break;
                }
            }
        }
        if chosen.len() < k {
            return Err(MachineError::InvalidParameter(format!(
                "only {} distinct samples for {k} clusters",
                chosen.len()
            )));
        }
        Ok(data.select(Axis(0), &chosen))
    }
}

struct Assignment {
    labels: Vec<usize>,
    average_distance: f64,
}

fn assign(machine: &KMeansMachine, data: &Array2<f64>) -> Assignment {
    let mut labels = Vec::with_capacity(data.nrows());
    let mut total = 0.0;
    for row in data.rows() {
        let (label, distance) = machine.closest(row);
        labels.push(label);
        total += distance;
    }
    Assignment {
        labels,
        average_distance: total / data.nrows() as f64,
    }
}

fn update_means(data: &Array2<f64>, labels: &[usize], k: usize) -> Result<Array2<f64>, MachineError> {
    let mut sums = Array2::<f64>::zeros((k, data.ncols()));
    let mut counts = vec![0usize; k];
    for (row, &label) in data.rows().into_iter().zip(labels) {
        let mut sum = sums.row_mut(label);
        sum += &row;
        counts[label] += 1;
    }
    for (i, &count) in counts.iter().enumerate() {
        if count == 0 {
            return Err(MachineError::EmptyCluster(i));
        }
        let mut sum = sums.row_mut(i);
        sum /= count as f64;
    }
    Ok(sums)
}
