//! Diagonal-covariance Gaussian mixture models, their sufficient statistics
//! and the maximum-likelihood / MAP trainers.

use super::linear::expect_len;
use super::{check_dim, MachineError};
use crate::archive::{Archive, ArchiveError, Artifact};
use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};
use std::f64::consts::PI;

/// Mixture components with less accumulated occupancy keep their parameters.
const MIN_OCCUPANCY: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq)]
pub struct GmmMachine {
    weights: Array1<f64>,
    means: Array2<f64>,
    variances: Array2<f64>,
    variance_thresholds: Array2<f64>,
    log_weights: Array1<f64>,
    /// `D ln(2π) + Σ ln σ²` per Gaussian.
    g_norms: Array1<f64>,
}

impl GmmMachine {
    /// Uniform weights, zero means and unit variances.
    pub fn new(n_gaussians: usize, n_inputs: usize) -> Self {
        let mut machine = Self {
            weights: Array1::from_elem(n_gaussians, 1.0 / n_gaussians.max(1) as f64),
            means: Array2::zeros((n_gaussians, n_inputs)),
            variances: Array2::ones((n_gaussians, n_inputs)),
            variance_thresholds: Array2::zeros((n_gaussians, n_inputs)),
            log_weights: Array1::zeros(n_gaussians),
            g_norms: Array1::zeros(n_gaussians),
        };
        machine.refresh();
        machine
    }

    pub fn n_gaussians(&self) -> usize {
        self.means.nrows()
    }

    pub fn n_inputs(&self) -> usize {
        self.means.ncols()
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn means(&self) -> &Array2<f64> {
        &self.means
    }

    pub fn variances(&self) -> &Array2<f64> {
        &self.variances
    }

    pub fn variance_thresholds(&self) -> &Array2<f64> {
        &self.variance_thresholds
    }

    pub fn set_weights(&mut self, weights: Array1<f64>) -> Result<(), MachineError> {
        check_dim(self.n_gaussians(), weights.len())?;
        self.weights = weights;
        self.refresh();
        Ok(())
    }

    pub fn set_means(&mut self, means: Array2<f64>) -> Result<(), MachineError> {
        check_dim(self.n_gaussians(), means.nrows())?;
        check_dim(self.n_inputs(), means.ncols())?;
        self.means = means;
        Ok(())
    }

    /// Set variances, flooring them at the variance thresholds.
    pub fn set_variances(&mut self, variances: Array2<f64>) -> Result<(), MachineError> {
        check_dim(self.n_gaussians(), variances.nrows())?;
        check_dim(self.n_inputs(), variances.ncols())?;
        self.variances = variances;
        self.refresh();
        Ok(())
    }

    /// Use the same variance floor for every Gaussian and dimension.
    pub fn set_variance_thresholds(&mut self, threshold: f64) {
        self.variance_thresholds.fill(threshold);
        self.refresh();
    }

    fn refresh(&mut self) {
        Zip::from(&mut self.variances)
            .and(&self.variance_thresholds)
            .for_each(|v, &t| {
                if *v < t {
                    *v = t;
                }
            });
        self.log_weights = self.weights.mapv(f64::ln);
        let d = self.n_inputs() as f64;
        self.g_norms = self
            .variances
            .map_axis(Axis(1), |row| d * (2.0 * PI).ln() + row.mapv(f64::ln).sum());
    }

    /// Means stacked into one `n_gaussians * n_inputs` vector.
    pub fn mean_supervector(&self) -> Array1<f64> {
        Array1::from_iter(self.means.iter().copied())
    }

    pub fn variance_supervector(&self) -> Array1<f64> {
        Array1::from_iter(self.variances.iter().copied())
    }

    /// `ln w_k + ln N(x; μ_k, σ²_k)` for every Gaussian.
    pub fn log_likelihood_per_gaussian(&self, x: ArrayView1<'_, f64>) -> Array1<f64> {
        Array1::from_shape_fn(self.n_gaussians(), |k| {
            let mahalanobis: f64 = x
                .iter()
                .zip(self.means.row(k))
                .zip(self.variances.row(k))
                .map(|((v, m), s)| (v - m).powi(2) / s)
                .sum();
            self.log_weights[k] - 0.5 * (self.g_norms[k] + mahalanobis)
        })
    }

    pub fn log_likelihood(&self, x: ArrayView1<'_, f64>) -> Result<f64, MachineError> {
        check_dim(self.n_inputs(), x.len())?;
        Ok(log_sum_exp(&self.log_likelihood_per_gaussian(x)))
    }

    /// Accumulate zeroth, first and second order statistics of `frames`.
    pub fn acc_statistics(&self, frames: &Array2<f64>, stats: &mut GmmStats) -> Result<(), MachineError> {
        check_dim(self.n_inputs(), frames.ncols())?;
        check_dim(self.n_gaussians(), stats.n.len())?;
        check_dim(self.n_inputs(), stats.sum_px.ncols())?;
        for x in frames.rows() {
            let per_gaussian = self.log_likelihood_per_gaussian(x);
            let total = log_sum_exp(&per_gaussian);
            let posterior = per_gaussian.mapv(|l| (l - total).exp());

            stats.t += 1;
            stats.log_likelihood += total;
            stats.n += &posterior;
            for (k, &p) in posterior.iter().enumerate() {
                let mut px = stats.sum_px.row_mut(k);
                px.scaled_add(p, &x);
                let mut pxx = stats.sum_pxx.row_mut(k);
                Zip::from(&mut pxx).and(&x).for_each(|acc, &v| *acc += p * v * v);
            }
        }
        Ok(())
    }

    pub fn statistics(&self, frames: &Array2<f64>) -> Result<GmmStats, MachineError> {
        let mut stats = GmmStats::new(self.n_gaussians(), self.n_inputs());
        self.acc_statistics(frames, &mut stats)?;
        Ok(stats)
    }

    pub fn is_similar_to(&self, other: &GmmMachine, tolerance: f64) -> bool {
        let close = |a: &Array2<f64>, b: &Array2<f64>| {
            a.dim() == b.dim() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tolerance)
        };
        self.weights.len() == other.weights.len()
            && self
                .weights
                .iter()
                .zip(&other.weights)
                .all(|(x, y)| (x - y).abs() <= tolerance)
            && close(&self.means, &other.means)
            && close(&self.variances, &other.variances)
    }
}

fn log_sum_exp(values: &Array1<f64>) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

impl Artifact for GmmMachine {
    fn save(&self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.set_usize("m_n_gaussians", self.n_gaussians())?;
        archive.set_usize("m_n_inputs", self.n_inputs())?;
        archive.set_array("m_weights", &self.weights)?;
        for k in 0..self.n_gaussians() {
            let group = format!("m_gaussians{k}");
            archive.set_array(&format!("{group}/m_mean"), &self.means.row(k))?;
            archive.set_array(&format!("{group}/m_variance"), &self.variances.row(k))?;
            archive.set_array(
                &format!("{group}/m_variance_thresholds"),
                &self.variance_thresholds.row(k),
            )?;
        }
        Ok(())
    }

    fn load(archive: &Archive) -> Result<Self, ArchiveError> {
        let g = archive.get_usize("m_n_gaussians")?;
        let d = archive.get_usize("m_n_inputs")?;
        let mut machine = GmmMachine::new(g, d);
        machine.weights = expect_len(archive, "m_weights", g)?;
        for k in 0..g {
            let group = format!("m_gaussians{k}");
            let mean = expect_len(archive, &format!("{group}/m_mean"), d)?;
            let variance = expect_len(archive, &format!("{group}/m_variance"), d)?;
            let thresholds = expect_len(archive, &format!("{group}/m_variance_thresholds"), d)?;
            machine.means.row_mut(k).assign(&mean);
            machine.variances.row_mut(k).assign(&variance);
            machine.variance_thresholds.row_mut(k).assign(&thresholds);
        }
        if machine.variances.iter().any(|&v| v <= 0.0) {
            return Err(ArchiveError::InvalidValue {
                path: "m_variance".to_string(),
                reason: "variances must be positive".to_string(),
            });
        }
        machine.refresh();
        Ok(machine)
    }
}

/// Zeroth, first and second order statistics of frames against a GMM.
#[derive(Debug, Clone, PartialEq)]
pub struct GmmStats {
    /// Number of accumulated frames.
    pub t: usize,
    pub log_likelihood: f64,
    /// Occupancy per Gaussian.
    pub n: Array1<f64>,
    pub sum_px: Array2<f64>,
    pub sum_pxx: Array2<f64>,
}

impl GmmStats {
    pub fn new(n_gaussians: usize, n_inputs: usize) -> Self {
        Self {
            t: 0,
            log_likelihood: 0.0,
            n: Array1::zeros(n_gaussians),
            sum_px: Array2::zeros((n_gaussians, n_inputs)),
            sum_pxx: Array2::zeros((n_gaussians, n_inputs)),
        }
    }

    pub fn n_gaussians(&self) -> usize {
        self.n.len()
    }

    pub fn n_inputs(&self) -> usize {
        self.sum_px.ncols()
    }

    /// Merge another set of statistics into this one.
    pub fn add(&mut self, other: &GmmStats) -> Result<(), MachineError> {
        check_dim(self.n_gaussians(), other.n_gaussians())?;
        check_dim(self.n_inputs(), other.n_inputs())?;
        self.t += other.t;
        self.log_likelihood += other.log_likelihood;
        self.n += &other.n;
        self.sum_px += &other.sum_px;
        self.sum_pxx += &other.sum_pxx;
        Ok(())
    }

    /// First-order statistics as an `n_gaussians * n_inputs` supervector.
    pub fn sum_px_supervector(&self) -> Array1<f64> {
        Array1::from_iter(self.sum_px.iter().copied())
    }
}

impl Artifact for GmmStats {
    fn save(&self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.set_f64("log_liklihood", self.log_likelihood)?;
        archive.set_usize("T", self.t)?;
        archive.set_usize("n_gaussians", self.n_gaussians())?;
        archive.set_usize("n_inputs", self.n_inputs())?;
        archive.set_array("n", &self.n)?;
        archive.set_array("sumPx", &self.sum_px)?;
        archive.set_array("sumPxx", &self.sum_pxx)
    }

    fn load(archive: &Archive) -> Result<Self, ArchiveError> {
        let g = archive.get_usize("n_gaussians")?;
        let d = archive.get_usize("n_inputs")?;
        let expect_matrix = |path: &str| -> Result<Array2<f64>, ArchiveError> {
            let m = archive.get_array2(path)?;
            if m.dim() != (g, d) {
                return Err(ArchiveError::Shape {
                    path: path.to_string(),
                    expected: format!("{g}x{d}"),
                    found: m.shape().to_vec(),
                });
            }
            Ok(m)
        };
        Ok(Self {
            t: archive.get_usize("T")?,
            log_likelihood: archive.get_f64("log_liklihood")?,
            n: expect_len(archive, "n", g)?,
            sum_px: expect_matrix("sumPx")?,
            sum_pxx: expect_matrix("sumPxx")?,
        })
    }
}

/// Maximum-likelihood EM training of a GMM.
#[derive(Debug, Clone)]
pub struct MlGmmTrainer {
    pub max_iterations: usize,
    /// Relative change of the average log-likelihood that stops training.
    pub convergence_threshold: f64,
    pub update_means: bool,
    pub update_variances: bool,
    pub update_weights: bool,
}

impl MlGmmTrainer {
    pub fn train(&self, machine: &mut GmmMachine, data: &Array2<f64>) -> Result<(), MachineError> {
        if data.nrows() == 0 {
            return Err(MachineError::EmptyData);
        }
        let mut stats = machine.statistics(data)?;
        let mut average = stats.log_likelihood / stats.t as f64;

        for iteration in 0..self.max_iterations {
            self.m_step(machine, &stats)?;
            stats = machine.statistics(data)?;
            let previous = average;
            average = stats.log_likelihood / stats.t as f64;
            let change = ((average - previous) / previous).abs();
            tracing::debug!(iteration, average_log_likelihood = average, change, "GMM EM iteration");
            if change <= self.convergence_threshold {
                break;
            }
        }
        Ok(())
    }

    fn m_step(&self, machine: &mut GmmMachine, stats: &GmmStats) -> Result<(), MachineError> {
        if self.update_weights {
            let total = stats.n.sum();
            machine.set_weights(stats.n.mapv(|n| n / total))?;
        }

        let mut means = machine.means.clone();
        let mut variances = machine.variances.clone();
        for k in 0..machine.n_gaussians() {
            let n = stats.n[k];
            if n <= MIN_OCCUPANCY {
                continue;
            }
            let mean = stats.sum_px.row(k).to_owned() / n;
            if self.update_variances {
                let variance = stats.sum_pxx.row(k).to_owned() / n - mean.mapv(|m| m * m);
                variances.row_mut(k).assign(&variance);
            }
            if self.update_means {
                means.row_mut(k).assign(&mean);
            }
        }
        machine.set_means(means)?;
        machine.set_variances(variances)
    }
}

/// Maximum a-posteriori adaptation of a prior GMM to enrollment data.
#[derive(Debug, Clone)]
pub struct MapGmmTrainer {
    pub relevance_factor: f64,
    pub max_iterations: usize,
    pub update_means: bool,
    pub update_variances: bool,
    pub update_weights: bool,
}

impl MapGmmTrainer {
    /// Adapt a copy of `prior` to `data`. Each iteration computes the
    /// statistics against the current estimate.
    pub fn adapt(&self, prior: &GmmMachine, data: &Array2<f64>) -> Result<GmmMachine, MachineError> {
        if data.nrows() == 0 {
            return Err(MachineError::EmptyData);
        }
        if self.relevance_factor <= 0.0 {
            return Err(MachineError::InvalidParameter(format!(
                "relevance factor must be positive, got {}",
                self.relevance_factor
            )));
        }

        let mut machine = prior.clone();
        for _ in 0..self.max_iterations {
            let stats = machine.statistics(data)?;
            self.m_step(prior, &mut machine, &stats)?;
        }
        Ok(machine)
    }

    fn m_step(
        &self,
        prior: &GmmMachine,
        machine: &mut GmmMachine,
        stats: &GmmStats,
    ) -> Result<(), MachineError> {
        let alpha = stats.n.mapv(|n| n / (n + self.relevance_factor));

        if self.update_weights {
            let t = stats.t as f64;
            let raw = Array1::from_shape_fn(prior.n_gaussians(), |k| {
                alpha[k] * stats.n[k] / t + (1.0 - alpha[k]) * prior.weights[k]
            });
            let total = raw.sum();
            machine.set_weights(raw / total)?;
        }

        let mut means = machine.means.clone();
        let mut variances = machine.variances.clone();
        for k in 0..prior.n_gaussians() {
            let n = stats.n[k];
            let a = alpha[k];
            let prior_mean = prior.means.row(k);
            let expected_x = if n > MIN_OCCUPANCY {
                stats.sum_px.row(k).to_owned() / n
            } else {
                prior_mean.to_owned()
            };
            let mean = &expected_x * a + &prior_mean * (1.0 - a);
            if self.update_variances {
                let expected_xx = if n > MIN_OCCUPANCY {
                    stats.sum_pxx.row(k).to_owned() / n
                } else {
                    &prior.variances.row(k) + &prior_mean.mapv(|m| m * m)
                };
                let prior_second = &prior.variances.row(k) + &prior_mean.mapv(|m| m * m);
                let variance = expected_xx * a + prior_second * (1.0 - a) - mean.mapv(|m| m * m);
                variances.row_mut(k).assign(&variance);
            }
            if self.update_means {
                means.row_mut(k).assign(&mean);
            }
        }
        machine.set_means(means)?;
        machine.set_variances(variances)
    }
}

/// Linear approximation of the log-likelihood ratio between a client model
/// and the UBM, evaluated on probe statistics.
///
/// `channel_offset` is a supervector subtracted from the probe around the UBM
/// means (session compensation); with `frame_length_normalisation` the score
/// is divided by the number of probe frames.
pub fn linear_scoring(
    model_means: &Array2<f64>,
    ubm: &GmmMachine,
    stats: &GmmStats,
    channel_offset: Option<&Array1<f64>>,
    frame_length_normalisation: bool,
) -> Result<f64, MachineError> {
    let (g, d) = (ubm.n_gaussians(), ubm.n_inputs());
    check_dim(g, model_means.nrows())?;
    check_dim(d, model_means.ncols())?;
    check_dim(g, stats.n_gaussians())?;
    check_dim(d, stats.n_inputs())?;
    if let Some(offset) = channel_offset {
        check_dim(g * d, offset.len())?;
    }

    let mut score = 0.0;
    for k in 0..g {
        for i in 0..d {
            let mu = ubm.means[[k, i]];
            let centre = mu + channel_offset.map_or(0.0, |o| o[k * d + i]);
            let centered = stats.sum_px[[k, i]] - stats.n[k] * centre;
            score += (model_means[[k, i]] - mu) / ubm.variances[[k, i]] * centered;
        }
    }

    if frame_length_normalisation {
        if stats.t == 0 {
            return Err(MachineError::EmptyData);
        }
        score /= stats.t as f64;
    }
    Ok(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_component() -> GmmMachine {
        let mut m = GmmMachine::new(2, 2);
        m.set_means(array![[0.0, 0.0], [5.0, 5.0]]).unwrap();
        m.set_variances(array![[1.0, 1.0], [1.0, 1.0]]).unwrap();
        m
    }

    #[test]
    fn test_log_likelihood_single_gaussian() {
        let m = GmmMachine::new(1, 2);
        let ll = m.log_likelihood(array![0.0, 0.0].view()).unwrap();
        assert!((ll - (-(2.0 * PI).ln())).abs() < 1e-12);
    }

    #[test]
    fn test_statistics_posteriors_sum_to_frames() {
        let m = two_component();
        let frames = array![[0.1, -0.2], [4.9, 5.2], [2.5, 2.5]];
        let stats = m.statistics(&frames).unwrap();
        assert_eq!(stats.t, 3);
        assert!((stats.n.sum() - 3.0).abs() < 1e-12);
        assert!((stats.n[0] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_variance_floor() {
        let mut m = two_component();
        m.set_variance_thresholds(0.5);
        m.set_variances(array![[0.1, 2.0], [1.0, 0.3]]).unwrap();
        assert_eq!(m.variances(), &array![[0.5, 2.0], [1.0, 0.5]]);
    }

    #[test]
    fn test_ml_training_increases_likelihood() {
        let data = array![
            [0.0, 0.1],
            [0.3, -0.2],
            [-0.2, 0.2],
            [6.0, 5.8],
            [5.7, 6.2],
            [6.1, 6.0],
        ];
        let mut m = two_component();
        let before = m.statistics(&data).unwrap().log_likelihood;
        let trainer = MlGmmTrainer {
            max_iterations: 10,
            convergence_threshold: 1e-8,
            update_means: true,
            update_variances: true,
            update_weights: true,
        };
        m.set_variance_thresholds(1e-3);
        trainer.train(&mut m, &data).unwrap();
        let after = m.statistics(&data).unwrap().log_likelihood;
        assert!(after > before);
        assert!((m.weights().sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_map_moves_means_toward_data() {
        let prior = two_component();
        let data = array![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [1.0, 1.0]];
        let trainer = MapGmmTrainer {
            relevance_factor: 4.0,
            max_iterations: 1,
            update_means: true,
            update_variances: false,
            update_weights: false,
        };
        let adapted = trainer.adapt(&prior, &data).unwrap();
        // almost all occupancy on the first Gaussian: alpha ≈ 4 / 8
        assert!((adapted.means()[[0, 0]] - 0.5).abs() < 1e-3);
        assert!((adapted.means()[[1, 0]] - 5.0).abs() < 1e-3);
        assert_eq!(adapted.variances(), prior.variances());
    }

    #[test]
    fn test_linear_scoring_zero_for_ubm_model() {
        let ubm = two_component();
        let stats = ubm.statistics(&array![[0.5, 0.5], [4.0, 4.5]]).unwrap();
        let score = linear_scoring(ubm.means(), &ubm, &stats, None, true).unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_archive_layout() {
        let m = two_component();
        let mut archive = Archive::new();
        m.save(&mut archive).unwrap();
        assert!(archive.contains("m_gaussians1/m_variance_thresholds"));
        assert_eq!(GmmMachine::load(&archive).unwrap(), m);

        let stats = m.statistics(&array![[0.5, 0.5]]).unwrap();
        let mut archive = Archive::new();
        stats.save(&mut archive).unwrap();
        assert!(archive.contains("log_liklihood"));
        assert_eq!(GmmStats::load(&archive).unwrap(), stats);
    }
}
