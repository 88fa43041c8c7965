//! Probabilistic linear discriminant analysis.
//!
//! Generative model for sample `j` of class `i`:
//!
//! ```text
//! x_ij = mu + F h_i + G w_ij + e_ij,   h_i, w_ij ~ N(0, I),   e_ij ~ N(0, diag(sigma))
//! ```
//!
//! With `W = G Gᵀ + diag(sigma)` and `B = F Fᵀ`, the joint log-likelihood of
//! `n` samples of one class only depends on the centred samples through
//! `Σ xᵀ W⁻¹ x` and the sum `S = Σ x`, which is what an enrolled model keeps.

use super::linear::expect_len;
use super::{check_dim, MachineError};
use crate::archive::{Archive, ArchiveError, Artifact};
use crate::linalg;
use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use std::f64::consts::PI;

#[derive(Debug, Clone, PartialEq)]
pub struct PldaBase {
    pub mu: Array1<f64>,
    /// Between-class subspace, `dim_d × dim_f`.
    pub f: Array2<f64>,
    /// Within-class subspace, `dim_d × dim_g`.
    pub g: Array2<f64>,
    pub sigma: Array1<f64>,
    pub variance_threshold: f64,
}

/// Enrolled class: number of samples and the sum of the centred samples.
#[derive(Debug, Clone, PartialEq)]
pub struct PldaModel {
    pub n_samples: usize,
    pub weighted_sum: Array1<f64>,
}

impl PldaBase {
    pub fn dim_d(&self) -> usize {
        self.mu.len()
    }

    pub fn dim_f(&self) -> usize {
        self.f.ncols()
    }

    pub fn dim_g(&self) -> usize {
        self.g.ncols()
    }

    fn within(&self) -> Array2<f64> {
        self.g.dot(&self.g.t()) + &Array2::from_diag(&self.sigma)
    }

    fn between(&self) -> Array2<f64> {
        self.f.dot(&self.f.t())
    }

    /// `ln det(W + nB)` and `K_n = -(W + nB)⁻¹ B W⁻¹`.
    fn group_terms(
        &self,
        n: usize,
        within: &Array2<f64>,
        within_inv: &Array2<f64>,
        between: &Array2<f64>,
    ) -> Result<(f64, Array2<f64>), MachineError> {
        let combined = within + &(between * n as f64);
        let log_det = linalg::log_det_spd(&combined)?;
        let k = -linalg::spd_inverse(&combined)?.dot(between).dot(within_inv);
        Ok((log_det, k))
    }

    /// Joint log-likelihood of the rows of `samples` under the hypothesis
    /// that they share one class.
    pub fn log_likelihood(&self, samples: &Array2<f64>) -> Result<f64, MachineError> {
        check_dim(self.dim_d(), samples.ncols())?;
        let n = samples.nrows();
        if n == 0 {
            return Err(MachineError::EmptyData);
        }
        let d = self.dim_d() as f64;
        let within = self.within();
        let within_inv = linalg::spd_inverse(&within)?;
        let between = self.between();
        let (log_det_n, k_n) = self.group_terms(n, &within, &within_inv, &between)?;

        let centered = samples - &self.mu.view().insert_axis(Axis(0));
        let quadratic: f64 = centered
            .rows()
            .into_iter()
            .map(|x| x.dot(&within_inv.dot(&x)))
            .sum();
        let sum = centered.sum_axis(Axis(0));

        Ok(-0.5
            * (n as f64 * d * (2.0 * PI).ln()
                + (n - 1) as f64 * linalg::log_det_spd(&within)?
                + log_det_n
                + quadratic
                + sum.dot(&k_n.dot(&sum))))
    }

    pub fn enroll(&self, samples: &Array2<f64>) -> Result<PldaModel, MachineError> {
        check_dim(self.dim_d(), samples.ncols())?;
        if samples.nrows() == 0 {
            return Err(MachineError::EmptyData);
        }
        let centered = samples - &self.mu.view().insert_axis(Axis(0));
        Ok(PldaModel {
            n_samples: samples.nrows(),
            weighted_sum: centered.sum_axis(Axis(0)),
        })
    }

    /// `ln p(model ∪ probe) - ln p(model) - ln p(probe)`.
    pub fn score(&self, model: &PldaModel, probe: ArrayView1<'_, f64>) -> Result<f64, MachineError> {
        check_dim(self.dim_d(), probe.len())?;
        check_dim(self.dim_d(), model.weighted_sum.len())?;
        if model.n_samples == 0 {
            return Err(MachineError::EmptyData);
        }
        let n = model.n_samples;
        let within = self.within();
        let within_inv = linalg::spd_inverse(&within)?;
        let between = self.between();
        let (log_det_joint, k_joint) = self.group_terms(n + 1, &within, &within_inv, &between)?;
        let (log_det_model, k_model) = self.group_terms(n, &within, &within_inv, &between)?;
        let (log_det_probe, k_probe) = self.group_terms(1, &within, &within_inv, &between)?;

        let p = &probe - &self.mu;
        let s = &model.weighted_sum;
        let joint = s + &p;

        Ok(-0.5 * linalg::log_det_spd(&within)? - 0.5 * log_det_joint
            + 0.5 * log_det_model
            + 0.5 * log_det_probe
            - 0.5 * joint.dot(&k_joint.dot(&joint))
            + 0.5 * s.dot(&k_model.dot(s))
            + 0.5 * p.dot(&k_probe.dot(&p)))
    }
}

impl Artifact for PldaBase {
    fn save(&self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.set_usize("dim_d", self.dim_d())?;
        archive.set_usize("dim_f", self.dim_f())?;
        archive.set_usize("dim_g", self.dim_g())?;
        archive.set_array("mu", &self.mu)?;
        archive.set_array("F", &self.f)?;
        archive.set_array("G", &self.g)?;
        archive.set_array("sigma", &self.sigma)?;
        archive.set_f64("variance_threshold", self.variance_threshold)
    }

    fn load(archive: &Archive) -> Result<Self, ArchiveError> {
        let d = archive.get_usize("dim_d")?;
        let dim_f = archive.get_usize("dim_f")?;
        let dim_g = archive.get_usize("dim_g")?;
        let expect_matrix = |path: &str, cols: usize| -> Result<Array2<f64>, ArchiveError> {
            let m = archive.get_array2(path)?;
            if m.dim() != (d, cols) {
                return Err(ArchiveError::Shape {
                    path: path.to_string(),
                    expected: format!("{d}x{cols}"),
                    found: m.shape().to_vec(),
                });
            }
            Ok(m)
        };
        Ok(Self {
            mu: expect_len(archive, "mu", d)?,
            f: expect_matrix("F", dim_f)?,
            g: expect_matrix("G", dim_g)?,
            sigma: expect_len(archive, "sigma", d)?,
            variance_threshold: archive.get_f64("variance_threshold")?,
        })
    }
}

impl Artifact for PldaModel {
    fn save(&self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.set_usize("n_samples", self.n_samples)?;
        archive.set_array("weighted_sum", &self.weighted_sum)
    }

    fn load(archive: &Archive) -> Result<Self, ArchiveError> {
        Ok(Self {
            n_samples: archive.get_usize("n_samples")?,
            weighted_sum: archive.get_array1("weighted_sum")?,
        })
    }
}

/// EM training of a [`PldaBase`] from per-class sample matrices.
///
/// `F` and `G` start from the leading eigenvectors of the between- and
/// within-class scatter (scaled by the square root of their eigenvalues),
/// `sigma` from the per-dimension data variance.
#[derive(Debug, Clone)]
pub struct PldaTrainer {
    pub iterations: usize,
    pub variance_threshold: f64,
}

impl PldaTrainer {
    pub fn train(&self, classes: &[Array2<f64>], dim_f: usize, dim_g: usize) -> Result<PldaBase, MachineError> {
        if classes.is_empty() {
            return Err(MachineError::EmptyData);
        }
        let d = classes[0].ncols();
        if dim_f == 0 || dim_f > d || dim_g == 0 || dim_g > d {
            return Err(MachineError::InvalidParameter(format!(
                "subspace dimensions F={dim_f}, G={dim_g} do not fit {d} inputs"
            )));
        }
        for (i, class) in classes.iter().enumerate() {
            check_dim(d, class.ncols())?;
            if class.nrows() == 0 {
                return Err(MachineError::EmptyGroup(i));
            }
        }

        let mut base = self.initialize(classes, dim_f, dim_g)?;
        for iteration in 0..self.iterations {
            self.em_step(&mut base, classes)?;
            tracing::debug!(iteration, "PLDA EM iteration");
        }

        tracing::info!(
            classes = classes.len(),
            inputs = d,
            dim_f,
            dim_g,
            iterations = self.iterations,
            "PLDA trained"
        );
        Ok(base)
    }

    fn initialize(&self, classes: &[Array2<f64>], dim_f: usize, dim_g: usize) -> Result<PldaBase, MachineError> {
        let d = classes[0].ncols();
        let total: usize = classes.iter().map(|c| c.nrows()).sum();
        let mut mu = Array1::<f64>::zeros(d);
        for class in classes {
            mu += &class.sum_axis(Axis(0));
        }
        mu /= total as f64;

        let mut within = Array2::<f64>::zeros((d, d));
        let mut between = Array2::<f64>::zeros((d, d));
        let mut variance = Array1::<f64>::zeros(d);
        for class in classes {
            let mean = class.sum_axis(Axis(0)) / class.nrows() as f64;
            let centered = class - &mean.view().insert_axis(Axis(0));
            within += &centered.t().dot(&centered);
            let offset = &mean - &mu;
            between += &linalg::outer(&offset, &offset);
            let total_centered = class - &mu.view().insert_axis(Axis(0));
            variance += &total_centered.mapv(|v| v * v).sum_axis(Axis(0));
        }
        within /= total as f64;
        between /= classes.len() as f64;
        variance /= total as f64;

        let scaled_leading = |scatter: &Array2<f64>, k: usize| -> Result<Array2<f64>, MachineError> {
            let (values, vectors) = linalg::symmetric_eigen(scatter)?;
            let mut out = vectors.slice(s![.., ..k]).to_owned();
            for (mut column, value) in out.columns_mut().into_iter().zip(values.iter()) {
                column *= value.max(0.0).sqrt();
            }
            Ok(out)
        };

        let threshold = self.variance_threshold;
        Ok(PldaBase {
            f: scaled_leading(&between, dim_f)?,
            g: scaled_leading(&within, dim_g)?,
            sigma: variance.mapv(|v| v.max(threshold)),
            mu,
            variance_threshold: threshold,
        })
    }

    fn em_step(&self, base: &mut PldaBase, classes: &[Array2<f64>]) -> Result<(), MachineError> {
        let (d, nf, ng) = (base.dim_d(), base.dim_f(), base.dim_g());
        let rank = nf + ng;
        let precision = base.sigma.mapv(|v| 1.0 / v);
        let lambda_f = &base.f * &precision.view().insert_axis(Axis(1));
        let lambda_g = &base.g * &precision.view().insert_axis(Axis(1));
        let ftf = base.f.t().dot(&lambda_f);
        let ftg = base.f.t().dot(&lambda_g);
        let gtg = base.g.t().dot(&lambda_g);
        let a_inv = linalg::spd_inverse(&(Array2::<f64>::eye(ng) + &gtg))?;
        let p_a_inv = ftg.dot(&a_inv);

        let mut xy = Array2::<f64>::zeros((d, rank));
        let mut yy = Array2::<f64>::zeros((rank, rank));
        let mut samples = Vec::new();

        for class in classes {
            let n = class.nrows() as f64;
            let centered = class - &base.mu.view().insert_axis(Axis(0));
            let sum = centered.sum_axis(Axis(0));

            let q = Array2::<f64>::eye(nf) + &(&ftf * n) - &(p_a_inv.dot(&ftg.t()) * n);
            let q_inv = linalg::spd_inverse(&q)?;
            let h = q_inv.dot(&(lambda_f.t().dot(&sum) - p_a_inv.dot(&lambda_g.t().dot(&sum))));
            let cov_hw = -q_inv.dot(&p_a_inv);
            let cov_ww = &a_inv + &p_a_inv.t().dot(&q_inv).dot(&p_a_inv);

            for x in centered.rows() {
                let w = a_inv.dot(&(lambda_g.t().dot(&x) - ftg.t().dot(&h)));
                let mut y = Array1::<f64>::zeros(rank);
                y.slice_mut(s![..nf]).assign(&h);
                y.slice_mut(s![nf..]).assign(&w);

                let mut second = linalg::outer(&y, &y);
                {
                    let mut block = second.slice_mut(s![..nf, ..nf]);
                    block += &q_inv;
                }
                {
                    let mut block = second.slice_mut(s![..nf, nf..]);
                    block += &cov_hw;
                }
                {
                    let mut block = second.slice_mut(s![nf.., ..nf]);
                    block += &cov_hw.t();
                }
                {
                    let mut block = second.slice_mut(s![nf.., nf..]);
                    block += &cov_ww;
                }

                xy += &linalg::outer(&x.to_owned(), &y);
                yy += &second;
                samples.push((x.to_owned(), y));
            }
        }

        let loading = xy.dot(&linalg::spd_inverse(&yy)?);
        let mut sigma = Array1::<f64>::zeros(d);
        for (x, y) in &samples {
            let reconstruction = loading.dot(y);
            sigma += &(x * &(x - &reconstruction));
        }
        sigma /= samples.len() as f64;

        base.f = loading.slice(s![.., ..nf]).to_owned();
        base.g = loading.slice(s![.., nf..]).to_owned();
        let threshold = base.variance_threshold;
        base.sigma = sigma.mapv(|v| v.max(threshold));
        Ok(())
    }
}
