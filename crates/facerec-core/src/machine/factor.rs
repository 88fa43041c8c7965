//! Inter-session variability (ISV) and joint factor analysis (JFA) in
//! GMM mean-supervector space.
//!
//! With `m` the UBM mean supervector and `Σ` its variance supervector, a
//! session `j` of identity `i` is modelled as
//!
//! ```text
//! ISV:  m + U x_ij + D z_i
//! JFA:  m + V y_i + U x_ij + D z_i
//! ```
//!
//! where `D` is diagonal (stored as the vector `d`). All latent estimates are
//! posterior means given the Baum-Welch statistics of the sessions.

use super::gmm::{linear_scoring, GmmMachine, GmmStats};
use super::linear::expect_len;
use super::{check_dim, MachineError};
use crate::archive::{Archive, ArchiveError, Artifact};
use crate::linalg;
use ndarray::{s, Array1, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// UBM parameters flattened to supervectors.
struct Supervectors {
    mean: Array1<f64>,
    variance: Array1<f64>,
    n_gaussians: usize,
    n_inputs: usize,
}

impl Supervectors {
    fn new(ubm: &GmmMachine) -> Self {
        Self {
            mean: ubm.mean_supervector(),
            variance: ubm.variance_supervector(),
            n_gaussians: ubm.n_gaussians(),
            n_inputs: ubm.n_inputs(),
        }
    }

    fn len(&self) -> usize {
        self.mean.len()
    }

    fn check(&self, stats: &GmmStats) -> Result<(), MachineError> {
        check_dim(self.n_gaussians, stats.n_gaussians())?;
        check_dim(self.n_inputs, stats.n_inputs())
    }

    /// Per-Gaussian occupancy repeated over each Gaussian's dimensions.
    fn occupancy(&self, stats: &GmmStats) -> Array1<f64> {
        Array1::from_shape_fn(self.len(), |i| stats.n[i / self.n_inputs])
    }

    /// Session statistics: occupancy supervector and first-order statistics
    /// centred on the UBM means.
    fn session(&self, stats: &GmmStats) -> Result<Session, MachineError> {
        self.check(stats)?;
        let occupancy = self.occupancy(stats);
        let centered = stats.sum_px_supervector() - &occupancy * &self.mean;
        Ok(Session {
            n: stats.n.clone(),
            occupancy,
            centered,
        })
    }

    fn as_means(&self, supervector: Array1<f64>) -> Result<Array2<f64>, MachineError> {
        supervector
            .into_shape_with_order((self.n_gaussians, self.n_inputs))
            .map_err(|_| MachineError::DimensionMismatch {
                expected: self.n_gaussians * self.n_inputs,
                got: 0,
            })
    }
}

#[derive(Clone)]
struct Session {
    n: Array1<f64>,
    occupancy: Array1<f64>,
    centered: Array1<f64>,
}

/// Posterior mean and covariance of `w` in `residual ≈ N L w`, `w ~ N(0, I)`.
fn latent_posterior(
    loading: &Array2<f64>,
    variance: &Array1<f64>,
    occupancy: &Array1<f64>,
    residual: &Array1<f64>,
) -> Result<(Array1<f64>, Array2<f64>), MachineError> {
    let rank = loading.ncols();
    let scale = occupancy / variance;
    let weighted = loading * &scale.view().insert_axis(Axis(1));
    let precision = Array2::<f64>::eye(rank) + loading.t().dot(&weighted);
    let covariance = linalg::spd_inverse(&precision)?;
    let mean = covariance.dot(&loading.t().dot(&(residual / variance)));
    Ok((mean, covariance))
}

/// Elementwise posterior of `z` in `residual ≈ N d z`, `z ~ N(0, I)`.
fn diagonal_posterior(
    d: &Array1<f64>,
    variance: &Array1<f64>,
    occupancy: &Array1<f64>,
    residual: &Array1<f64>,
) -> (Array1<f64>, Array1<f64>) {
    let posterior_variance =
        Array1::from_shape_fn(d.len(), |i| 1.0 / (1.0 + d[i] * d[i] * occupancy[i] / variance[i]));
    let mean = Array1::from_shape_fn(d.len(), |i| {
        posterior_variance[i] * d[i] * residual[i] / variance[i]
    });
    (mean, posterior_variance)
}

/// Sufficient statistics for re-estimating a loading matrix one Gaussian
/// block at a time.
struct LoadingAccumulator {
    n_inputs: usize,
    a: Vec<Array2<f64>>,
    b: Vec<Array2<f64>>,
}

impl LoadingAccumulator {
    fn new(n_gaussians: usize, n_inputs: usize, rank: usize) -> Self {
        Self {
            n_inputs,
            a: vec![Array2::zeros((rank, rank)); n_gaussians],
            b: vec![Array2::zeros((n_inputs, rank)); n_gaussians],
        }
    }

    fn add(&mut self, n: &Array1<f64>, residual: &Array1<f64>, mean: &Array1<f64>, covariance: &Array2<f64>) {
        let second_moment = covariance + &linalg::outer(mean, mean);
        for (c, &occupancy) in n.iter().enumerate() {
            self.a[c].scaled_add(occupancy, &second_moment);
            let block = residual
                .slice(s![c * self.n_inputs..(c + 1) * self.n_inputs])
                .to_owned();
            self.b[c] += &linalg::outer(&block, mean);
        }
    }

    fn solve(&self, previous: &Array2<f64>) -> Result<Array2<f64>, MachineError> {
        let mut loading = previous.clone();
        for (c, (a, b)) in self.a.iter().zip(&self.b).enumerate() {
            if a.diag().sum() <= 0.0 {
                continue;
            }
            let block = b.dot(&linalg::spd_inverse(a)?);
            loading
                .slice_mut(s![c * self.n_inputs..(c + 1) * self.n_inputs, ..])
                .assign(&block);
        }
        Ok(loading)
    }
}

fn random_loading(rng: &mut ChaCha8Rng, variance: &Array1<f64>, rank: usize) -> Array2<f64> {
    Array2::from_shape_fn((variance.len(), rank), |(i, _)| {
        rng.gen_range(-1.0..1.0) * variance[i].sqrt()
    })
}

fn check_groups(ubm: &GmmMachine, data: &[Vec<GmmStats>]) -> Result<(), MachineError> {
    if data.is_empty() {
        return Err(MachineError::EmptyData);
    }
    for (i, group) in data.iter().enumerate() {
        if group.is_empty() {
            return Err(MachineError::EmptyGroup(i));
        }
        for stats in group {
            check_dim(ubm.n_gaussians(), stats.n_gaussians())?;
            check_dim(ubm.n_inputs(), stats.n_inputs())?;
        }
    }
    Ok(())
}

fn check_rank(name: &str, rank: usize) -> Result<(), MachineError> {
    if rank == 0 {
        return Err(MachineError::InvalidParameter(format!(
            "subspace dimension of {name} must be positive"
        )));
    }
    Ok(())
}

fn sum_sessions(sessions: &[Session], len: usize, residual: impl Fn(usize, &Session) -> Array1<f64>) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    let n_gaussians = sessions.first().map_or(0, |s| s.n.len());
    let mut n = Array1::zeros(n_gaussians);
    let mut occupancy = Array1::zeros(len);
    let mut total = Array1::zeros(len);
    for (j, session) in sessions.iter().enumerate() {
        n += &session.n;
        occupancy += &session.occupancy;
        total += &residual(j, session);
    }
    (n, occupancy, total)
}

/// ISV enroller parameters: session subspace `U` and diagonal `d`.
#[derive(Debug, Clone, PartialEq)]
pub struct IsvBase {
    /// Supervector × rank session subspace.
    pub u: Array2<f64>,
    pub d: Array1<f64>,
}

/// Enrolled ISV identity: the speaker/face offset `z`.
#[derive(Debug, Clone, PartialEq)]
pub struct IsvModel {
    pub z: Array1<f64>,
}

impl IsvBase {
    pub fn check_ubm(&self, ubm: &GmmMachine) -> Result<(), MachineError> {
        check_dim(ubm.n_gaussians() * ubm.n_inputs(), self.d.len())?;
        check_dim(self.d.len(), self.u.nrows())
    }

    /// Estimate `z` for one identity from its sessions.
    pub fn enroll(
        &self,
        ubm: &GmmMachine,
        data: &[GmmStats],
        iterations: usize,
    ) -> Result<IsvModel, MachineError> {
        self.check_ubm(ubm)?;
        if data.is_empty() {
            return Err(MachineError::EmptyData);
        }
        let sv = Supervectors::new(ubm);
        let sessions = data.iter().map(|s| sv.session(s)).collect::<Result<Vec<_>, _>>()?;

        let mut x = vec![Array1::<f64>::zeros(self.u.ncols()); sessions.len()];
        let mut z = Array1::<f64>::zeros(sv.len());
        for _ in 0..iterations.max(1) {
            for (session, x) in sessions.iter().zip(x.iter_mut()) {
                let residual = &session.centered - &(&session.occupancy * &self.d * &z);
                *x = latent_posterior(&self.u, &sv.variance, &session.occupancy, &residual)?.0;
            }
            let (_, occupancy, residual) = sum_sessions(&sessions, sv.len(), |j, s| {
                &s.centered - &(&s.occupancy * &self.u.dot(&x[j]))
            });
            z = diagonal_posterior(&self.d, &sv.variance, &occupancy, &residual).0;
        }
        Ok(IsvModel { z })
    }

    /// Channel-compensated linear score of probe statistics against a model.
    pub fn score(&self, ubm: &GmmMachine, model: &IsvModel, probe: &GmmStats) -> Result<f64, MachineError> {
        self.check_ubm(ubm)?;
        check_dim(self.d.len(), model.z.len())?;
        let sv = Supervectors::new(ubm);
        let session = sv.session(probe)?;
        let x = latent_posterior(&self.u, &sv.variance, &session.occupancy, &session.centered)?.0;
        let channel = self.u.dot(&x);
        let model_means = sv.as_means(&sv.mean + &(&self.d * &model.z))?;
        linear_scoring(&model_means, ubm, probe, Some(&channel), true)
    }
}

impl Artifact for IsvBase {
    fn save(&self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.set_array("U", &self.u)?;
        archive.set_array("d", &self.d)
    }

    fn load(archive: &Archive) -> Result<Self, ArchiveError> {
        let u = archive.get_array2("U")?;
        let d = expect_len(archive, "d", u.nrows())?;
        Ok(Self { u, d })
    }
}

impl Artifact for IsvModel {
    fn save(&self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.set_array("z", &self.z)
    }

    fn load(archive: &Archive) -> Result<Self, ArchiveError> {
        Ok(Self {
            z: archive.get_array1("z")?,
        })
    }
}

/// EM estimation of the ISV session subspace. `d` stays fixed at
/// `sqrt(Σ / relevance_factor)`.
#[derive(Debug, Clone)]
pub struct IsvTrainer {
    pub iterations: usize,
    pub relevance_factor: f64,
    pub seed: u64,
}

impl IsvTrainer {
    pub fn train(
        &self,
        ubm: &GmmMachine,
        rank_u: usize,
        data: &[Vec<GmmStats>],
    ) -> Result<IsvBase, MachineError> {
        check_rank("U", rank_u)?;
        check_groups(ubm, data)?;
        if self.relevance_factor <= 0.0 {
            return Err(MachineError::InvalidParameter(
                "relevance factor must be positive".to_string(),
            ));
        }
        let sv = Supervectors::new(ubm);
        let groups = data
            .iter()
            .map(|g| g.iter().map(|s| sv.session(s)).collect::<Result<Vec<_>, _>>())
            .collect::<Result<Vec<_>, _>>()?;

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut base = IsvBase {
            u: random_loading(&mut rng, &sv.variance, rank_u),
            d: sv.variance.mapv(|v| (v / self.relevance_factor).sqrt()),
        };
        let mut z: Vec<Array1<f64>> = vec![Array1::zeros(sv.len()); groups.len()];

        for iteration in 0..self.iterations {
            let mut acc = LoadingAccumulator::new(sv.n_gaussians, sv.n_inputs, rank_u);
            for (sessions, z) in groups.iter().zip(z.iter_mut()) {
                let mut x = Vec::with_capacity(sessions.len());
                for session in sessions {
                    let residual = &session.centered - &(&session.occupancy * &base.d * &*z);
                    let (mean, covariance) =
                        latent_posterior(&base.u, &sv.variance, &session.occupancy, &residual)?;
                    acc.add(&session.n, &residual, &mean, &covariance);
                    x.push(mean);
                }
                let (_, occupancy, residual) = sum_sessions(sessions, sv.len(), |j, s| {
                    &s.centered - &(&s.occupancy * &base.u.dot(&x[j]))
                });
                *z = diagonal_posterior(&base.d, &sv.variance, &occupancy, &residual).0;
            }
            base.u = acc.solve(&base.u)?;
            tracing::debug!(iteration, identities = groups.len(), "ISV iteration");
        }

        tracing::info!(
            gaussians = sv.n_gaussians,
            rank_u,
            identities = groups.len(),
            iterations = self.iterations,
            "ISV subspace trained"
        );
        Ok(base)
    }
}

/// JFA enroller parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct JfaBase {
    pub u: Array2<f64>,
    pub v: Array2<f64>,
    pub d: Array1<f64>,
}

/// Enrolled JFA identity.
#[derive(Debug, Clone, PartialEq)]
pub struct JfaModel {
    pub y: Array1<f64>,
    pub z: Array1<f64>,
}

impl JfaBase {
    pub fn check_ubm(&self, ubm: &GmmMachine) -> Result<(), MachineError> {
        check_dim(ubm.n_gaussians() * ubm.n_inputs(), self.d.len())?;
        check_dim(self.d.len(), self.u.nrows())?;
        check_dim(self.d.len(), self.v.nrows())
    }

    fn speaker_offset(&self, y: &Array1<f64>, z: &Array1<f64>) -> Array1<f64> {
        self.v.dot(y) + &(&self.d * z)
    }

    /// Estimate `y` and `z` for one identity from its sessions.
    pub fn enroll(
        &self,
        ubm: &GmmMachine,
        data: &[GmmStats],
        iterations: usize,
    ) -> Result<JfaModel, MachineError> {
        self.check_ubm(ubm)?;
        if data.is_empty() {
            return Err(MachineError::EmptyData);
        }
        let sv = Supervectors::new(ubm);
        let sessions = data.iter().map(|s| sv.session(s)).collect::<Result<Vec<_>, _>>()?;

        let mut y = Array1::<f64>::zeros(self.v.ncols());
        let mut z = Array1::<f64>::zeros(sv.len());
        let mut x = vec![Array1::<f64>::zeros(self.u.ncols()); sessions.len()];
        for _ in 0..iterations.max(1) {
            let (_, occupancy, residual) = sum_sessions(&sessions, sv.len(), |j, s| {
                &s.centered - &(&s.occupancy * &(self.u.dot(&x[j]) + &(&self.d * &z)))
            });
            y = latent_posterior(&self.v, &sv.variance, &occupancy, &residual)?.0;

            let offset = self.speaker_offset(&y, &z);
            for (session, x) in sessions.iter().zip(x.iter_mut()) {
                let residual = &session.centered - &(&session.occupancy * &offset);
                *x = latent_posterior(&self.u, &sv.variance, &session.occupancy, &residual)?.0;
            }

            let vy = self.v.dot(&y);
            let (_, occupancy, residual) = sum_sessions(&sessions, sv.len(), |j, s| {
                &s.centered - &(&s.occupancy * &(&vy + &self.u.dot(&x[j])))
            });
            z = diagonal_posterior(&self.d, &sv.variance, &occupancy, &residual).0;
        }
        Ok(JfaModel { y, z })
    }

    pub fn score(&self, ubm: &GmmMachine, model: &JfaModel, probe: &GmmStats) -> Result<f64, MachineError> {
        self.check_ubm(ubm)?;
        check_dim(self.v.ncols(), model.y.len())?;
        check_dim(self.d.len(), model.z.len())?;
        let sv = Supervectors::new(ubm);
        let session = sv.session(probe)?;
        let x = latent_posterior(&self.u, &sv.variance, &session.occupancy, &session.centered)?.0;
        let channel = self.u.dot(&x);
        let model_means = sv.as_means(&sv.mean + &self.speaker_offset(&model.y, &model.z))?;
        linear_scoring(&model_means, ubm, probe, Some(&channel), true)
    }
}

impl Artifact for JfaBase {
    fn save(&self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.set_array("U", &self.u)?;
        archive.set_array("V", &self.v)?;
        archive.set_array("d", &self.d)
    }

    fn load(archive: &Archive) -> Result<Self, ArchiveError> {
        let u = archive.get_array2("U")?;
        let v = archive.get_array2("V")?;
        if v.nrows() != u.nrows() {
            return Err(ArchiveError::Shape {
                path: "V".to_string(),
                expected: format!("{} rows", u.nrows()),
                found: v.shape().to_vec(),
            });
        }
        let d = expect_len(archive, "d", u.nrows())?;
        Ok(Self { u, v, d })
    }
}

impl Artifact for JfaModel {
    fn save(&self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.set_array("y", &self.y)?;
        archive.set_array("z", &self.z)
    }

    fn load(archive: &Archive) -> Result<Self, ArchiveError> {
        Ok(Self {
            y: archive.get_array1("y")?,
            z: archive.get_array1("z")?,
        })
    }
}

/// JFA training: `V`, then `U`, then `d`, each for `iterations` EM steps.
#[derive(Debug, Clone)]
pub struct JfaTrainer {
    pub iterations: usize,
    pub relevance_factor: f64,
    pub seed: u64,
}

impl JfaTrainer {
    pub fn train(
        &self,
        ubm: &GmmMachine,
        rank_u: usize,
        rank_v: usize,
        data: &[Vec<GmmStats>],
    ) -> Result<JfaBase, MachineError> {
        check_rank("U", rank_u)?;
        check_rank("V", rank_v)?;
        check_groups(ubm, data)?;
        if self.relevance_factor <= 0.0 {
            return Err(MachineError::InvalidParameter(
                "relevance factor must be positive".to_string(),
            ));
        }
        let sv = Supervectors::new(ubm);
        let groups = data
            .iter()
            .map(|g| g.iter().map(|s| sv.session(s)).collect::<Result<Vec<_>, _>>())
            .collect::<Result<Vec<_>, _>>()?;

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut base = JfaBase {
            v: random_loading(&mut rng, &sv.variance, rank_v),
            u: random_loading(&mut rng, &sv.variance, rank_u),
            d: sv.variance.mapv(|v| (v / self.relevance_factor).sqrt()),
        };

        let mut y: Vec<Array1<f64>> = vec![Array1::zeros(rank_v); groups.len()];
        let mut x: Vec<Vec<Array1<f64>>> = groups
            .iter()
            .map(|g| vec![Array1::zeros(rank_u); g.len()])
            .collect();
        let mut z: Vec<Array1<f64>> = vec![Array1::zeros(sv.len()); groups.len()];

        for iteration in 0..=self.iterations {
            let mut acc = LoadingAccumulator::new(sv.n_gaussians, sv.n_inputs, rank_v);
            for (i, sessions) in groups.iter().enumerate() {
                let (n, occupancy, residual) = sum_sessions(sessions, sv.len(), |j, s| {
                    &s.centered - &(&s.occupancy * &(base.u.dot(&x[i][j]) + &(&base.d * &z[i])))
                });
                let (mean, covariance) = latent_posterior(&base.v, &sv.variance, &occupancy, &residual)?;
                acc.add(&n, &residual, &mean, &covariance);
                y[i] = mean;
            }
            if iteration < self.iterations {
                base.v = acc.solve(&base.v)?;
                tracing::debug!(iteration, "JFA V iteration");
            }
        }

        for iteration in 0..=self.iterations {
            let mut acc = LoadingAccumulator::new(sv.n_gaussians, sv.n_inputs, rank_u);
            for (i, sessions) in groups.iter().enumerate() {
                let offset = base.speaker_offset(&y[i], &z[i]);
                for (j, session) in sessions.iter().enumerate() {
                    let residual = &session.centered - &(&session.occupancy * &offset);
                    let (mean, covariance) =
                        latent_posterior(&base.u, &sv.variance, &session.occupancy, &residual)?;
                    acc.add(&session.n, &residual, &mean, &covariance);
                    x[i][j] = mean;
                }
            }
            if iteration < self.iterations {
                base.u = acc.solve(&base.u)?;
                tracing::debug!(iteration, "JFA U iteration");
            }
        }

        for iteration in 0..self.iterations {
            let mut numerator = Array1::<f64>::zeros(sv.len());
            let mut denominator = Array1::<f64>::zeros(sv.len());
            for (i, sessions) in groups.iter().enumerate() {
                let vy = base.v.dot(&y[i]);
                let (_, occupancy, residual) = sum_sessions(sessions, sv.len(), |j, s| {
                    &s.centered - &(&s.occupancy * &(&vy + &base.u.dot(&x[i][j])))
                });
                let (mean, variance) = diagonal_posterior(&base.d, &sv.variance, &occupancy, &residual);
                numerator += &(&residual * &mean);
                denominator += &(&occupancy * &(&variance + &mean.mapv(|m| m * m)));
                z[i] = mean;
            }
            for k in 0..sv.len() {
                if denominator[k] > 0.0 {
                    base.d[k] = numerator[k] / denominator[k];
                }
            }
            tracing::debug!(iteration, "JFA d iteration");
        }

        tracing::info!(
            gaussians = sv.n_gaussians,
            rank_u,
            rank_v,
            identities = groups.len(),
            iterations = self.iterations,
            "JFA subspaces trained"
        );
        Ok(base)
    }
}
