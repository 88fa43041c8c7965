//! Bayesian intrapersonal/extrapersonal classifier.
//!
//! Difference vectors between two samples of the same identity (intra) and
//! of different identities (extra) are modelled by one Gaussian each. The
//! IEC variant keeps a diagonal covariance per class; the BIC variant keeps
//! the leading principal subspace per class and, optionally, the distance
//! from that subspace (DFFS) weighted by the average residual eigenvalue.

use super::linear::{expect_len, LinearMachine};
use super::{check_dim, MachineError};
use crate::archive::{Archive, ArchiveError, Artifact};
use ndarray::{s, Array1, Array2, ArrayView1};

#[derive(Debug, Clone, PartialEq)]
pub enum BicClass {
    Iec {
        mean: Array1<f64>,
        variance: Array1<f64>,
    },
    Bic {
        mean: Array1<f64>,
        eigenvalues: Array1<f64>,
        /// Input × kept-dimensions eigenvector matrix.
        subspace: Array2<f64>,
        /// Average of the discarded eigenvalues.
        rho: f64,
    },
}

impl BicClass {
    fn mean(&self) -> &Array1<f64> {
        match self {
            BicClass::Iec { mean, .. } | BicClass::Bic { mean, .. } => mean,
        }
    }

    /// Mahalanobis distance plus log-determinant of the class covariance.
    fn distance(&self, x: ArrayView1<'_, f64>, use_dffs: bool) -> f64 {
        match self {
            BicClass::Iec { mean, variance } => x
                .iter()
                .zip(mean)
                .zip(variance)
                .map(|((v, m), s)| (v - m).powi(2) / s + s.ln())
                .sum(),
            BicClass::Bic {
                mean,
                eigenvalues,
                subspace,
                rho,
            } => {
                let centered = &x - mean;
                let projected = centered.dot(subspace);
                let mut distance: f64 = projected
                    .iter()
                    .zip(eigenvalues)
                    .map(|(y, l)| y * y / l + l.ln())
                    .sum();
                let residual_dims = mean.len() - eigenvalues.len();
                if use_dffs && residual_dims > 0 && *rho > 0.0 {
                    let residual = (centered.dot(&centered) - projected.dot(&projected)).max(0.0);
                    distance += residual / rho + residual_dims as f64 * rho.ln();
                }
                distance
            }
        }
    }

    fn save(&self, archive: &mut Archive, prefix: &str) -> Result<(), ArchiveError> {
        match self {
            BicClass::Iec { mean, variance } => {
                archive.set_array(&format!("{prefix}_mean"), mean)?;
                archive.set_array(&format!("{prefix}_variance"), variance)
            }
            BicClass::Bic {
                mean,
                eigenvalues,
                subspace,
                rho,
            } => {
                archive.set_array(&format!("{prefix}_mean"), mean)?;
                archive.set_array(&format!("{prefix}_eigenvalues"), eigenvalues)?;
                archive.set_array(&format!("{prefix}_subspace"), subspace)?;
                archive.set_f64(&format!("{prefix}_rho"), *rho)
            }
        }
    }

    fn load(archive: &Archive, prefix: &str, project_data: bool) -> Result<Self, ArchiveError> {
        let mean = archive.get_array1(&format!("{prefix}_mean"))?;
        if !project_data {
            let variance = expect_len(archive, &format!("{prefix}_variance"), mean.len())?;
            return Ok(BicClass::Iec { mean, variance });
        }
        let path = format!("{prefix}_subspace");
        let subspace = archive.get_array2(&path)?;
        if subspace.nrows() != mean.len() {
            return Err(ArchiveError::Shape {
                path,
                expected: format!("{} rows", mean.len()),
                found: subspace.shape().to_vec(),
            });
        }
        Ok(BicClass::Bic {
            eigenvalues: expect_len(archive, &format!("{prefix}_eigenvalues"), subspace.ncols())?,
            rho: archive.get_f64(&format!("{prefix}_rho"))?,
            subspace,
            mean,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BicMachine {
    pub intra: BicClass,
    pub extra: BicClass,
    pub use_dffs: bool,
}

impl BicMachine {
    pub fn input_size(&self) -> usize {
        self.intra.mean().len()
    }

    pub fn project_data(&self) -> bool {
        matches!(self.intra, BicClass::Bic { .. })
    }

    /// `0.5 * (d_extra - d_intra)` for a difference vector; larger means
    /// more likely to be intrapersonal.
    pub fn forward(&self, difference: ArrayView1<'_, f64>) -> Result<f64, MachineError> {
        check_dim(self.input_size(), difference.len())?;
        Ok(0.5
            * (self.extra.distance(difference, self.use_dffs)
                - self.intra.distance(difference, self.use_dffs)))
    }

    pub fn is_similar_to(&self, other: &BicMachine, tolerance: f64) -> bool {
        fn close(a: &Array1<f64>, b: &Array1<f64>, tolerance: f64) -> bool {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tolerance)
        }
        fn similar(a: &BicClass, b: &BicClass, tolerance: f64) -> bool {
            match (a, b) {
                (
                    BicClass::Iec { mean: ma, variance: va },
                    BicClass::Iec { mean: mb, variance: vb },
                ) => close(ma, mb, tolerance) && close(va, vb, tolerance),
                (
                    BicClass::Bic {
                        mean: ma,
                        eigenvalues: ea,
                        subspace: sa,
                        rho: ra,
                    },
                    BicClass::Bic {
                        mean: mb,
                        eigenvalues: eb,
                        subspace: sb,
                        rho: rb,
                    },
                ) => {
                    close(ma, mb, tolerance)
                        && close(ea, eb, tolerance)
                        && sa.dim() == sb.dim()
                        && sa.iter().zip(sb).all(|(x, y)| (x - y).abs() <= tolerance)
                        && (ra - rb).abs() <= tolerance
                }
                _ => false,
            }
        }
        self.use_dffs == other.use_dffs
            && similar(&self.intra, &other.intra, tolerance)
            && similar(&self.extra, &other.extra, tolerance)
    }
}

impl Artifact for BicMachine {
    fn save(&self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.set_bool("project_data", self.project_data())?;
        archive.set_bool("use_DFFS", self.use_dffs)?;
        self.intra.save(archive, "intra")?;
        self.extra.save(archive, "extra")
    }

    fn load(archive: &Archive) -> Result<Self, ArchiveError> {
        let project_data = archive.get_bool("project_data")?;
        let machine = Self {
            intra: BicClass::load(archive, "intra", project_data)?,
            extra: BicClass::load(archive, "extra", project_data)?,
            use_dffs: archive.get_bool("use_DFFS")?,
        };
        if machine.intra.mean().len() != machine.extra.mean().len() {
            return Err(ArchiveError::Shape {
                path: "extra_mean".to_string(),
                expected: format!("length {}", machine.intra.mean().len()),
                found: vec![machine.extra.mean().len()],
            });
        }
        Ok(machine)
    }
}

/// Trains a [`BicMachine`] from intra- and extrapersonal difference vectors
/// (one per row). Without subspace dimensions the IEC variant is trained.
#[derive(Debug, Clone)]
pub struct BicTrainer {
    pub subspace_dimensions: Option<(usize, usize)>,
    pub use_dffs: bool,
}

impl BicTrainer {
    pub fn train(&self, intra: &Array2<f64>, extra: &Array2<f64>) -> Result<BicMachine, MachineError> {
        check_dim(intra.ncols(), extra.ncols())?;
        let (intra, extra) = match self.subspace_dimensions {
            None => (train_iec(intra)?, train_iec(extra)?),
            Some((intra_dim, extra_dim)) => (
                train_bic(intra, intra_dim, self.use_dffs)?,
                train_bic(extra, extra_dim, self.use_dffs)?,
            ),
        };
        Ok(BicMachine {
            intra,
            extra,
            use_dffs: self.use_dffs,
        })
    }
}

fn train_iec(data: &Array2<f64>) -> Result<BicClass, MachineError> {
    if data.nrows() < 2 {
        return Err(MachineError::EmptyData);
    }
    let mean = data.mean_axis(ndarray::Axis(0)).ok_or(MachineError::EmptyData)?;
    let variance = data.var_axis(ndarray::Axis(0), 1.0);
    if variance.iter().any(|&v| v <= 0.0) {
        return Err(MachineError::Singular);
    }
    Ok(BicClass::Iec { mean, variance })
}

fn train_bic(data: &Array2<f64>, dimension: usize, use_dffs: bool) -> Result<BicClass, MachineError> {
    let (machine, values) = LinearMachine::train_pca(data)?;
    if dimension == 0 || dimension > values.len() {
        return Err(MachineError::InvalidParameter(format!(
            "requested {dimension} subspace dimensions, only {} available",
            values.len()
        )));
    }
    let eigenvalues = values.slice(s![..dimension]).to_owned();
    if eigenvalues.iter().any(|&v| v <= 0.0) {
        return Err(MachineError::Singular);
    }

    let inputs = data.ncols();
    let rho = if inputs > dimension {
        values.slice(s![dimension..]).sum() / (inputs - dimension) as f64
    } else {
        0.0
    };
    if use_dffs && inputs > dimension && rho <= 0.0 {
        return Err(MachineError::InvalidParameter(
            "no residual variance outside the kept subspace".to_string(),
        ));
    }

    Ok(BicClass::Bic {
        mean: machine.input_sub,
        eigenvalues,
        subspace: machine.weights.slice(s![.., ..dimension]).to_owned(),
        rho,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn differences() -> (Array2<f64>, Array2<f64>) {
        let intra = Array2::from_shape_fn((12, 3), |(i, k)| ((i * 3 + k * 5) % 7) as f64 * 0.1 - 0.3);
        let extra = Array2::from_shape_fn((12, 3), |(i, k)| ((i * 5 + k * 3) % 11) as f64 - 5.0);
        (intra, extra)
    }

    #[test]
    fn test_iec_prefers_small_differences() {
        let (intra, extra) = differences();
        let trainer = BicTrainer {
            subspace_dimensions: None,
            use_dffs: false,
        };
        let machine = trainer.train(&intra, &extra).unwrap();
        assert!(!machine.project_data());
        let close = machine.forward(array![0.0, 0.0, 0.0].view()).unwrap();
        let far = machine.forward(array![4.0, -4.0, 4.0].view()).unwrap();
        assert!(close > far);
    }

    #[test]
    fn test_bic_subspace_and_dffs() {
        let (intra, extra) = differences();
        let trainer = BicTrainer {
            subspace_dimensions: Some((1, 2)),
            use_dffs: true,
        };
        let machine = trainer.train(&intra, &extra).unwrap();
        assert!(machine.project_data());
        match &machine.intra {
            BicClass::Bic { subspace, rho, .. } => {
                assert_eq!(subspace.dim(), (3, 1));
                assert!(*rho > 0.0);
            }
            BicClass::Iec { .. } => panic!("expected a BIC class"),
        }
        let close = machine.forward(array![0.0, 0.0, 0.0].view()).unwrap();
        let far = machine.forward(array![4.0, -4.0, 4.0].view()).unwrap();
        assert!(close > far);
    }

    #[test]
    fn test_too_many_dimensions() {
        let (intra, extra) = differences();
        let trainer = BicTrainer {
            subspace_dimensions: Some((4, 2)),
            use_dffs: false,
        };
        assert!(matches!(
            trainer.train(&intra, &extra),
            Err(MachineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_archive_roundtrip() {
        let (intra, extra) = differences();
        for dims in [None, Some((2, 2))] {
            let machine = BicTrainer {
                subspace_dimensions: dims,
                use_dffs: false,
            }
            .train(&intra, &extra)
            .unwrap();
            let mut archive = Archive::new();
            machine.save(&mut archive).unwrap();
            assert_eq!(archive.contains("intra_rho"), dims.is_some());
            let back = BicMachine::load(&archive).unwrap();
            assert!(back.is_similar_to(&machine, 0.0));
        }
    }
}
