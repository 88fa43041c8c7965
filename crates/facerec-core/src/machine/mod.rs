//! Trainable machines and their trainers.

pub mod bic;
pub mod factor;
pub mod gmm;
pub mod kmeans;
pub mod linear;
pub mod plda;

pub use bic::{BicMachine, BicTrainer};
pub use factor::{IsvBase, IsvModel, IsvTrainer, JfaBase, JfaModel, JfaTrainer};
pub use gmm::{linear_scoring, GmmMachine, GmmStats, MapGmmTrainer, MlGmmTrainer};
pub use kmeans::{KMeansMachine, KMeansTrainer};
pub use linear::LinearMachine;
pub use plda::{PldaBase, PldaModel, PldaTrainer};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MachineError {
    #[error("matrix is singular")]
    Singular,
    #[error("matrix is not positive definite")]
    NotPositiveDefinite,
    #[error("eigen solver did not converge after {0} sweeps")]
    NoConvergence(usize),
    #[error("expected a square matrix, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("no training data")]
    EmptyData,
    #[error("cluster {0} received no samples")]
    EmptyCluster(usize),
    #[error("class {0} has no samples")]
    EmptyGroup(usize),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Check that `got` equals `expected`.
pub(crate) fn check_dim(expected: usize, got: usize) -> Result<(), MachineError> {
    if expected == got {
        Ok(())
    } else {
        Err(MachineError::DimensionMismatch { expected, got })
    }
}
