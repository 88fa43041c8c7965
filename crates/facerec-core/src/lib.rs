//! facerec-core — Machines and storage behind the face recognition tools.
//!
//! Holds the hierarchical artifact container, small dense linear algebra
//! routines, and the trainable machines (linear projections, Gaussian
//! mixtures, factor analysis, PLDA, BIC) together with the similarity
//! measures used for scoring.

pub mod archive;
pub mod distance;
pub mod histogram;
pub mod jet;
pub mod linalg;
pub mod machine;

pub use archive::{read_artifact, write_artifact, Archive, ArchiveError, ArchiveMismatch, Artifact};
pub use distance::DistanceFunction;
pub use histogram::{Histogram, HistogramMeasure};
pub use jet::{JetGraph, JetSimilarity};
pub use machine::MachineError;
