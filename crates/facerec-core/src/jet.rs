//! Gabor jet graphs and jet similarity functions.

use crate::archive::{Archive, ArchiveError, Artifact};
use crate::machine::MachineError;
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Gabor jets at the nodes of a face graph.
#[derive(Debug, Clone, PartialEq)]
pub struct JetGraph {
    /// Nodes × jet length magnitudes.
    pub absolute: Array2<f64>,
    /// Phases with the same shape as `absolute`, when extracted.
    pub phase: Option<Array2<f64>>,
}

impl JetGraph {
    pub fn new(absolute: Array2<f64>, phase: Option<Array2<f64>>) -> Result<Self, MachineError> {
        if let Some(phase) = &phase {
            if phase.dim() != absolute.dim() {
                return Err(MachineError::DimensionMismatch {
                    expected: absolute.len(),
                    got: phase.len(),
                });
            }
        }
        Ok(Self { absolute, phase })
    }

    pub fn n_nodes(&self) -> usize {
        self.absolute.nrows()
    }

    pub fn jet_length(&self) -> usize {
        self.absolute.ncols()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JetSimilarity {
    /// Normalized scalar product of the magnitudes.
    ScalarProduct,
    /// Mean of `1 - |a - b| / (a + b)` over the jet.
    Canberra,
    /// Magnitude-weighted cosine of the phase differences.
    PhaseDiff,
    /// Mean of [`JetSimilarity::Canberra`] and [`JetSimilarity::PhaseDiff`].
    PhaseDiffPlusCanberra,
}

impl JetSimilarity {
    pub fn needs_phases(self) -> bool {
        matches!(self, JetSimilarity::PhaseDiff | JetSimilarity::PhaseDiffPlusCanberra)
    }

    /// Similarity of node `node` of two graphs; 1 for identical jets.
    pub fn node_similarity(self, a: &JetGraph, b: &JetGraph, node: usize) -> Result<f64, MachineError> {
        if a.absolute.dim() != b.absolute.dim() {
            return Err(MachineError::DimensionMismatch {
                expected: a.absolute.len(),
                got: b.absolute.len(),
            });
        }
        if node >= a.n_nodes() {
            return Err(MachineError::InvalidParameter(format!(
                "node {node} out of range for {} nodes",
                a.n_nodes()
            )));
        }
        let (ma, mb) = (a.absolute.row(node), b.absolute.row(node));
        let phases = || {
            phase_rows(a, b, node).ok_or_else(|| {
                MachineError::InvalidParameter(format!("{self:?} similarity needs jet phases"))
            })
        };
        Ok(match self {
            JetSimilarity::ScalarProduct => scalar_product(ma, mb),
            JetSimilarity::Canberra => canberra(ma, mb),
            JetSimilarity::PhaseDiff => {
                let (pa, pb) = phases()?;
                phase_diff(ma, mb, pa, pb)
            }
            JetSimilarity::PhaseDiffPlusCanberra => {
                let (pa, pb) = phases()?;
                0.5 * (canberra(ma, mb) + phase_diff(ma, mb, pa, pb))
            }
        })
    }
}

fn phase_rows<'a>(
    a: &'a JetGraph,
    b: &'a JetGraph,
    node: usize,
) -> Option<(ArrayView1<'a, f64>, ArrayView1<'a, f64>)> {
    match (&a.phase, &b.phase) {
        (Some(pa), Some(pb)) => Some((pa.row(node), pb.row(node))),
        _ => None,
    }
}

fn scalar_product(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    let denom = (a.dot(&a) * b.dot(&b)).sqrt();
    if denom > 0.0 {
        a.dot(&b) / denom
    } else {
        0.0
    }
}

fn canberra(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    let total: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let sum = x.abs() + y.abs();
            if sum > 0.0 {
                1.0 - (x - y).abs() / sum
            } else {
                1.0
            }
        })
        .sum();
    total / a.len() as f64
}

fn phase_diff(
    a: ArrayView1<'_, f64>,
    b: ArrayView1<'_, f64>,
    pa: ArrayView1<'_, f64>,
    pb: ArrayView1<'_, f64>,
) -> f64 {
    let denom = (a.dot(&a) * b.dot(&b)).sqrt();
    if denom <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = a
        .iter()
        .zip(b.iter())
        .zip(pa.iter().zip(pb.iter()))
        .map(|((x, y), (p, q))| x * y * (p - q).cos())
        .sum();
    weighted / denom
}

impl Artifact for JetGraph {
    fn save(&self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.set_array("absolute", &self.absolute)?;
        if let Some(phase) = &self.phase {
            archive.set_array("phase", phase)?;
        }
        Ok(())
    }

    fn load(archive: &Archive) -> Result<Self, ArchiveError> {
        let absolute = archive.get_array2("absolute")?;
        let phase = if archive.contains("phase") {
            let phase = archive.get_array2("phase")?;
            if phase.dim() != absolute.dim() {
                return Err(ArchiveError::Shape {
                    path: "phase".to_string(),
                    expected: format!("{:?}", absolute.shape()),
                    found: phase.shape().to_vec(),
                });
            }
            Some(phase)
        } else {
            None
        };
        Ok(Self { absolute, phase })
    }
}
