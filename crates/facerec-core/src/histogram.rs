//! Dense and sparse histograms with bin-wise similarity measures.

use crate::archive::{Archive, ArchiveError, Artifact};
use crate::machine::MachineError;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

const KL_EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq)]
pub enum Histogram {
    Dense(Array1<f64>),
    /// Non-zero bins with strictly increasing indices.
    Sparse { indices: Vec<usize>, values: Vec<f64> },
}

impl Histogram {
    /// Build a sparse histogram, sorting the bins by index.
    pub fn sparse(mut bins: Vec<(usize, f64)>) -> Result<Self, MachineError> {
        bins.sort_by_key(|&(i, _)| i);
        if let Some(w) = bins.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(MachineError::InvalidParameter(format!(
                "duplicate histogram bin {}",
                w[0].0
            )));
        }
        let (indices, values) = bins.into_iter().unzip();
        Ok(Histogram::Sparse { indices, values })
    }

    /// `(bin, value)` pairs in increasing bin order.
    pub fn bins(&self) -> Vec<(usize, f64)> {
        match self {
            Histogram::Dense(values) => values.iter().copied().enumerate().collect(),
            Histogram::Sparse { indices, values } => {
                indices.iter().copied().zip(values.iter().copied()).collect()
            }
        }
    }
}

/// Visit every bin present in either histogram, missing bins counting as 0.
fn for_each_pair(a: &Histogram, b: &Histogram, mut f: impl FnMut(f64, f64)) {
    let (a, b) = (a.bins(), b.bins());
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        match (a.get(i), b.get(j)) {
            (Some(&(ia, va)), Some(&(ib, vb))) if ia == ib => {
                f(va, vb);
                i += 1;
                j += 1;
            }
            (Some(&(ia, va)), Some(&(ib, _))) if ia < ib => {
                f(va, 0.0);
                i += 1;
            }
            (Some(&(_, va)), None) => {
                f(va, 0.0);
                i += 1;
            }
            (_, Some(&(_, vb))) => {
                f(0.0, vb);
                j += 1;
            }
            (None, None) => break,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistogramMeasure {
    HistogramIntersection,
    ChiSquare,
    KullbackLeibler,
}

impl HistogramMeasure {
    /// Whether larger values mean less similar histograms.
    pub fn is_distance(self) -> bool {
        !matches!(self, HistogramMeasure::HistogramIntersection)
    }

    pub fn evaluate(self, a: &Histogram, b: &Histogram) -> f64 {
        let mut total = 0.0;
        for_each_pair(a, b, |x, y| {
            total += match self {
                HistogramMeasure::HistogramIntersection => x.min(y),
                HistogramMeasure::ChiSquare => {
                    if x + y > 0.0 {
                        (x - y).powi(2) / (x + y)
                    } else {
                        0.0
                    }
                }
                HistogramMeasure::KullbackLeibler => {
                    (x - y) * ((x + KL_EPSILON) / (y + KL_EPSILON)).ln()
                }
            }
        });
        total
    }
}

impl Artifact for Histogram {
    fn save(&self, archive: &mut Archive) -> Result<(), ArchiveError> {
        match self {
            Histogram::Dense(values) => archive.set_array("histogram", values),
            Histogram::Sparse { indices, values } => {
                let indices = Array1::from_iter(indices.iter().map(|&i| i as f64));
                archive.set_array("indices", &indices)?;
                archive.set_array("values", &Array1::from_vec(values.clone()))
            }
        }
    }

    fn load(archive: &Archive) -> Result<Self, ArchiveError> {
        if archive.contains("histogram") {
            return Ok(Histogram::Dense(archive.get_array1("histogram")?));
        }
        let raw = archive.get_array1("indices")?;
        let values = archive.get_array1("values")?;
        if raw.len() != values.len() {
            return Err(ArchiveError::Shape {
                path: "values".to_string(),
                expected: format!("length {}", raw.len()),
                found: vec![values.len()],
            });
        }
        let mut indices = Vec::with_capacity(raw.len());
        for &v in raw.iter() {
            if v < 0.0 || v.fract() != 0.0 || indices.last().is_some_and(|&last| v as usize <= last) {
                return Err(ArchiveError::InvalidValue {
                    path: "indices".to_string(),
                    reason: format!("bin index {v} is not a strictly increasing integer"),
                });
            }
            indices.push(v as usize);
        }
        Ok(Histogram::Sparse {
            indices,
            values: values.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_intersection_over_union_of_bins() {
        let sparse = Histogram::sparse(vec![(4, 2.0), (0, 1.0)]).unwrap();
        let dense = Histogram::Dense(array![3.0, 5.0, 0.0, 0.0, 1.0, 7.0]);
        assert_eq!(HistogramMeasure::HistogramIntersection.evaluate(&sparse, &dense), 2.0);
        assert_eq!(HistogramMeasure::HistogramIntersection.evaluate(&dense, &sparse), 2.0);
    }

    #[test]
    fn test_chi_square_and_kl() {
        let a = Histogram::Dense(array![1.0, 0.0, 2.0]);
        let b = Histogram::Dense(array![1.0, 2.0, 0.0]);
        assert_eq!(HistogramMeasure::ChiSquare.evaluate(&a, &b), 4.0);
        assert_eq!(HistogramMeasure::ChiSquare.evaluate(&a, &a), 0.0);
        assert!(HistogramMeasure::KullbackLeibler.evaluate(&a, &b) > 0.0);
        assert_eq!(HistogramMeasure::KullbackLeibler.evaluate(&a, &a), 0.0);
        assert!(HistogramMeasure::ChiSquare.is_distance());
    }

    #[test]
    fn test_archive_layouts() {
        let sparse = Histogram::sparse(vec![(1, 0.5), (7, 2.0)]).unwrap();
        let mut archive = Archive::new();
        sparse.save(&mut archive).unwrap();
        assert!(archive.contains("indices") && !archive.contains("histogram"));
        assert_eq!(Histogram::load(&archive).unwrap(), sparse);

        let mut archive = Archive::new();
        archive.set_array("indices", &array![3.0, 1.0]).unwrap();
        archive.set_array("values", &array![1.0, 1.0]).unwrap();
        assert!(Histogram::load(&archive).is_err());
        assert!(Histogram::sparse(vec![(1, 1.0), (1, 2.0)]).is_err());
    }
}
