//! Vector distances used to compare projected features.

use crate::machine::MachineError;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceFunction {
    Euclidean,
    SquaredEuclidean,
    CityBlock,
    Chebyshev,
    /// `1 - cos(a, b)`.
    Cosine,
    /// Euclidean distance with every dimension divided by its variance.
    VarianceWeighted,
}

impl DistanceFunction {
    pub fn needs_variances(self) -> bool {
        matches!(self, DistanceFunction::VarianceWeighted)
    }

    pub fn evaluate(
        self,
        a: ArrayView1<'_, f64>,
        b: ArrayView1<'_, f64>,
        variances: Option<&Array1<f64>>,
    ) -> Result<f64, MachineError> {
        if a.len() != b.len() {
            return Err(MachineError::DimensionMismatch {
                expected: a.len(),
                got: b.len(),
            });
        }
        let diffs = a.iter().zip(b.iter()).map(|(x, y)| x - y);
        let value = match self {
            DistanceFunction::Euclidean => diffs.map(|d| d * d).sum::<f64>().sqrt(),
            DistanceFunction::SquaredEuclidean => diffs.map(|d| d * d).sum(),
            DistanceFunction::CityBlock => diffs.map(f64::abs).sum(),
            DistanceFunction::Chebyshev => diffs.map(f64::abs).fold(0.0, f64::max),
            DistanceFunction::Cosine => {
                let denom = a.dot(&a).sqrt() * b.dot(&b).sqrt();
                if denom > 0.0 {
                    1.0 - a.dot(&b) / denom
                } else {
                    1.0
                }
            }
            DistanceFunction::VarianceWeighted => {
                let variances = variances.ok_or_else(|| {
                    MachineError::InvalidParameter(
                        "variance weighted distance needs variances".to_string(),
                    )
                })?;
                if variances.len() < a.len() {
                    return Err(MachineError::DimensionMismatch {
                        expected: a.len(),
                        got: variances.len(),
                    });
                }
                diffs
                    .zip(variances.iter())
                    .map(|(d, v)| d * d / v)
                    .sum::<f64>()
                    .sqrt()
            }
        };
        Ok(value)
    }
}

impl fmt::Display for DistanceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DistanceFunction::Euclidean => "euclidean",
            DistanceFunction::SquaredEuclidean => "squared_euclidean",
            DistanceFunction::CityBlock => "city_block",
            DistanceFunction::Chebyshev => "chebyshev",
            DistanceFunction::Cosine => "cosine",
            DistanceFunction::VarianceWeighted => "variance_weighted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_distances() {
        let a = array![1.0, 2.0, 3.0];
        let b = array![4.0, 6.0, 3.0];
        let eval = |f: DistanceFunction| f.evaluate(a.view(), b.view(), Some(&array![1.0, 4.0, 1.0])).unwrap();
        assert_eq!(eval(DistanceFunction::Euclidean), 5.0);
        assert_eq!(eval(DistanceFunction::SquaredEuclidean), 25.0);
        assert_eq!(eval(DistanceFunction::CityBlock), 7.0);
        assert_eq!(eval(DistanceFunction::Chebyshev), 4.0);
        assert_eq!(eval(DistanceFunction::VarianceWeighted), 13.0f64.sqrt());
        assert!(eval(DistanceFunction::Cosine) > 0.0);
    }

    #[test]
    fn test_cosine_self_distance_is_zero() {
        let a = array![0.3, -1.0, 2.0];
        let d = DistanceFunction::Cosine.evaluate(a.view(), a.view(), None).unwrap();
        assert!(d.abs() < 1e-12);
    }

    #[test]
    fn test_variance_weighted_requires_variances() {
        let a = array![1.0];
        assert!(DistanceFunction::VarianceWeighted
            .evaluate(a.view(), a.view(), None)
            .is_err());
        assert!(DistanceFunction::Euclidean
            .evaluate(a.view(), array![1.0, 2.0].view(), None)
            .is_err());
    }

    #[test]
    fn test_serde_names() {
        let parsed: DistanceFunction = serde_json::from_str("\"city_block\"").unwrap();
        assert_eq!(parsed, DistanceFunction::CityBlock);
        assert_eq!(DistanceFunction::SquaredEuclidean.to_string(), "squared_euclidean");
    }
}
