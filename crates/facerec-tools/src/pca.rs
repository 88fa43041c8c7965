//! Eigenfaces: PCA projection with distance scoring.

use crate::tool::{Capabilities, Tool, ToolError, TrainingSet};
use crate::utils::{check_len, mean_vector, stack_vectors};
use facerec_core::machine::LinearMachine;
use facerec_core::{Archive, Artifact, DistanceFunction};
use ndarray::{s, Array1};
use serde::{Deserialize, Serialize};
use std::path::Path;

const NAME: &str = "pca";

/// Archive entry holding the kept eigenvalues of a projector.
pub const EIGENVALUES: &str = "Eigenvalues";

/// Number of kept dimensions, or the fraction of the variance to keep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubspaceDimension {
    Count(usize),
    Fraction(f64),
}

impl SubspaceDimension {
    /// Number of leading eigenvalues to keep out of `eigenvalues`
    /// (sorted in descending order).
    pub fn resolve(self, eigenvalues: &Array1<f64>) -> Result<usize, ToolError> {
        let available = eigenvalues.len();
        match self {
            SubspaceDimension::Count(0) => Err(ToolError::InvalidConfig(
                "subspace dimension must be positive".to_string(),
            )),
            SubspaceDimension::Count(n) if n > available => {
                tracing::warn!(requested = n, available, "subspace dimension clamped");
                Ok(available)
            }
            SubspaceDimension::Count(n) => Ok(n),
            SubspaceDimension::Fraction(f) if !(f > 0.0 && f <= 1.0) => Err(ToolError::InvalidConfig(
                format!("variance fraction {f} outside (0, 1]"),
            )),
            SubspaceDimension::Fraction(f) => {
                let total = eigenvalues.sum();
                let mut kept = 0.0;
                for (i, value) in eigenvalues.iter().enumerate() {
                    kept += value;
                    if kept >= f * total {
                        return Ok(i + 1);
                    }
                }
                Ok(available)
            }
        }
    }
}

fn default_distance() -> DistanceFunction {
    DistanceFunction::Euclidean
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaConfig {
    pub subspace_dimension: SubspaceDimension,
    #[serde(default = "default_distance")]
    pub distance_function: DistanceFunction,
    /// Negate the measure so that larger scores mean more similar.
    #[serde(default = "default_true")]
    pub is_distance_function: bool,
    /// Keep the eigenvalues for variance-weighted distances.
    #[serde(default)]
    pub uses_variances: bool,
}

impl PcaConfig {
    pub const OPTIONS: &'static [&'static str] = &[
        "subspace_dimension",
        "distance_function",
        "is_distance_function",
        "uses_variances",
    ];

    pub fn new(subspace_dimension: SubspaceDimension) -> Self {
        Self {
            subspace_dimension,
            distance_function: default_distance(),
            is_distance_function: true,
            uses_variances: false,
        }
    }
}

/// Scores a model against a probe with a configured distance; shared by the
/// PCA and LDA tools.
#[derive(Debug, Clone)]
pub(crate) struct DistanceScorer {
    pub distance_function: DistanceFunction,
    pub is_distance_function: bool,
    pub uses_variances: bool,
}

impl DistanceScorer {
    pub fn new(
        distance_function: DistanceFunction,
        is_distance_function: bool,
        uses_variances: bool,
    ) -> Result<Self, ToolError> {
        if distance_function.needs_variances() && !uses_variances {
            return Err(ToolError::InvalidConfig(format!(
                "{distance_function} distance needs uses_variances = true"
            )));
        }
        Ok(Self {
            distance_function,
            is_distance_function,
            uses_variances,
        })
    }

    pub fn score(
        &self,
        model: &Array1<f64>,
        probe: &Array1<f64>,
        variances: Option<&Array1<f64>>,
    ) -> Result<f64, ToolError> {
        let value = self
            .distance_function
            .evaluate(model.view(), probe.view(), variances)?;
        Ok(if self.is_distance_function { -value } else { value })
    }

    /// Write a projector, with its eigenvalues when they are used.
    pub fn save_projector(
        &self,
        machine: &LinearMachine,
        eigenvalues: &Array1<f64>,
        path: &Path,
    ) -> Result<(), ToolError> {
        let mut archive = Archive::new();
        machine.save(&mut archive)?;
        if self.uses_variances {
            archive.set_array(EIGENVALUES, eigenvalues)?;
        }
        archive.write(path)?;
        Ok(())
    }

    pub fn load_projector(&self, path: &Path) -> Result<(LinearMachine, Option<Array1<f64>>), ToolError> {
        let archive = Archive::read(path)?;
        let machine = LinearMachine::load(&archive)?;
        let variances = if self.uses_variances {
            let values = archive.get_array1(EIGENVALUES)?;
            check_len(NAME, machine.output_size(), values.len())?;
            Some(values)
        } else {
            None
        };
        Ok((machine, variances))
    }
}

#[derive(Debug, Clone)]
pub struct PcaTool {
    subspace_dimension: SubspaceDimension,
    scorer: DistanceScorer,
    machine: Option<LinearMachine>,
    variances: Option<Array1<f64>>,
}

impl PcaTool {
    pub fn new(config: PcaConfig) -> Result<Self, ToolError> {
        Ok(Self {
            subspace_dimension: config.subspace_dimension,
            scorer: DistanceScorer::new(
                config.distance_function,
                config.is_distance_function,
                config.uses_variances,
            )?,
            machine: None,
            variances: None,
        })
    }

    pub fn machine(&self) -> Option<&LinearMachine> {
        self.machine.as_ref()
    }
}

impl Tool for PcaTool {
    type Feature = Array1<f64>;
    type Projected = Array1<f64>;
    type EnrollInput = Array1<f64>;
    type Model = Array1<f64>;
    type Probe = Array1<f64>;

    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            performs_projection: true,
            requires_projector_training: true,
            use_projected_features_for_enrollment: true,
            ..Capabilities::plain()
        }
    }

    fn train_projector(&mut self, training: &TrainingSet<Array1<f64>>, path: &Path) -> Result<(), ToolError> {
        let data = stack_vectors(NAME, &training.non_empty(NAME)?)?;
        let (mut machine, eigenvalues) = LinearMachine::train_pca(&data)?;
        let kept = self.subspace_dimension.resolve(&eigenvalues)?;
        machine.truncate_outputs(kept);
        let eigenvalues = eigenvalues.slice(s![..kept]).to_owned();

        self.scorer.save_projector(&machine, &eigenvalues, path)?;
        tracing::info!(
            samples = data.nrows(),
            inputs = data.ncols(),
            outputs = kept,
            path = %path.display(),
            "PCA projector trained"
        );

        self.variances = self.scorer.uses_variances.then_some(eigenvalues);
        self.machine = Some(machine);
        Ok(())
    }

    fn load_projector(&mut self, path: &Path) -> Result<(), ToolError> {
        let (machine, variances) = self.scorer.load_projector(path)?;
        self.machine = Some(machine);
        self.variances = variances;
        Ok(())
    }

    fn project(&self, feature: &Array1<f64>) -> Result<Array1<f64>, ToolError> {
        let machine = self.machine.as_ref().ok_or(ToolError::NotReady {
            tool: NAME,
            what: "projector",
        })?;
        check_len(NAME, machine.input_size(), feature.len())?;
        Ok(machine.forward(feature.view())?)
    }

    fn enroll(&self, features: &[Array1<f64>]) -> Result<Array1<f64>, ToolError> {
        mean_vector(NAME, features)
    }

    fn score(&self, model: &Array1<f64>, probe: &Array1<f64>) -> Result<f64, ToolError> {
        self.scorer.score(model, probe, self.variances.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn training() -> TrainingSet<Array1<f64>> {
        let data = Array2::from_shape_fn((12, 4), |(i, k)| ((i * 7 + k * 3) % 5) as f64 + (i * k) as f64 * 0.1);
        TrainingSet::Flat(data.rows().into_iter().map(|r| r.to_owned()).collect())
    }

    #[test]
    fn test_fraction_resolution() {
        let values = array![6.0, 3.0, 1.0];
        assert_eq!(SubspaceDimension::Fraction(0.5).resolve(&values).unwrap(), 1);
        assert_eq!(SubspaceDimension::Fraction(0.9).resolve(&values).unwrap(), 2);
        assert_eq!(SubspaceDimension::Fraction(1.0).resolve(&values).unwrap(), 3);
        assert_eq!(SubspaceDimension::Count(7).resolve(&values).unwrap(), 3);
        assert!(SubspaceDimension::Count(0).resolve(&values).is_err());
        assert!(SubspaceDimension::Fraction(1.5).resolve(&values).is_err());
    }

    #[test]
    fn test_project_before_training() {
        let tool = PcaTool::new(PcaConfig::new(SubspaceDimension::Count(2))).unwrap();
        assert!(matches!(
            tool.project(&array![1.0, 2.0, 3.0, 4.0]),
            Err(ToolError::NotReady { .. })
        ));
        assert!(matches!(
            tool.enroll(&[]),
            Err(ToolError::EmptyEnrollment(_))
        ));
    }

    #[test]
    fn test_variance_weighted_needs_eigenvalues() {
        let mut config = PcaConfig::new(SubspaceDimension::Count(2));
        config.distance_function = DistanceFunction::VarianceWeighted;
        assert!(PcaTool::new(config.clone()).is_err());
        config.uses_variances = true;
        let reload_config = config.clone();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pca.fra");
        let mut tool = PcaTool::new(config).unwrap();
        tool.train_projector(&training(), &path).unwrap();
        assert!(Archive::read(&path).unwrap().contains(EIGENVALUES));

        let projected = tool.project(&array![1.0, 0.0, 2.0, 1.0]).unwrap();
        assert_eq!(projected.len(), 2);
        let model = tool.enroll(&[projected.clone()]).unwrap();
        assert_eq!(tool.score(&model, &projected).unwrap(), 0.0);

        let mut reloaded = PcaTool::new(reload_config).unwrap();
        reloaded.load_projector(&path).unwrap();
        assert_eq!(reloaded.project(&array![1.0, 0.0, 2.0, 1.0]).unwrap(), projected);
    }
}
