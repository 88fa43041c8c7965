//! Fisherfaces: LDA projection, optionally preceded by PCA.

use crate::pca::{DistanceScorer, SubspaceDimension};
use crate::tool::{Capabilities, Tool, ToolError, TrainingSet};
use crate::utils::{check_len, mean_vector, stack_vectors};
use facerec_core::machine::LinearMachine;
use facerec_core::DistanceFunction;
use ndarray::{s, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;

const NAME: &str = "lda";

fn default_distance() -> DistanceFunction {
    DistanceFunction::Euclidean
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LdaConfig {
    /// Kept LDA dimensions; `None` keeps all of them.
    pub lda_subspace_dimension: Option<usize>,
    /// Dimensions of the PCA applied before LDA; `None` disables the PCA.
    pub pca_subspace_dimension: Option<SubspaceDimension>,
    #[serde(default = "default_distance")]
    pub distance_function: DistanceFunction,
    #[serde(default = "default_true")]
    pub is_distance_function: bool,
    pub uses_variances: bool,
}

impl Default for LdaConfig {
    fn default() -> Self {
        Self {
            lda_subspace_dimension: None,
            pca_subspace_dimension: None,
            distance_function: default_distance(),
            is_distance_function: true,
            uses_variances: false,
        }
    }
}

impl LdaConfig {
    pub const OPTIONS: &'static [&'static str] = &[
        "lda_subspace_dimension",
        "pca_subspace_dimension",
        "distance_function",
        "is_distance_function",
        "uses_variances",
    ];
}

#[derive(Debug, Clone)]
pub struct LdaTool {
    lda_subspace_dimension: Option<usize>,
    pca_subspace_dimension: Option<SubspaceDimension>,
    scorer: DistanceScorer,
    machine: Option<LinearMachine>,
    variances: Option<Array1<f64>>,
}

impl LdaTool {
    pub fn new(config: LdaConfig) -> Result<Self, ToolError> {
        if config.lda_subspace_dimension == Some(0) {
            return Err(ToolError::InvalidConfig(
                "LDA subspace dimension must be positive".to_string(),
            ));
        }
        Ok(Self {
            lda_subspace_dimension: config.lda_subspace_dimension,
            pca_subspace_dimension: config.pca_subspace_dimension,
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

    /// Train the (PCA and) LDA machines and fold them into one.
    fn train_machine(&self, groups: &[Vec<Array1<f64>>]) -> Result<(LinearMachine, Array1<f64>), ToolError> {
        let mut classes = groups
            .iter()
            .map(|group| stack_vectors(NAME, &group.iter().collect::<Vec<_>>()))
            .collect::<Result<Vec<_>, _>>()?;
        for class in &classes {
            check_len(NAME, classes[0].ncols(), class.ncols())?;
        }

        let pca = match self.pca_subspace_dimension {
            Some(dimension) => {
                let views: Vec<_> = classes.iter().map(|c| c.view()).collect();
                let all = ndarray::concatenate(Axis(0), &views)
                    .map_err(|e| ToolError::InvalidConfig(format!("{NAME}: {e}")))?;
                let (mut pca, eigenvalues) = LinearMachine::train_pca(&all)?;
                pca.truncate_outputs(dimension.resolve(&eigenvalues)?);
                classes = classes
                    .iter()
                    .map(|class| pca.forward_rows(class))
                    .collect::<Result<Vec<_>, _>>()?;
                Some(pca)
            }
            None => None,
        };

        let (mut lda, eigenvalues) = LinearMachine::train_lda(&classes)?;
        let available = lda.output_size();
        let kept = match self.lda_subspace_dimension {
            Some(n) if n > available => {
                tracing::warn!(requested = n, available, "LDA subspace dimension clamped");
                available
            }
            Some(n) => n,
            None => available,
        };
        lda.truncate_outputs(kept);
        let eigenvalues = eigenvalues.slice(s![..kept]).to_owned();

        let machine = match pca {
            Some(pca) => combine(&pca, &lda),
            None => lda,
        };
        Ok((machine, eigenvalues))
    }
}

/// One linear machine computing `second(first(x))`.
fn combine(first: &LinearMachine, second: &LinearMachine) -> LinearMachine {
    let scaled = &second.weights / &second.input_div.view().insert_axis(Axis(1));
    let offset = (&first.biases - &second.input_sub).dot(&scaled);
    let mut machine = LinearMachine::new(first.weights.dot(&scaled));
    machine.input_sub = first.input_sub.clone();
    machine.input_div = first.input_div.clone();
    machine.biases = offset + &second.biases;
    machine
}

impl Tool for LdaTool {
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
            split_training_features_by_client: true,
            ..Capabilities::plain()
        }
    }

    fn train_projector(&mut self, training: &TrainingSet<Array1<f64>>, path: &Path) -> Result<(), ToolError> {
        let groups = training.by_client(NAME)?;
        let (machine, eigenvalues) = self.train_machine(groups)?;
        self.scorer.save_projector(&machine, &eigenvalues, path)?;
        tracing::info!(
            clients = groups.len(),
            inputs = machine.input_size(),
            outputs = machine.output_size(),
            pca = self.pca_subspace_dimension.is_some(),
            path = %path.display(),
            "LDA projector trained"
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
    use ndarray::array;

    fn grouped() -> TrainingSet<Array1<f64>> {
        let centres = [[0.0, 0.0, 0.0], [5.0, 1.0, 0.0], [0.0, 6.0, 2.0]];
        TrainingSet::ByClient(
            centres
                .iter()
                .map(|c| {
                    (0..6)
                        .map(|i| {
                            let j = i as f64;
                            array![c[0] + (j * 0.9).sin(), c[1] + (j * 1.7).cos(), c[2] + (j * 0.4).sin()]
                        })
                        .collect()
                })
                .collect(),
        )
    }

    #[test]
    fn test_flat_training_rejected() {
        let mut tool = LdaTool::new(LdaConfig::default()).unwrap();
        let flat = TrainingSet::Flat(grouped().flatten().into_iter().cloned().collect());
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            tool.train_projector(&flat, &dir.path().join("lda.fra")),
            Err(ToolError::GroupingRequired(_))
        ));
    }

    #[test]
    fn test_combined_machine_matches_chain() {
        let mut pca = LinearMachine::new(array![[1.0, 0.5], [0.0, 2.0], [1.0, -1.0]]);
        pca.input_sub = array![1.0, 2.0, 3.0];
        pca.input_div = array![1.0, 2.0, 1.0];
        pca.biases = array![0.5, -0.5];
        let mut lda = LinearMachine::new(array![[2.0], [1.0]]);
        lda.input_sub = array![0.25, 1.0];
        lda.input_div = array![2.0, 1.0];
        lda.biases = array![3.0];

        let x = array![0.3, -1.0, 4.0];
        let chained = lda.forward(pca.forward(x.view()).unwrap().view()).unwrap();
        let combined = combine(&pca, &lda).forward(x.view()).unwrap();
        assert!((chained[0] - combined[0]).abs() < 1e-12);
    }

    #[test]
    fn test_pca_lda_lifecycle() {
        let config = LdaConfig {
            lda_subspace_dimension: Some(5),
            pca_subspace_dimension: Some(SubspaceDimension::Count(3)),
            ..LdaConfig::default()
        };
        let mut tool = LdaTool::new(config).unwrap();
        let dir = tempfile::tempdir().unwrap();
        tool.train_projector(&grouped(), &dir.path().join("lda.fra")).unwrap();
        // two directions for three classes
        assert_eq!(tool.machine().unwrap().output_size(), 2);

        let feature = array![5.0, 1.0, 0.0];
        let projected = tool.project(&feature).unwrap();
        let model = tool.enroll(&[projected.clone()]).unwrap();
        assert_eq!(tool.score(&model, &projected).unwrap(), 0.0);
        let other = tool.project(&array![0.0, 6.0, 2.0]).unwrap();
        assert!(tool.score(&model, &other).unwrap() < 0.0);
    }
}
