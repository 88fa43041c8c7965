//! Bayesian intrapersonal/extrapersonal classifier (BIC) and its
//! variance-only IEC variant.

use crate::tool::{Capabilities, Tool, ToolError, TrainingSet};
use crate::utils::{check_len, stack_vectors};
use facerec_core::machine::{BicMachine, BicTrainer};
use facerec_core::{read_artifact, write_artifact};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::path::Path;

const NAME: &str = "bic";

/// How two features are turned into a difference vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonFunction {
    Subtract,
    AbsoluteDifference,
}

impl ComparisonFunction {
    pub fn compare(self, a: &Array1<f64>, b: &Array1<f64>) -> Array1<f64> {
        match self {
            ComparisonFunction::Subtract => a - b,
            ComparisonFunction::AbsoluteDifference => (a - b).mapv(f64::abs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BicConfig {
    pub comparison_function: ComparisonFunction,
    /// Upper bound on intra- and extrapersonal pairs each; `None` uses all.
    pub maximum_training_pair_count: Option<usize>,
    /// Kept (intra, extra) subspace dimensions; `None` trains IEC.
    pub subspace_dimensions: Option<(usize, usize)>,
    pub uses_dffs: bool,
}

impl Default for BicConfig {
    fn default() -> Self {
        Self {
            comparison_function: ComparisonFunction::Subtract,
            maximum_training_pair_count: None,
            subspace_dimensions: None,
            uses_dffs: false,
        }
    }
}

impl BicConfig {
    pub const OPTIONS: &'static [&'static str] = &[
        "comparison_function",
        "maximum_training_pair_count",
        "subspace_dimensions",
        "uses_dffs",
    ];
}

#[derive(Debug, Clone)]
pub struct BicTool {
    config: BicConfig,
    machine: Option<BicMachine>,
}

type Pair = ((usize, usize), (usize, usize));

impl BicTool {
    pub fn new(config: BicConfig) -> Result<Self, ToolError> {
        if config.maximum_training_pair_count == Some(0) {
            return Err(ToolError::InvalidConfig(
                "maximum_training_pair_count must be positive".to_string(),
            ));
        }
        if let Some((intra, extra)) = config.subspace_dimensions {
            if intra == 0 || extra == 0 {
                return Err(ToolError::InvalidConfig(
                    "BIC subspace dimensions must be positive".to_string(),
                ));
            }
        }
        Ok(Self {
            config,
            machine: None,
        })
    }

    pub fn machine(&self) -> Option<&BicMachine> {
        self.machine.as_ref()
    }

    fn trainer(&self) -> BicTrainer {
        BicTrainer {
            subspace_dimensions: self.config.subspace_dimensions,
            use_dffs: self.config.uses_dffs,
        }
    }

    /// Keep at most `maximum_training_pair_count` pairs, spread evenly.
    fn limit(&self, pairs: Vec<Pair>) -> Vec<Pair> {
        match self.config.maximum_training_pair_count {
            Some(max) if pairs.len() > max => select_evenly(pairs, max),
            _ => pairs,
        }
    }

    fn differences(
        &self,
        groups: &[Vec<Array1<f64>>],
        pairs: &[Pair],
    ) -> Result<ndarray::Array2<f64>, ToolError> {
        let diffs: Vec<Array1<f64>> = pairs
            .iter()
            .map(|&((c1, i1), (c2, i2))| {
                self.config
                    .comparison_function
                    .compare(&groups[c1][i1], &groups[c2][i2])
            })
            .collect();
        if diffs.is_empty() {
            return Err(ToolError::EmptyTrainingSet(NAME));
        }
        stack_vectors(NAME, &diffs.iter().collect::<Vec<_>>())
    }
}

/// Pick `count` items at indices `floor((i + 0.5) * len / count)`.
fn select_evenly<T: Copy>(items: Vec<T>, count: usize) -> Vec<T> {
    let step = items.len() as f64 / count as f64;
    (0..count)
        .map(|i| items[((i as f64 + 0.5) * step) as usize])
        .collect()
}

/// All pairs of features of the same client.
fn intra_pairs(groups: &[Vec<Array1<f64>>]) -> Vec<Pair> {
    let mut pairs = Vec::new();
    for (c, group) in groups.iter().enumerate() {
        for i in 0..group.len() {
            for j in i + 1..group.len() {
                pairs.push(((c, i), (c, j)));
            }
        }
    }
    pairs
}

/// All pairs of features of two different clients.
fn extra_pairs(groups: &[Vec<Array1<f64>>]) -> Vec<Pair> {
    let mut pairs = Vec::new();
    for c1 in 0..groups.len() {
        for c2 in c1 + 1..groups.len() {
            for i in 0..groups[c1].len() {
                for j in 0..groups[c2].len() {
                    pairs.push(((c1, i), (c2, j)));
                }
            }
        }
    }
    pairs
}

impl Tool for BicTool {
    type Feature = Array1<f64>;
    type Projected = Array1<f64>;
    type EnrollInput = Array1<f64>;
    type Model = Vec<Array1<f64>>;
    type Probe = Array1<f64>;

    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            requires_enroller_training: true,
            ..Capabilities::plain()
        }
    }

    fn train_enroller(&mut self, training: &TrainingSet<Array1<f64>>, path: &Path) -> Result<(), ToolError> {
        let groups = training.by_client(NAME)?;
        let intra = self.limit(intra_pairs(groups));
        let extra = self.limit(extra_pairs(groups));
        tracing::debug!(intra = intra.len(), extra = extra.len(), "BIC training pairs");

        let machine = self
            .trainer()
            .train(&self.differences(groups, &intra)?, &self.differences(groups, &extra)?)?;
        write_artifact(&machine, path)?;
        tracing::info!(
            clients = groups.len(),
            intra_pairs = intra.len(),
            extra_pairs = extra.len(),
            bic = machine.project_data(),
            path = %path.display(),
            "BIC enroller trained"
        );
        self.machine = Some(machine);
        Ok(())
    }

    fn load_enroller(&mut self, path: &Path) -> Result<(), ToolError> {
        let machine: BicMachine = read_artifact(path)?;
        if machine.project_data() != self.config.subspace_dimensions.is_some() {
            return Err(ToolError::InvalidConfig(format!(
                "{} holds a {} machine",
                path.display(),
                if machine.project_data() { "BIC" } else { "IEC" }
            )));
        }
        self.machine = Some(machine);
        Ok(())
    }

    fn enroll(&self, features: &[Array1<f64>]) -> Result<Vec<Array1<f64>>, ToolError> {
        let Some(first) = features.first() else {
            return Err(ToolError::EmptyEnrollment(NAME));
        };
        for f in features {
            check_len(NAME, first.len(), f.len())?;
        }
        Ok(features.to_vec())
    }

    fn score(&self, model: &Vec<Array1<f64>>, probe: &Array1<f64>) -> Result<f64, ToolError> {
        let machine = self.machine.as_ref().ok_or(ToolError::NotReady {
            tool: NAME,
            what: "enroller",
        })?;
        if model.is_empty() {
            return Err(ToolError::EmptyEnrollment(NAME));
        }
        let mut total = 0.0;
        for feature in model {
            check_len(NAME, machine.input_size(), feature.len())?;
            check_len(NAME, machine.input_size(), probe.len())?;
            let difference = self.config.comparison_function.compare(feature, probe);
            total += machine.forward(difference.view())?;
        }
        Ok(total / model.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_select_evenly() {
        let items: Vec<usize> = (0..10).collect();
        assert_eq!(select_evenly(items.clone(), 4), vec![1, 3, 6, 8]);
        assert_eq!(select_evenly(items, 10), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_pair_counts() {
        let groups = vec![vec![array![1.0]; 3], vec![array![2.0]; 2], vec![array![3.0]; 1]];
        assert_eq!(intra_pairs(&groups).len(), 3 + 1);
        assert_eq!(extra_pairs(&groups).len(), 3 * 2 + 3 + 2);
    }

    #[test]
    fn test_comparison_functions() {
        let (a, b) = (array![1.0, 5.0], array![3.0, 2.0]);
        assert_eq!(ComparisonFunction::Subtract.compare(&a, &b), array![-2.0, 3.0]);
        assert_eq!(ComparisonFunction::AbsoluteDifference.compare(&a, &b), array![2.0, 3.0]);
    }

    #[test]
    fn test_score_needs_enroller() {
        let tool = BicTool::new(BicConfig::default()).unwrap();
        let model = tool.enroll(&[array![1.0, 2.0]]).unwrap();
        assert!(matches!(
            tool.score(&model, &array![1.0, 2.0]),
            Err(ToolError::NotReady { .. })
        ));
        assert!(BicTool::new(BicConfig {
            subspace_dimensions: Some((0, 3)),
            ..BicConfig::default()
        })
        .is_err());
    }
}
