//! Joint factor analysis on top of a UBM-GMM.

use crate::gmm::{project_stats, read_stats, read_ubm, train_ubm, GmmParameters};
use crate::isv::clamp_rank;
use crate::tool::{Capabilities, Tool, ToolError, TrainingSet};
use facerec_core::machine::{GmmMachine, GmmStats, JfaBase, JfaModel, JfaTrainer};
use facerec_core::{read_artifact, write_artifact};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

const NAME: &str = "jfa";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JfaConfig {
    #[serde(flatten)]
    pub gmm: GmmParameters,
    pub subspace_dimension_of_u: usize,
    pub subspace_dimension_of_v: usize,
    pub jfa_training_iterations: usize,
    pub jfa_enroll_iterations: usize,
}

impl Default for JfaConfig {
    fn default() -> Self {
        Self {
            gmm: GmmParameters::default(),
            subspace_dimension_of_u: 10,
            subspace_dimension_of_v: 50,
            jfa_training_iterations: 10,
            jfa_enroll_iterations: 1,
        }
    }
}

impl JfaConfig {
    pub const OPTIONS: &'static [&'static str] = &[
        "subspace_dimension_of_u",
        "subspace_dimension_of_v",
        "jfa_training_iterations",
        "jfa_enroll_iterations",
    ];
}

#[derive(Debug, Clone)]
pub struct JfaTool {
    config: JfaConfig,
    ubm: Option<GmmMachine>,
    base: Option<JfaBase>,
}

impl JfaTool {
    pub fn new(config: JfaConfig) -> Result<Self, ToolError> {
        config.gmm.validate()?;
        if config.subspace_dimension_of_u == 0 || config.subspace_dimension_of_v == 0 {
            return Err(ToolError::InvalidConfig(
                "JFA subspace dimensions must be positive".to_string(),
            ));
        }
        Ok(Self {
            config,
            ubm: None,
            base: None,
        })
    }

    pub fn ubm(&self) -> Option<&GmmMachine> {
        self.ubm.as_ref()
    }

    pub fn base(&self) -> Option<&JfaBase> {
        self.base.as_ref()
    }

    fn ready(&self) -> Result<(&GmmMachine, &JfaBase), ToolError> {
        let ubm = self.ubm.as_ref().ok_or(ToolError::NotReady {
            tool: NAME,
            what: "projector",
        })?;
        let base = self.base.as_ref().ok_or(ToolError::NotReady {
            tool: NAME,
            what: "enroller",
        })?;
        Ok((ubm, base))
    }
}

impl Tool for JfaTool {
    type Feature = Array2<f64>;
    type Projected = GmmStats;
    type EnrollInput = GmmStats;
    type Model = JfaModel;
    type Probe = GmmStats;

    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            performs_projection: true,
            requires_projector_training: true,
            use_projected_features_for_enrollment: true,
            requires_enroller_training: true,
            ..Capabilities::plain()
        }
    }

    fn train_projector(&mut self, training: &TrainingSet<Array2<f64>>, path: &Path) -> Result<(), ToolError> {
        let ubm = train_ubm(&self.config.gmm, NAME, &training.non_empty(NAME)?)?;
        write_artifact(&ubm, path)?;
        self.ubm = Some(ubm);
        Ok(())
    }

    fn load_projector(&mut self, path: &Path) -> Result<(), ToolError> {
        self.ubm = Some(read_ubm(&self.config.gmm, NAME, path)?);
        Ok(())
    }

    fn project(&self, feature: &Array2<f64>) -> Result<GmmStats, ToolError> {
        project_stats(NAME, self.ubm.as_ref(), feature)
    }

    fn train_enroller(&mut self, training: &TrainingSet<GmmStats>, path: &Path) -> Result<(), ToolError> {
        let groups = training.by_client(NAME)?;
        let ubm = self.ubm.as_ref().ok_or(ToolError::NotReady {
            tool: NAME,
            what: "projector",
        })?;
        let rank_u = clamp_rank("U", self.config.subspace_dimension_of_u, ubm);
        let rank_v = clamp_rank("V", self.config.subspace_dimension_of_v, ubm);
        let base = JfaTrainer {
            iterations: self.config.jfa_training_iterations,
            relevance_factor: self.config.gmm.relevance_factor,
            seed: self.config.gmm.init_seed,
        }
        .train(ubm, rank_u, rank_v, groups)?;
        write_artifact(&base, path)?;
        tracing::info!(
            clients = groups.len(),
            rank_u,
            rank_v,
            iterations = self.config.jfa_training_iterations,
            path = %path.display(),
            "JFA enroller trained"
        );
        self.base = Some(base);
        Ok(())
    }

    fn load_enroller(&mut self, path: &Path) -> Result<(), ToolError> {
        let base: JfaBase = read_artifact(path)?;
        if let Some(ubm) = &self.ubm {
            base.check_ubm(ubm)?;
        }
        self.base = Some(base);
        Ok(())
    }

    fn enroll(&self, features: &[GmmStats]) -> Result<JfaModel, ToolError> {
        if features.is_empty() {
            return Err(ToolError::EmptyEnrollment(NAME));
        }
        let (ubm, base) = self.ready()?;
        Ok(base.enroll(ubm, features, self.config.jfa_enroll_iterations)?)
    }

    fn score(&self, model: &JfaModel, probe: &GmmStats) -> Result<f64, ToolError> {
        let (ubm, base) = self.ready()?;
        Ok(base.score(ubm, model, probe)?)
    }

    fn read_feature(&self, path: &Path) -> Result<GmmStats, ToolError> {
        read_stats(NAME, self.ubm.as_ref(), path)
    }

    fn read_probe(&self, path: &Path) -> Result<GmmStats, ToolError> {
        read_stats(NAME, self.ubm.as_ref(), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_validation() {
        let config = JfaConfig::default();
        assert_eq!((config.subspace_dimension_of_u, config.subspace_dimension_of_v), (10, 50));
        assert!(JfaTool::new(JfaConfig {
            subspace_dimension_of_v: 0,
            ..JfaConfig::default()
        })
        .is_err());
    }

    #[test]
    fn test_score_needs_enroller() {
        let tool = JfaTool::new(JfaConfig::default()).unwrap();
        let model = JfaModel {
            y: ndarray::Array1::zeros(2),
            z: ndarray::Array1::zeros(4),
        };
        assert!(matches!(
            tool.score(&model, &GmmStats::new(2, 2)),
            Err(ToolError::NotReady { what: "projector", .. })
        ));
    }
}
