//! Inter-session variability modelling on top of a UBM-GMM.

use crate::gmm::{project_stats, read_stats, read_ubm, train_ubm, GmmParameters};
use crate::tool::{Capabilities, Tool, ToolError, TrainingSet};
use facerec_core::machine::{GmmMachine, GmmStats, IsvBase, IsvModel, IsvTrainer};
use facerec_core::{read_artifact, write_artifact};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

const NAME: &str = "isv";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsvConfig {
    #[serde(flatten)]
    pub gmm: GmmParameters,
    pub subspace_dimension_of_u: usize,
    #[serde(alias = "jfa_training_iterations")]
    pub isv_training_iterations: usize,
    pub isv_enroll_iterations: usize,
}

impl Default for IsvConfig {
    fn default() -> Self {
        Self {
            gmm: GmmParameters::default(),
            subspace_dimension_of_u: 160,
            isv_training_iterations: 10,
            isv_enroll_iterations: 1,
        }
    }
}

impl IsvConfig {
    pub const OPTIONS: &'static [&'static str] = &[
        "subspace_dimension_of_u",
        "isv_training_iterations",
        "jfa_training_iterations",
        "isv_enroll_iterations",
    ];
}

/// Clamp a subspace rank to the supervector length.
pub(crate) fn clamp_rank(name: &'static str, rank: usize, ubm: &GmmMachine) -> usize {
    let available = ubm.n_gaussians() * ubm.n_inputs();
    if rank > available {
        tracing::warn!(subspace = name, requested = rank, available, "subspace rank clamped");
        available
    } else {
        rank
    }
}

#[derive(Debug, Clone)]
pub struct IsvTool {
    config: IsvConfig,
    ubm: Option<GmmMachine>,
    base: Option<IsvBase>,
}

impl IsvTool {
    pub fn new(config: IsvConfig) -> Result<Self, ToolError> {
        config.gmm.validate()?;
        if config.subspace_dimension_of_u == 0 {
            return Err(ToolError::InvalidConfig(
                "subspace_dimension_of_u must be positive".to_string(),
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

    pub fn base(&self) -> Option<&IsvBase> {
        self.base.as_ref()
    }

    fn ready(&self) -> Result<(&GmmMachine, &IsvBase), ToolError> {
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

impl Tool for IsvTool {
    type Feature = Array2<f64>;
    type Projected = GmmStats;
    type EnrollInput = GmmStats;
    type Model = IsvModel;
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
        let rank = clamp_rank("U", self.config.subspace_dimension_of_u, ubm);
        let base = IsvTrainer {
            iterations: self.config.isv_training_iterations,
            relevance_factor: self.config.gmm.relevance_factor,
            seed: self.config.gmm.init_seed,
        }
        .train(ubm, rank, groups)?;
        write_artifact(&base, path)?;
        tracing::info!(
            clients = groups.len(),
            rank_u = rank,
            iterations = self.config.isv_training_iterations,
            path = %path.display(),
            "ISV enroller trained"
        );
        self.base = Some(base);
        Ok(())
    }

    fn load_enroller(&mut self, path: &Path) -> Result<(), ToolError> {
        let base: IsvBase = read_artifact(path)?;
        if let Some(ubm) = &self.ubm {
            base.check_ubm(ubm)?;
        }
        self.base = Some(base);
        Ok(())
    }

    fn enroll(&self, features: &[GmmStats]) -> Result<IsvModel, ToolError> {
        if features.is_empty() {
            return Err(ToolError::EmptyEnrollment(NAME));
        }
        let (ubm, base) = self.ready()?;
        Ok(base.enroll(ubm, features, self.config.isv_enroll_iterations)?)
    }

    fn score(&self, model: &IsvModel, probe: &GmmStats) -> Result<f64, ToolError> {
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
    fn test_training_alias() {
        let config: IsvConfig = toml::from_str("jfa_training_iterations = 3\nnumber_of_gaussians = 4").unwrap();
        assert_eq!(config.isv_training_iterations, 3);
        assert_eq!(config.gmm.number_of_gaussians, 4);
        assert_eq!(config.subspace_dimension_of_u, 160);
    }

    #[test]
    fn test_enroller_needs_projector() {
        let mut tool = IsvTool::new(IsvConfig::default()).unwrap();
        let stats = GmmStats::new(2, 3);
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            tool.train_enroller(&TrainingSet::ByClient(vec![vec![stats.clone()]]), &dir.path().join("isv.fra")),
            Err(ToolError::NotReady { what: "projector", .. })
        ));
        assert!(matches!(
            tool.train_enroller(&TrainingSet::Flat(vec![stats]), &dir.path().join("isv.fra")),
            Err(ToolError::GroupingRequired(_))
        ));
    }

    #[test]
    fn test_rank_clamped() {
        let ubm = GmmMachine::new(2, 3);
        assert_eq!(clamp_rank("U", 160, &ubm), 6);
        assert_eq!(clamp_rank("U", 4, &ubm), 4);
    }
}
