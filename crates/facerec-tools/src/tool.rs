//! The lifecycle shared by all tools.

use facerec_core::{read_artifact, write_artifact, ArchiveError, Artifact, MachineError};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{tool} does not support {stage}")]
    StageNotSupported { tool: &'static str, stage: Stage },
    #[error("{tool}: the {what} is not loaded")]
    NotReady {
        tool: &'static str,
        what: &'static str,
    },
    #[error("{0}: empty training set")]
    EmptyTrainingSet(&'static str),
    #[error("{0}: training features must be grouped by client")]
    GroupingRequired(&'static str),
    #[error("{tool}: training group {index} is empty")]
    EmptyGroup { tool: &'static str, index: usize },
    #[error("{0}: enrollment needs at least one feature")]
    EmptyEnrollment(&'static str),
    #[error("{tool}: dimension mismatch, expected {expected}, got {got}")]
    DimensionMismatch {
        tool: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Lifecycle stages, used in error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    TrainProjector,
    LoadProjector,
    Project,
    TrainEnroller,
    LoadEnroller,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::TrainProjector => "train_projector",
            Stage::LoadProjector => "load_projector",
            Stage::Project => "project",
            Stage::TrainEnroller => "train_enroller",
            Stage::LoadEnroller => "load_enroller",
        };
        f.write_str(name)
    }
}

/// Which stages a tool needs. Fixed per tool type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub performs_projection: bool,
    pub requires_projector_training: bool,
    pub use_projected_features_for_enrollment: bool,
    pub split_training_features_by_client: bool,
    pub requires_enroller_training: bool,
}

impl Capabilities {
    /// A tool that only enrolls and scores.
    pub const fn plain() -> Self {
        Self {
            performs_projection: false,
            requires_projector_training: false,
            use_projected_features_for_enrollment: false,
            split_training_features_by_client: false,
            requires_enroller_training: false,
        }
    }
}

/// Training data, either pooled or grouped per client.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingSet<T> {
    Flat(Vec<T>),
    ByClient(Vec<Vec<T>>),
}

impl<T> TrainingSet<T> {
    pub fn is_empty(&self) -> bool {
        match self {
            TrainingSet::Flat(items) => items.is_empty(),
            TrainingSet::ByClient(groups) => groups.iter().all(Vec::is_empty),
        }
    }

    /// All items, ignoring any grouping.
    pub fn flatten(&self) -> Vec<&T> {
        match self {
            TrainingSet::Flat(items) => items.iter().collect(),
            TrainingSet::ByClient(groups) => groups.iter().flatten().collect(),
        }
    }

    /// The per-client groups; fails for a flat pool, an empty set or an
    /// empty group.
    pub fn by_client(&self, tool: &'static str) -> Result<&[Vec<T>], ToolError> {
        let TrainingSet::ByClient(groups) = self else {
            return Err(ToolError::GroupingRequired(tool));
        };
        if groups.is_empty() {
            return Err(ToolError::EmptyTrainingSet(tool));
        }
        if let Some(index) = groups.iter().position(Vec::is_empty) {
            return Err(ToolError::EmptyGroup { tool, index });
        }
        Ok(groups)
    }

    /// The flattened items; fails when there are none.
    pub(crate) fn non_empty(&self, tool: &'static str) -> Result<Vec<&T>, ToolError> {
        let items = self.flatten();
        if items.is_empty() {
            return Err(ToolError::EmptyTrainingSet(tool));
        }
        Ok(items)
    }
}

/// A face recognition algorithm with the train/project/enroll/score
/// lifecycle.
///
/// Stages a tool does not support keep their default implementation, which
/// reports [`ToolError::StageNotSupported`]. Payload types carry their own
/// archive layout; the `read_*`/`write_*` hooks can be overridden where a
/// tool has to check a payload against its loaded state.
pub trait Tool {
    /// What the extractor produces.
    type Feature: Artifact;
    /// Output of [`Tool::project`]; the feature itself for tools that do
    /// not project.
    type Projected: Artifact;
    /// What [`Tool::enroll`] and [`Tool::train_enroller`] consume.
    type EnrollInput: Artifact;
    type Model: Artifact;
    type Probe: Artifact;

    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    fn train_projector(
        &mut self,
        _training: &TrainingSet<Self::Feature>,
        _path: &Path,
    ) -> Result<(), ToolError> {
        Err(self.unsupported(Stage::TrainProjector))
    }

    fn load_projector(&mut self, _path: &Path) -> Result<(), ToolError> {
        Err(self.unsupported(Stage::LoadProjector))
    }

    fn project(&self, _feature: &Self::Feature) -> Result<Self::Projected, ToolError> {
        Err(self.unsupported(Stage::Project))
    }

    fn train_enroller(
        &mut self,
        _training: &TrainingSet<Self::EnrollInput>,
        _path: &Path,
    ) -> Result<(), ToolError> {
        Err(self.unsupported(Stage::TrainEnroller))
    }

    fn load_enroller(&mut self, _path: &Path) -> Result<(), ToolError> {
        Err(self.unsupported(Stage::LoadEnroller))
    }

    fn enroll(&self, features: &[Self::EnrollInput]) -> Result<Self::Model, ToolError>;

    fn score(&self, model: &Self::Model, probe: &Self::Probe) -> Result<f64, ToolError>;

    fn write_feature(&self, feature: &Self::Projected, path: &Path) -> Result<(), ToolError> {
        Ok(write_artifact(feature, path)?)
    }

    fn read_feature(&self, path: &Path) -> Result<Self::Projected, ToolError> {
        Ok(read_artifact(path)?)
    }

    fn read_probe(&self, path: &Path) -> Result<Self::Probe, ToolError> {
        Ok(read_artifact(path)?)
    }

    fn write_model(&self, model: &Self::Model, path: &Path) -> Result<(), ToolError> {
        Ok(write_artifact(model, path)?)
    }

    fn read_model(&self, path: &Path) -> Result<Self::Model, ToolError> {
        Ok(read_artifact(path)?)
    }

    #[doc(hidden)]
    fn unsupported(&self, stage: Stage) -> ToolError {
        ToolError::StageNotSupported {
            tool: self.name(),
            stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_client_requires_groups() {
        let flat = TrainingSet::Flat(vec![1, 2, 3]);
        assert!(matches!(flat.by_client("t"), Err(ToolError::GroupingRequired("t"))));
        assert_eq!(flat.flatten(), vec![&1, &2, &3]);

        let grouped = TrainingSet::ByClient(vec![vec![1], vec![], vec![2]]);
        assert!(matches!(
            grouped.by_client("t"),
            Err(ToolError::EmptyGroup { index: 1, .. })
        ));
        assert_eq!(grouped.flatten().len(), 2);
    }

    #[test]
    fn test_empty_training_set() {
        let empty: TrainingSet<u8> = TrainingSet::ByClient(vec![]);
        assert!(empty.is_empty());
        assert!(matches!(empty.by_client("t"), Err(ToolError::EmptyTrainingSet("t"))));
        assert!(TrainingSet::<u8>::Flat(vec![]).non_empty("t").is_err());
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::TrainEnroller.to_string(), "train_enroller");
    }
}
