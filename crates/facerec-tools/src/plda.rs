//! Probabilistic LDA, optionally on PCA-reduced features.

use crate::tool::{Capabilities, Tool, ToolError, TrainingSet};
use crate::utils::{check_len, stack_vectors};
use facerec_core::machine::{LinearMachine, PldaBase, PldaModel, PldaTrainer};
use facerec_core::{Archive, Artifact};
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};
use std::path::Path;

const NAME: &str = "plda";

const PCA_GROUP: &str = "/pca";
const PLDA_GROUP: &str = "/plda";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PldaConfig {
    pub subspace_dimension_of_f: usize,
    pub subspace_dimension_of_g: usize,
    /// Dimensions of the PCA applied first; `None` trains on raw features.
    pub subspace_dimension_pca: Option<usize>,
    pub plda_training_iterations: usize,
    /// Floor for the residual variances `sigma`.
    pub variance_threshold: f64,
}

impl Default for PldaConfig {
    fn default() -> Self {
        Self {
            subspace_dimension_of_f: 5,
            subspace_dimension_of_g: 10,
            subspace_dimension_pca: None,
            plda_training_iterations: 200,
            variance_threshold: 1e-5,
        }
    }
}

impl PldaConfig {
    pub const OPTIONS: &'static [&'static str] = &[
        "subspace_dimension_of_f",
        "subspace_dimension_of_g",
        "subspace_dimension_pca",
        "plda_training_iterations",
        "variance_threshold",
    ];
}

#[derive(Debug, Clone)]
pub struct PldaTool {
    config: PldaConfig,
    pca: Option<LinearMachine>,
    base: Option<PldaBase>,
}

impl PldaTool {
    pub fn new(config: PldaConfig) -> Result<Self, ToolError> {
        if config.subspace_dimension_of_f == 0 || config.subspace_dimension_of_g == 0 {
            return Err(ToolError::InvalidConfig(
                "PLDA subspace dimensions must be positive".to_string(),
            ));
        }
        if config.subspace_dimension_pca == Some(0) {
            return Err(ToolError::InvalidConfig(
                "subspace_dimension_pca must be positive".to_string(),
            ));
        }
        Ok(Self {
            config,
            pca: None,
            base: None,
        })
    }

    pub fn base(&self) -> Option<&PldaBase> {
        self.base.as_ref()
    }

    pub fn pca(&self) -> Option<&LinearMachine> {
        self.pca.as_ref()
    }

    fn require_base(&self) -> Result<&PldaBase, ToolError> {
        self.base.as_ref().ok_or(ToolError::NotReady {
            tool: NAME,
            what: "enroller",
        })
    }

    /// Apply the PCA, if any, to the rows of `data`.
    fn reduce(pca: Option<&LinearMachine>, data: Array2<f64>) -> Result<Array2<f64>, ToolError> {
        match pca {
            Some(pca) => {
                check_len(NAME, pca.input_size(), data.ncols())?;
                Ok(pca.forward_rows(&data)?)
            }
            None => Ok(data),
        }
    }

    fn train_pca(&self, groups: &[Vec<Array1<f64>>]) -> Result<Option<LinearMachine>, ToolError> {
        let Some(requested) = self.config.subspace_dimension_pca else {
            return Ok(None);
        };
        let all = stack_vectors(NAME, &groups.iter().flatten().collect::<Vec<_>>())?;
        let (mut pca, eigenvalues) = LinearMachine::train_pca(&all)?;
        let kept = if requested > eigenvalues.len() {
            tracing::warn!(requested, available = eigenvalues.len(), "PCA dimension clamped");
            eigenvalues.len()
        } else {
            requested
        };
        pca.truncate_outputs(kept);
        tracing::debug!(samples = all.nrows(), outputs = kept, kept_variance = eigenvalues.slice(s![..kept]).sum(), "PLDA PCA trained");
        Ok(Some(pca))
    }
}

impl Tool for PldaTool {
    type Feature = Array1<f64>;
    type Projected = Array1<f64>;
    type EnrollInput = Array1<f64>;
    type Model = PldaModel;
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
        let pca = self.train_pca(groups)?;
        let classes = groups
            .iter()
            .map(|group| Self::reduce(pca.as_ref(), stack_vectors(NAME, &group.iter().collect::<Vec<_>>())?))
            .collect::<Result<Vec<_>, _>>()?;

        let base = PldaTrainer {
            iterations: self.config.plda_training_iterations,
            variance_threshold: self.config.variance_threshold,
        }
        .train(
            &classes,
            self.config.subspace_dimension_of_f,
            self.config.subspace_dimension_of_g,
        )?;

        let mut archive = Archive::new();
        if let Some(pca) = &pca {
            archive.create_group(PCA_GROUP)?;
            archive.cd(PCA_GROUP)?;
            pca.save(&mut archive)?;
        }
        archive.create_group(PLDA_GROUP)?;
        archive.cd(PLDA_GROUP)?;
        base.save(&mut archive)?;
        archive.write(path)?;
        tracing::info!(
            clients = groups.len(),
            dim_d = base.dim_d(),
            dim_f = base.dim_f(),
            dim_g = base.dim_g(),
            pca = pca.is_some(),
            path = %path.display(),
            "PLDA enroller trained"
        );

        self.pca = pca;
        self.base = Some(base);
        Ok(())
    }

    fn load_enroller(&mut self, path: &Path) -> Result<(), ToolError> {
        let archive = Archive::read(path)?;
        let pca = if archive.contains(PCA_GROUP) {
            Some(LinearMachine::load(&archive.subtree(PCA_GROUP)?)?)
        } else {
            None
        };
        if pca.is_some() != self.config.subspace_dimension_pca.is_some() {
            return Err(ToolError::InvalidConfig(format!(
                "{}: PCA group presence does not match subspace_dimension_pca",
                path.display()
            )));
        }
        let base = PldaBase::load(&archive.subtree(PLDA_GROUP)?)?;
        if let Some(pca) = &pca {
            check_len(NAME, pca.output_size(), base.dim_d())?;
        }
        self.pca = pca;
        self.base = Some(base);
        Ok(())
    }

    fn enroll(&self, features: &[Array1<f64>]) -> Result<PldaModel, ToolError> {
        if features.is_empty() {
            return Err(ToolError::EmptyEnrollment(NAME));
        }
        let base = self.require_base()?;
        let samples = Self::reduce(self.pca.as_ref(), stack_vectors(NAME, &features.iter().collect::<Vec<_>>())?)?;
        Ok(base.enroll(&samples)?)
    }

    fn score(&self, model: &PldaModel, probe: &Array1<f64>) -> Result<f64, ToolError> {
        let base = self.require_base()?;
        let probe = match &self.pca {
            Some(pca) => {
                check_len(NAME, pca.input_size(), probe.len())?;
                pca.forward(probe.view())?
            }
            None => probe.clone(),
        };
        Ok(base.score(model, probe.view())?)
    }
}
