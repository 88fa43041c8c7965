//! Universal background model GMM with MAP-adapted client models.
//!
//! The UBM is trained with k-means initialization followed by maximum
//! likelihood EM. Features are frame matrices (one row per block); the
//! projection computes their sufficient statistics against the UBM, and
//! client models are MAP adapted from raw frames.

use crate::tool::{Capabilities, Tool, ToolError, TrainingSet};
use crate::utils::{check_len, stack_frames};
use facerec_core::machine::{
    linear_scoring, GmmMachine, GmmStats, KMeansTrainer, MachineError, MapGmmTrainer,
    MlGmmTrainer,
};
use facerec_core::{read_artifact, write_artifact};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;

const NAME: &str = "ubm_gmm";

/// UBM training and MAP enrollment parameters shared by the GMM based
/// tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GmmParameters {
    pub number_of_gaussians: usize,
    pub k_means_training_iterations: usize,
    pub gmm_training_iterations: usize,
    /// Relative change that ends k-means and EM training early.
    pub training_threshold: f64,
    /// Floor for every variance of the UBM.
    pub variance_threshold: f64,
    /// Scale every dimension to unit variance before k-means.
    pub normalize_before_k_means: bool,
    pub relevance_factor: f64,
    pub gmm_enroll_iterations: usize,
    pub init_seed: u64,
}

impl Default for GmmParameters {
    fn default() -> Self {
        Self {
            number_of_gaussians: 512,
            k_means_training_iterations: 500,
            gmm_training_iterations: 500,
            training_threshold: 5e-4,
            variance_threshold: 5e-4,
            normalize_before_k_means: true,
            relevance_factor: 4.0,
            gmm_enroll_iterations: 1,
            init_seed: 5489,
        }
    }
}

impl GmmParameters {
    pub const OPTIONS: &'static [&'static str] = &[
        "number_of_gaussians",
        "k_means_training_iterations",
        "gmm_training_iterations",
        "training_threshold",
        "variance_threshold",
        "normalize_before_k_means",
        "relevance_factor",
        "gmm_enroll_iterations",
        "init_seed",
    ];

    /// Reduced parameters: the given number of Gaussians, one k-means and
    /// one EM iteration.
    pub fn reduced(number_of_gaussians: usize) -> Self {
        Self {
            number_of_gaussians,
            k_means_training_iterations: 1,
            gmm_training_iterations: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ToolError> {
        if self.number_of_gaussians == 0 {
            return Err(ToolError::InvalidConfig(
                "number_of_gaussians must be positive".to_string(),
            ));
        }
        if self.relevance_factor <= 0.0 {
            return Err(ToolError::InvalidConfig(format!(
                "relevance_factor must be positive, got {}",
                self.relevance_factor
            )));
        }
        if self.variance_threshold.is_nan() || self.variance_threshold <= 0.0 {
            return Err(ToolError::InvalidConfig(format!(
                "variance_threshold must be positive, got {}",
                self.variance_threshold
            )));
        }
        Ok(())
    }
}

/// Train a UBM on the stacked frames of all training features.
pub fn train_ubm(params: &GmmParameters, tool: &'static str, features: &[&Array2<f64>]) -> Result<GmmMachine, ToolError> {
    params.validate()?;
    if features.is_empty() {
        return Err(ToolError::EmptyTrainingSet(tool));
    }
    let data = stack_frames(tool, features)?;
    if data.nrows() < params.number_of_gaussians {
        return Err(ToolError::InvalidConfig(format!(
            "{tool}: {} frames cannot initialize {} Gaussians",
            data.nrows(),
            params.number_of_gaussians
        )));
    }

    let (mean, std) = if params.normalize_before_k_means {
        frame_normalization(&data)
    } else {
        (Array1::zeros(data.ncols()), Array1::ones(data.ncols()))
    };
    let normalized = (&data - &mean.view().insert_axis(Axis(0))) / &std.view().insert_axis(Axis(0));

    let kmeans = KMeansTrainer {
        max_iterations: params.k_means_training_iterations,
        convergence_threshold: params.training_threshold,
        seed: params.init_seed,
    }
    .train(&normalized, params.number_of_gaussians)?;
    let (variances, weights) = kmeans.variances_and_weights(&normalized)?;

    let mut ubm = GmmMachine::new(params.number_of_gaussians, data.ncols());
    ubm.set_variance_thresholds(params.variance_threshold);
    ubm.set_means(&kmeans.means * &std.view().insert_axis(Axis(0)) + &mean.view().insert_axis(Axis(0)))?;
    ubm.set_variances(variances * &std.mapv(|s| s * s).view().insert_axis(Axis(0)))?;
    ubm.set_weights(weights)?;
    tracing::debug!(frames = data.nrows(), gaussians = params.number_of_gaussians, "k-means done");

    MlGmmTrainer {
        max_iterations: params.gmm_training_iterations,
        convergence_threshold: params.training_threshold,
        update_means: true,
        update_variances: true,
        update_weights: true,
    }
    .train(&mut ubm, &data)?;
    if ubm.variances().iter().chain(ubm.means().iter()).any(|v| !v.is_finite())
        || ubm.variances().iter().any(|&v| v <= 0.0)
    {
        return Err(MachineError::InvalidParameter(format!("{tool}: trained UBM is degenerate")).into());
    }
    tracing::info!(
        tool,
        frames = data.nrows(),
        inputs = data.ncols(),
        gaussians = params.number_of_gaussians,
        "UBM trained"
    );
    Ok(ubm)
}

/// Per-dimension mean and standard deviation; constant dimensions keep a
/// unit scale.
fn frame_normalization(data: &Array2<f64>) -> (Array1<f64>, Array1<f64>) {
    let n = data.nrows() as f64;
    let mean = data.sum_axis(Axis(0)) / n;
    let squares = data.mapv(|v| v * v).sum_axis(Axis(0)) / n;
    let std = (squares - mean.mapv(|m| m * m)).mapv(|v| {
        let s = v.max(0.0).sqrt();
        if s > 0.0 {
            s
        } else {
            1.0
        }
    });
    (mean, std)
}

/// MAP adaptation of the UBM means to the frames of one client.
pub fn map_enroll(
    params: &GmmParameters,
    tool: &'static str,
    ubm: &GmmMachine,
    features: &[Array2<f64>],
) -> Result<GmmMachine, ToolError> {
    if features.is_empty() {
        return Err(ToolError::EmptyEnrollment(tool));
    }
    let frames = stack_frames(tool, &features.iter().collect::<Vec<_>>())?;
    check_len(tool, ubm.n_inputs(), frames.ncols())?;
    let model = MapGmmTrainer {
        relevance_factor: params.relevance_factor,
        max_iterations: params.gmm_enroll_iterations.max(1),
        update_means: true,
        update_variances: false,
        update_weights: false,
    }
    .adapt(ubm, &frames)?;
    tracing::debug!(tool, frames = frames.nrows(), "client GMM adapted");
    Ok(model)
}

/// Read a UBM, checking it against the configured number of Gaussians.
pub(crate) fn read_ubm(params: &GmmParameters, tool: &'static str, path: &Path) -> Result<GmmMachine, ToolError> {
    let ubm: GmmMachine = read_artifact(path)?;
    check_len(tool, params.number_of_gaussians, ubm.n_gaussians())?;
    Ok(ubm)
}

/// Statistics of `feature` against the UBM.
pub(crate) fn project_stats(tool: &'static str, ubm: Option<&GmmMachine>, feature: &Array2<f64>) -> Result<GmmStats, ToolError> {
    let ubm = ubm.ok_or(ToolError::NotReady {
        tool,
        what: "projector",
    })?;
    check_len(tool, ubm.n_inputs(), feature.ncols())?;
    Ok(ubm.statistics(feature)?)
}

/// Read statistics, checking their shape against the loaded UBM.
pub(crate) fn read_stats(tool: &'static str, ubm: Option<&GmmMachine>, path: &Path) -> Result<GmmStats, ToolError> {
    let stats: GmmStats = read_artifact(path)?;
    if let Some(ubm) = ubm {
        check_len(tool, ubm.n_gaussians(), stats.n_gaussians())?;
        check_len(tool, ubm.n_inputs(), stats.n_inputs())?;
    }
    Ok(stats)
}

#[derive(Debug, Clone)]
pub struct UbmGmmTool {
    params: GmmParameters,
    ubm: Option<GmmMachine>,
}

impl UbmGmmTool {
    pub fn new(params: GmmParameters) -> Result<Self, ToolError> {
        params.validate()?;
        Ok(Self { params, ubm: None })
    }

    pub fn ubm(&self) -> Option<&GmmMachine> {
        self.ubm.as_ref()
    }

    fn require_ubm(&self) -> Result<&GmmMachine, ToolError> {
        self.ubm.as_ref().ok_or(ToolError::NotReady {
            tool: NAME,
            what: "projector",
        })
    }
}

impl Tool for UbmGmmTool {
    type Feature = Array2<f64>;
    type Projected = GmmStats;
    type EnrollInput = Array2<f64>;
    type Model = GmmMachine;
    type Probe = GmmStats;

    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            performs_projection: true,
            requires_projector_training: true,
            ..Capabilities::plain()
        }
    }

    fn train_projector(&mut self, training: &TrainingSet<Array2<f64>>, path: &Path) -> Result<(), ToolError> {
        let ubm = train_ubm(&self.params, NAME, &training.non_empty(NAME)?)?;
        write_artifact(&ubm, path)?;
        self.ubm = Some(ubm);
        Ok(())
    }

    fn load_projector(&mut self, path: &Path) -> Result<(), ToolError> {
        self.ubm = Some(read_ubm(&self.params, NAME, path)?);
        Ok(())
    }

    fn project(&self, feature: &Array2<f64>) -> Result<GmmStats, ToolError> {
        project_stats(NAME, self.ubm.as_ref(), feature)
    }

    /// Models are adapted from raw frames, not from projected statistics.
    fn enroll(&self, features: &[Array2<f64>]) -> Result<GmmMachine, ToolError> {
        map_enroll(&self.params, NAME, self.require_ubm()?, features)
    }

    fn score(&self, model: &GmmMachine, probe: &GmmStats) -> Result<f64, ToolError> {
        let ubm = self.require_ubm()?;
        Ok(linear_scoring(model.means(), ubm, probe, None, true)?)
    }

    fn read_probe(&self, path: &Path) -> Result<GmmStats, ToolError> {
        read_stats(NAME, self.ubm.as_ref(), path)
    }

    fn read_feature(&self, path: &Path) -> Result<GmmStats, ToolError> {
        read_stats(NAME, self.ubm.as_ref(), path)
    }
}
