//! UBM-GMM with regular scoring: the UBM is trained as the enroller and
//! probes are raw frames scored by their average log-likelihood ratio.

use crate::gmm::{map_enroll, read_ubm, train_ubm, GmmParameters};
use crate::tool::{Capabilities, Tool, ToolError, TrainingSet};
use crate::utils::check_len;
use facerec_core::machine::GmmMachine;
use facerec_core::write_artifact;
use ndarray::Array2;
use std::path::Path;

const NAME: &str = "ubm_gmm_regular";

#[derive(Debug, Clone)]
pub struct UbmGmmRegularTool {
    params: GmmParameters,
    ubm: Option<GmmMachine>,
}

impl UbmGmmRegularTool {
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
            what: "enroller",
        })
    }
}

impl Tool for UbmGmmRegularTool {
    type Feature = Array2<f64>;
    type Projected = Array2<f64>;
    type EnrollInput = Array2<f64>;
    type Model = GmmMachine;
    type Probe = Array2<f64>;

    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            requires_enroller_training: true,
            ..Capabilities::plain()
        }
    }

    /// Grouping is ignored; the UBM sees all frames.
    fn train_enroller(&mut self, training: &TrainingSet<Array2<f64>>, path: &Path) -> Result<(), ToolError> {
        let ubm = train_ubm(&self.params, NAME, &training.non_empty(NAME)?)?;
        write_artifact(&ubm, path)?;
        self.ubm = Some(ubm);
        Ok(())
    }

    fn load_enroller(&mut self, path: &Path) -> Result<(), ToolError> {
        self.ubm = Some(read_ubm(&self.params, NAME, path)?);
        Ok(())
    }

    fn enroll(&self, features: &[Array2<f64>]) -> Result<GmmMachine, ToolError> {
        map_enroll(&self.params, NAME, self.require_ubm()?, features)
    }

    /// Mean over the probe frames of `ln p(x | model) - ln p(x | UBM)`.
    fn score(&self, model: &GmmMachine, probe: &Array2<f64>) -> Result<f64, ToolError> {
        let ubm = self.require_ubm()?;
        check_len(NAME, ubm.n_inputs(), model.n_inputs())?;
        check_len(NAME, ubm.n_inputs(), probe.ncols())?;
        if probe.nrows() == 0 {
            return Err(ToolError::InvalidConfig(format!("{NAME}: probe has no frames")));
        }
        let mut total = 0.0;
        for frame in probe.rows() {
            total += model.log_likelihood(frame)? - ubm.log_likelihood(frame)?;
        }
        Ok(total / probe.nrows() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_flags_and_stages() {
        let mut tool = UbmGmmRegularTool::new(GmmParameters::reduced(2)).unwrap();
        let caps = tool.capabilities();
        assert!(!caps.performs_projection && caps.requires_enroller_training);
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            tool.train_projector(&TrainingSet::Flat(vec![]), &dir.path().join("x.fra")),
            Err(ToolError::StageNotSupported { .. })
        ));
        assert!(matches!(
            tool.enroll(&[array![[1.0, 2.0]]]),
            Err(ToolError::NotReady { .. })
        ));
    }

    #[test]
    fn test_ubm_model_scores_zero() {
        let frames = Array2::from_shape_fn((20, 2), |(i, k)| ((i * 5 + k * 3) as f64 * 0.61).sin() * 3.0);
        let dir = tempfile::tempdir().unwrap();
        let mut tool = UbmGmmRegularTool::new(GmmParameters::reduced(2)).unwrap();
        tool.train_enroller(&TrainingSet::ByClient(vec![vec![frames.clone()]]), &dir.path().join("ubm.fra"))
            .unwrap();
        let ubm = tool.ubm().unwrap().clone();
        assert_eq!(tool.score(&ubm, &frames).unwrap(), 0.0);
    }
}
