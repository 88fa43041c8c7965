//! Elastic graph matching with Gabor jets.

use crate::tool::{Capabilities, Tool, ToolError};
use crate::utils::check_len;
use facerec_core::{JetGraph, JetSimilarity};
use serde::{Deserialize, Serialize};

const NAME: &str = "gabor_jet";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaborJetConfig {
    pub gabor_jet_similarity_type: JetSimilarity,
}

impl Default for GaborJetConfig {
    fn default() -> Self {
        Self {
            gabor_jet_similarity_type: JetSimilarity::ScalarProduct,
        }
    }
}

impl GaborJetConfig {
    pub const OPTIONS: &'static [&'static str] = &["gabor_jet_similarity_type"];
}

#[derive(Debug, Clone)]
pub struct GaborJetTool {
    similarity: JetSimilarity,
}

impl GaborJetTool {
    pub fn new(config: GaborJetConfig) -> Self {
        Self {
            similarity: config.gabor_jet_similarity_type,
        }
    }

    fn check_graph(&self, reference: &JetGraph, graph: &JetGraph) -> Result<(), ToolError> {
        check_len(NAME, reference.n_nodes(), graph.n_nodes())?;
        check_len(NAME, reference.jet_length(), graph.jet_length())?;
        if self.similarity.needs_phases() && graph.phase.is_none() {
            return Err(ToolError::InvalidConfig(format!(
                "{NAME}: {:?} similarity needs graphs with phases",
                self.similarity
            )));
        }
        Ok(())
    }
}

impl Tool for GaborJetTool {
    type Feature = JetGraph;
    type Projected = JetGraph;
    type EnrollInput = JetGraph;
    type Model = Vec<JetGraph>;
    type Probe = JetGraph;

    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::plain()
    }

    fn enroll(&self, features: &[JetGraph]) -> Result<Vec<JetGraph>, ToolError> {
        let Some(first) = features.first() else {
            return Err(ToolError::EmptyEnrollment(NAME));
        };
        for graph in features {
            self.check_graph(first, graph)?;
        }
        Ok(features.to_vec())
    }

    /// For every node the best similarity over the model graphs, averaged
    /// over the nodes.
    fn score(&self, model: &Vec<JetGraph>, probe: &JetGraph) -> Result<f64, ToolError> {
        let Some(first) = model.first() else {
            return Err(ToolError::EmptyEnrollment(NAME));
        };
        self.check_graph(first, probe)?;
        let nodes = probe.n_nodes();
        if nodes == 0 {
            return Ok(0.0);
        }
        let mut total = 0.0;
        for node in 0..nodes {
            let mut best = f64::NEG_INFINITY;
            for graph in model {
                best = best.max(self.similarity.node_similarity(graph, probe, node)?);
            }
            total += best;
        }
        Ok(total / nodes as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn graph(scale: f64) -> JetGraph {
        JetGraph::new(
            array![[1.0, 2.0 * scale], [0.5, 1.0]],
            Some(array![[0.0, 1.0], [2.0, -1.0]]),
        )
        .unwrap()
    }

    #[test]
    fn test_best_model_graph_per_node() {
        let tool = GaborJetTool::new(GaborJetConfig {
            gabor_jet_similarity_type: JetSimilarity::Canberra,
        });
        let model = tool.enroll(&[graph(3.0), graph(1.0)]).unwrap();
        assert!((tool.score(&model, &graph(1.0)).unwrap() - 1.0).abs() < 1e-12);
        let single = tool.enroll(&[graph(3.0)]).unwrap();
        assert!(tool.score(&single, &graph(1.0)).unwrap() < 1.0);
    }

    #[test]
    fn test_phase_similarity_rejects_graphs_without_phase() {
        let tool = GaborJetTool::new(GaborJetConfig {
            gabor_jet_similarity_type: JetSimilarity::PhaseDiff,
        });
        let bare = JetGraph::new(array![[1.0, 2.0], [0.5, 1.0]], None).unwrap();
        assert!(matches!(tool.enroll(&[bare]), Err(ToolError::InvalidConfig(_))));
        assert!(matches!(tool.enroll(&[]), Err(ToolError::EmptyEnrollment(_))));
    }
}
