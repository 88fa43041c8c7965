//! Local Gabor binary pattern histogram sequences.

use crate::tool::{Capabilities, Tool, ToolError};
use facerec_core::{Histogram, HistogramMeasure};
use serde::{Deserialize, Serialize};

const NAME: &str = "lgbphs";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LgbphsConfig {
    pub distance_function: HistogramMeasure,
    /// Negate the measure; defaults to whether the measure is a distance.
    pub is_distance_function: Option<bool>,
}

impl Default for LgbphsConfig {
    fn default() -> Self {
        Self {
            distance_function: HistogramMeasure::HistogramIntersection,
            is_distance_function: None,
        }
    }
}

impl LgbphsConfig {
    pub const OPTIONS: &'static [&'static str] = &["distance_function", "is_distance_function"];
}

#[derive(Debug, Clone)]
pub struct LgbphsTool {
    measure: HistogramMeasure,
    negate: bool,
}

impl LgbphsTool {
    pub fn new(config: LgbphsConfig) -> Self {
        Self {
            measure: config.distance_function,
            negate: config
                .is_distance_function
                .unwrap_or_else(|| config.distance_function.is_distance()),
        }
    }
}

impl Tool for LgbphsTool {
    type Feature = Histogram;
    type Projected = Histogram;
    type EnrollInput = Histogram;
    type Model = Vec<Histogram>;
    type Probe = Histogram;

    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::plain()
    }

    fn enroll(&self, features: &[Histogram]) -> Result<Vec<Histogram>, ToolError> {
        if features.is_empty() {
            return Err(ToolError::EmptyEnrollment(NAME));
        }
        Ok(features.to_vec())
    }

    /// Mean measure over the model histograms.
    fn score(&self, model: &Vec<Histogram>, probe: &Histogram) -> Result<f64, ToolError> {
        if model.is_empty() {
            return Err(ToolError::EmptyEnrollment(NAME));
        }
        let total: f64 = model.iter().map(|h| self.measure.evaluate(h, probe)).sum();
        let mean = total / model.len() as f64;
        Ok(if self.negate { -mean } else { mean })
    }
}
