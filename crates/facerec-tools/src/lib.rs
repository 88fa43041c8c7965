//! facerec-tools — Face recognition tools built on the facerec-core machines.
//!
//! Every algorithm family is wrapped in a [`Tool`] with the same lifecycle:
//! optional projector training and projection, optional enroller training,
//! enrollment of per-identity models and scoring of probes against models.
//! Tools are usually built from the TOML resources in [`config`].

pub mod bic;
pub mod config;
pub mod database;
pub mod gabor_jet;
pub mod gmm;
pub mod gmm_regular;
pub mod isv;
pub mod jfa;
pub mod lda;
pub mod lgbphs;
pub mod pca;
pub mod plda;
pub mod synthetic;
pub mod tool;
mod utils;

pub use config::{load_tool, load_tool_config, ConfigError, ConfiguredTool, ToolConfig};
pub use database::{load_database_config, DatabaseConfig};
pub use tool::{Capabilities, Stage, Tool, ToolError, TrainingSet};
