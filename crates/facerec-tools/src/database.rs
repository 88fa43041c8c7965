//! Database and protocol descriptors.

use crate::config::{read_override, ConfigError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DATABASE_RESOURCES: &[(&str, &str)] = &[(
    "lfw_view1_unrestricted",
    include_str!("../../../contrib/database/lfw_view1_unrestricted.toml"),
)];

/// Options passed to the database query of one experiment step.
pub type QueryOptions = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub name: String,
    pub protocol: String,
    pub img_input_dir: String,
    pub img_input_ext: String,
    #[serde(default)]
    pub all_files_options: QueryOptions,
    #[serde(default)]
    pub world_extractor_options: QueryOptions,
    #[serde(default)]
    pub world_projector_options: QueryOptions,
    #[serde(default)]
    pub world_enroller_options: QueryOptions,
    #[serde(default)]
    pub features_by_clients_options: QueryOptions,
}

impl DatabaseConfig {
    pub fn parse(name: &str, source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|source| ConfigError::Parse {
            name: name.to_string(),
            source,
        })
    }
}

/// Names of the embedded database resources.
pub fn database_resource_names() -> impl Iterator<Item = &'static str> {
    DATABASE_RESOURCES.iter().map(|(name, _)| *name)
}

/// Resolve a database resource by name.
pub fn load_database_config(name: &str) -> Result<DatabaseConfig, ConfigError> {
    if let Some(source) = read_override("database", name)? {
        return DatabaseConfig::parse(name, &source);
    }
    let (_, source) = DATABASE_RESOURCES
        .iter()
        .find(|(resource, _)| *resource == name)
        .ok_or_else(|| ConfigError::UnknownResource {
            kind: "database",
            name: name.to_string(),
        })?;
    DatabaseConfig::parse(name, source)
}
