//! Tool configuration resources.
//!
//! A resource is a TOML file naming the tool (`tool = "pca"`) and its
//! options. The standard resources are embedded at compile time from
//! `contrib/tools/*.toml`; a file `tools/<name>.toml` below the directory
//! named by `FACEREC_RESOURCE_DIR` takes precedence over an embedded one.

use crate::bic::{BicConfig, BicTool};
use crate::gabor_jet::{GaborJetConfig, GaborJetTool};
use crate::gmm::{GmmParameters, UbmGmmTool};
use crate::gmm_regular::UbmGmmRegularTool;
use crate::isv::{IsvConfig, IsvTool};
use crate::jfa::{JfaConfig, JfaTool};
use crate::lda::{LdaConfig, LdaTool};
use crate::lgbphs::{LgbphsConfig, LgbphsTool};
use crate::pca::{PcaConfig, PcaTool};
use crate::plda::{PldaConfig, PldaTool};
use crate::tool::{Capabilities, Tool, ToolError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Environment variable naming an extra resource directory.
pub const RESOURCE_DIR_ENV: &str = "FACEREC_RESOURCE_DIR";

const TOOL_RESOURCES: &[(&str, &str)] = &[
    ("gabor-jet", include_str!("../../../contrib/tools/gabor-jet.toml")),
    ("lgbphs", include_str!("../../../contrib/tools/lgbphs.toml")),
    ("pca", include_str!("../../../contrib/tools/pca.toml")),
    ("lda", include_str!("../../../contrib/tools/lda.toml")),
    ("pca+lda", include_str!("../../../contrib/tools/pca+lda.toml")),
    ("bic", include_str!("../../../contrib/tools/bic.toml")),
    ("iec", include_str!("../../../contrib/tools/iec.toml")),
    ("gmm", include_str!("../../../contrib/tools/gmm.toml")),
    (
        "ubm_gmm_regular_scoring",
        include_str!("../../../contrib/tools/ubm_gmm_regular_scoring.toml"),
    ),
    ("isv", include_str!("../../../contrib/tools/isv.toml")),
    ("jfa", include_str!("../../../contrib/tools/jfa.toml")),
    ("pca+plda", include_str!("../../../contrib/tools/pca+plda.toml")),
];

static EMBEDDED_TOOLS: OnceLock<BTreeMap<&'static str, ToolConfig>> = OnceLock::new();

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown {kind} resource: {name}")]
    UnknownResource { kind: &'static str, name: String },
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("resource {name} is not valid TOML: {source}")]
    Parse {
        name: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("resource {0} does not name a tool")]
    MissingTool(String),
    #[error("resource {name} names unknown tool {tool}")]
    UnknownTool { name: String, tool: String },
    #[error("resource {name}: unknown option {option} for tool {tool}")]
    UnknownOption {
        name: String,
        tool: &'static str,
        option: String,
    },
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Parsed configuration of one tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolConfig {
    GaborJet(GaborJetConfig),
    Lgbphs(LgbphsConfig),
    Pca(PcaConfig),
    Lda(LdaConfig),
    Bic(BicConfig),
    UbmGmm(GmmParameters),
    UbmGmmRegular(GmmParameters),
    Isv(IsvConfig),
    Jfa(JfaConfig),
    Plda(PldaConfig),
}

impl ToolConfig {
    /// Parse a resource. `name` is only used in error messages.
    pub fn parse(name: &str, source: &str) -> Result<Self, ConfigError> {
        let parse_err = |source| ConfigError::Parse {
            name: name.to_string(),
            source,
        };
        let mut table: toml::Table = toml::from_str(source).map_err(parse_err)?;
        let tool = match table.remove("tool") {
            Some(toml::Value::String(tool)) => tool,
            _ => return Err(ConfigError::MissingTool(name.to_string())),
        };

        let gmm = GmmParameters::OPTIONS;
        let config = match tool.as_str() {
            "gabor_jet" => ToolConfig::GaborJet(options(name, "gabor_jet", table, &[GaborJetConfig::OPTIONS])?),
            "lgbphs" => ToolConfig::Lgbphs(options(name, "lgbphs", table, &[LgbphsConfig::OPTIONS])?),
            "pca" => ToolConfig::Pca(options(name, "pca", table, &[PcaConfig::OPTIONS])?),
            "lda" => ToolConfig::Lda(options(name, "lda", table, &[LdaConfig::OPTIONS])?),
            "bic" => ToolConfig::Bic(options(name, "bic", table, &[BicConfig::OPTIONS])?),
            "ubm_gmm" => ToolConfig::UbmGmm(options(name, "ubm_gmm", table, &[gmm])?),
            "ubm_gmm_regular" => ToolConfig::UbmGmmRegular(options(name, "ubm_gmm_regular", table, &[gmm])?),
            "isv" => ToolConfig::Isv(options(name, "isv", table, &[gmm, IsvConfig::OPTIONS])?),
            "jfa" => ToolConfig::Jfa(options(name, "jfa", table, &[gmm, JfaConfig::OPTIONS])?),
            "plda" => ToolConfig::Plda(options(name, "plda", table, &[PldaConfig::OPTIONS])?),
            _ => {
                return Err(ConfigError::UnknownTool {
                    name: name.to_string(),
                    tool,
                })
            }
        };
        Ok(config)
    }

    /// Construct the configured tool.
    pub fn build(self) -> Result<ConfiguredTool, ToolError> {
        Ok(match self {
            ToolConfig::GaborJet(c) => ConfiguredTool::GaborJet(GaborJetTool::new(c)),
            ToolConfig::Lgbphs(c) => ConfiguredTool::Lgbphs(LgbphsTool::new(c)),
            ToolConfig::Pca(c) => ConfiguredTool::Pca(PcaTool::new(c)?),
            ToolConfig::Lda(c) => ConfiguredTool::Lda(LdaTool::new(c)?),
            ToolConfig::Bic(c) => ConfiguredTool::Bic(BicTool::new(c)?),
            ToolConfig::UbmGmm(c) => ConfiguredTool::UbmGmm(UbmGmmTool::new(c)?),
            ToolConfig::UbmGmmRegular(c) => ConfiguredTool::UbmGmmRegular(UbmGmmRegularTool::new(c)?),
            ToolConfig::Isv(c) => ConfiguredTool::Isv(IsvTool::new(c)?),
            ToolConfig::Jfa(c) => ConfiguredTool::Jfa(JfaTool::new(c)?),
            ToolConfig::Plda(c) => ConfiguredTool::Plda(PldaTool::new(c)?),
        })
    }
}

/// Reject unknown keys, then deserialize the remaining table.
fn options<T: DeserializeOwned>(
    name: &str,
    tool: &'static str,
    table: toml::Table,
    allowed: &[&[&str]],
) -> Result<T, ConfigError> {
    if let Some(option) = table
        .keys()
        .find(|key| !allowed.iter().any(|set| set.contains(&key.as_str())))
    {
        return Err(ConfigError::UnknownOption {
            name: name.to_string(),
            tool,
            option: option.clone(),
        });
    }
    toml::Value::Table(table)
        .try_into()
        .map_err(|source| ConfigError::Parse {
            name: name.to_string(),
            source,
        })
}

/// A tool built from a configuration resource.
#[derive(Debug, Clone)]
pub enum ConfiguredTool {
    GaborJet(GaborJetTool),
    Lgbphs(LgbphsTool),
    Pca(PcaTool),
    Lda(LdaTool),
    Bic(BicTool),
    UbmGmm(UbmGmmTool),
    UbmGmmRegular(UbmGmmRegularTool),
    Isv(IsvTool),
    Jfa(JfaTool),
    Plda(PldaTool),
}

impl ConfiguredTool {
    pub fn name(&self) -> &'static str {
        match self {
            ConfiguredTool::GaborJet(t) => t.name(),
            ConfiguredTool::Lgbphs(t) => t.name(),
            ConfiguredTool::Pca(t) => t.name(),
            ConfiguredTool::Lda(t) => t.name(),
            ConfiguredTool::Bic(t) => t.name(),
            ConfiguredTool::UbmGmm(t) => t.name(),
            ConfiguredTool::UbmGmmRegular(t) => t.name(),
            ConfiguredTool::Isv(t) => t.name(),
            ConfiguredTool::Jfa(t) => t.name(),
            ConfiguredTool::Plda(t) => t.name(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            ConfiguredTool::GaborJet(t) => t.capabilities(),
            ConfiguredTool::Lgbphs(t) => t.capabilities(),
            ConfiguredTool::Pca(t) => t.capabilities(),
            ConfiguredTool::Lda(t) => t.capabilities(),
            ConfiguredTool::Bic(t) => t.capabilities(),
            ConfiguredTool::UbmGmm(t) => t.capabilities(),
            ConfiguredTool::UbmGmmRegular(t) => t.capabilities(),
            ConfiguredTool::Isv(t) => t.capabilities(),
            ConfiguredTool::Jfa(t) => t.capabilities(),
            ConfiguredTool::Plda(t) => t.capabilities(),
        }
    }
}

/// Names of the embedded tool resources.
pub fn tool_resource_names() -> impl Iterator<Item = &'static str> {
    TOOL_RESOURCES.iter().map(|(name, _)| *name)
}

fn embedded_tools() -> &'static BTreeMap<&'static str, ToolConfig> {
    EMBEDDED_TOOLS.get_or_init(|| {
        let mut tools = BTreeMap::new();
        for (name, source) in TOOL_RESOURCES {
            match ToolConfig::parse(name, source) {
                Ok(config) => {
                    tools.insert(*name, config);
                }
                Err(e) => tracing::warn!(resource = name, error = %e, "bad embedded tool resource"),
            }
        }
        tools
    })
}

/// Directory from `FACEREC_RESOURCE_DIR`, if set.
pub fn resource_dir() -> Option<PathBuf> {
    std::env::var_os(RESOURCE_DIR_ENV).map(PathBuf::from)
}

/// Read `<dir>/<kind>/<name>.toml` below the resource directory, if present.
pub(crate) fn read_override(kind: &str, name: &str) -> Result<Option<String>, ConfigError> {
    let Some(dir) = resource_dir() else {
        return Ok(None);
    };
    let path = dir.join(kind).join(format!("{name}.toml"));
    if !path.is_file() {
        return Ok(None);
    }
    tracing::debug!(path = %path.display(), "using resource override");
    std::fs::read_to_string(&path)
        .map(Some)
        .map_err(|source| ConfigError::Io { path, source })
}

/// Resolve a tool resource by name.
pub fn load_tool_config(name: &str) -> Result<ToolConfig, ConfigError> {
    if let Some(source) = read_override("tools", name)? {
        return ToolConfig::parse(name, &source);
    }
    embedded_tools()
        .get(name)
        .cloned()
        .ok_or_else(|| ConfigError::UnknownResource {
            kind: "tool",
            name: name.to_string(),
        })
}

/// Read a tool configuration from a file.
pub fn load_tool_config_file(path: &Path) -> Result<ToolConfig, ConfigError> {
    let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    ToolConfig::parse(&path.display().to_string(), &source)
}

/// Resolve a tool resource and construct the tool.
pub fn load_tool(name: &str) -> Result<ConfiguredTool, ConfigError> {
    Ok(load_tool_config(name)?.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pca::SubspaceDimension;

    #[test]
    fn test_all_embedded_resources_build() {
        for name in tool_resource_names() {
            let tool = load_tool(name).unwrap_or_else(|e| panic!("{name}: {e}"));
            assert!(!tool.name().is_empty());
        }
        assert_eq!(embedded_tools().len(), TOOL_RESOURCES.len());
    }

    #[test]
    fn test_resource_values() {
        let ToolConfig::Lda(lda) = load_tool_config("pca+lda").unwrap() else {
            panic!("pca+lda is not an LDA resource");
        };
        assert_eq!(lda.pca_subspace_dimension, Some(SubspaceDimension::Count(100)));

        let ToolConfig::Bic(iec) = load_tool_config("iec").unwrap() else {
            panic!("iec is not a BIC resource");
        };
        assert_eq!(iec.subspace_dimensions, None);

        let ToolConfig::Isv(isv) = load_tool_config("isv").unwrap() else {
            panic!("isv is not an ISV resource");
        };
        assert_eq!(isv.subspace_dimension_of_u, 160);
        assert_eq!(isv.gmm.number_of_gaussians, 512);
    }

    #[test]
    fn test_fraction_subspace() {
        let config = ToolConfig::parse("inline", "tool = \"pca\"\nsubspace_dimension = 0.95").unwrap();
        assert_eq!(
            config,
            ToolConfig::Pca(PcaConfig::new(SubspaceDimension::Fraction(0.95)))
        );
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = ToolConfig::parse("inline", "tool = \"isv\"\nsubspace_dimension_of_v = 3").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption { ref option, .. } if option == "subspace_dimension_of_v"));
        assert!(matches!(
            ToolConfig::parse("inline", "tool = \"svm\""),
            Err(ConfigError::UnknownTool { .. })
        ));
        assert!(matches!(
            ToolConfig::parse("inline", "subspace_dimension = 3"),
            Err(ConfigError::MissingTool(_))
        ));
        assert!(matches!(
            load_tool_config("no-such-tool"),
            Err(ConfigError::UnknownResource { .. })
        ));
    }

    #[test]
    fn test_invalid_values_fail_on_build() {
        let config = ToolConfig::parse("inline", "tool = \"ubm_gmm\"\nrelevance_factor = -1.0").unwrap();
        assert!(matches!(config.build(), Err(ToolError::InvalidConfig(_))));
    }

    #[test]
    fn test_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "tool = \"lgbphs\"\ndistance_function = \"chi_square\"").unwrap();
        let ToolConfig::Lgbphs(config) = load_tool_config_file(&path).unwrap() else {
            panic!("expected an LGBPHS resource");
        };
        assert_eq!(config.distance_function, facerec_core::HistogramMeasure::ChiSquare);
    }
}
