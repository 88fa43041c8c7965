use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facerec_core::Archive;
use facerec_tools::config::{load_tool_config_file, tool_resource_names};
use facerec_tools::database::database_resource_names;
use facerec_tools::{load_database_config, load_tool, load_tool_config, Capabilities};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "facerec", about = "Face recognition tool diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tool resources with their capability flags
    Tools {
        #[arg(long)]
        json: bool,
    },
    /// Show the resolved configuration of a tool resource or TOML file
    Show { resource: String },
    /// Show a database descriptor, or list the embedded ones
    Database {
        #[arg(required_unless_present = "list")]
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        list: bool,
    },
    /// List the datasets of an artifact
    Inspect { artifact: PathBuf },
    /// Compare two artifacts; exits with status 1 when they differ
    Compare {
        a: PathBuf,
        b: PathBuf,
        #[arg(long, default_value_t = 1e-5)]
        tolerance: f64,
    },
}

#[derive(Serialize)]
struct ToolEntry {
    resource: &'static str,
    tool: &'static str,
    capabilities: Capabilities,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Tools { json } => {
            let entries = tool_resource_names()
                .map(|resource| {
                    let tool = load_tool(resource).with_context(|| format!("loading {resource}"))?;
                    Ok(ToolEntry {
                        resource,
                        tool: tool.name(),
                        capabilities: tool.capabilities(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    let caps = entry.capabilities;
                    println!(
                        "{:<24} {:<16} projection={} projector_training={} projected_enrollment={} by_client={} enroller_training={}",
                        entry.resource,
                        entry.tool,
                        caps.performs_projection,
                        caps.requires_projector_training,
                        caps.use_projected_features_for_enrollment,
                        caps.split_training_features_by_client,
                        caps.requires_enroller_training,
                    );
                }
            }
        }
        Commands::Show { resource } => {
            let path = Path::new(&resource);
            let config = if path.is_file() {
                load_tool_config_file(path)?
            } else {
                load_tool_config(&resource)?
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Database { name, list } => match name {
            Some(name) if !list => {
                let database = load_database_config(&name)?;
                println!("{}", serde_json::to_string_pretty(&database)?);
            }
            _ => {
                for name in database_resource_names() {
                    println!("{name}");
                }
            }
        },
        Commands::Inspect { artifact } => {
            let archive = Archive::read(&artifact)
                .with_context(|| format!("reading {}", artifact.display()))?;
            for (path, dataset) in archive.datasets() {
                println!("{path}: {dataset}");
            }
        }
        Commands::Compare { a, b, tolerance } => {
            let first = Archive::read(&a).with_context(|| format!("reading {}", a.display()))?;
            let second = Archive::read(&b).with_context(|| format!("reading {}", b.display()))?;
            match first.compare(&second, tolerance) {
                Ok(()) => println!("artifacts match within {tolerance}"),
                Err(mismatch) => {
                    println!("artifacts differ at {mismatch}");
                    return Ok(ExitCode::from(1));
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_arguments() {
        let cli = Cli::try_parse_from(["facerec", "database", "--list"]).unwrap();
        assert!(matches!(cli.command, Commands::Database { name: None, list: true }));

        let cli = Cli::try_parse_from(["facerec", "database", "lfw_view1_unrestricted"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Database { name: Some(ref name), list: false } if name == "lfw_view1_unrestricted"
        ));

        assert!(Cli::try_parse_from(["facerec", "database"]).is_err());
        assert!(Cli::try_parse_from(["facerec", "database", "lfw_view1_unrestricted", "--list"]).is_err());
    }
}
