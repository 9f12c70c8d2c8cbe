//! Configuration view and validation commands, `buildyard config`.

use anyhow::{Context, Result};
use std::path::Path;

use buildyard::classify::LogDefaults;
use buildyard::config::{EngineConfig, ProjectPaths};

use super::super::{Cli, ConfigCommands};
use super::load_config;

pub fn cmd_config(project_dir: &Path, cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let paths = ProjectPaths::new(project_dir);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Buildyard Configuration");
            println!("=======================");
            println!();

            if paths.config_file.exists() {
                println!("Config file: {}", paths.config_file.display());
            } else {
                println!("No engine.toml found at {}", paths.config_file.display());
                println!("Using default configuration.");
            }
            println!();

            // Effective values, env and CLI overrides included
            let config = load_config(project_dir, cli, None)?;
            print!("{}", config.to_toml()?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = load_config(project_dir, cli, None)?;
            let mut warnings = config.validate();
            if let Err(e) = LogDefaults::from_section(&config.logs) {
                warnings.push(e.to_string());
            }

            if warnings.is_empty() {
                if paths.config_file.exists() {
                    println!("Configuration is valid.");
                } else {
                    println!("No engine.toml found. Using defaults (valid).");
                }
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if paths.config_file.exists() {
                println!(
                    "engine.toml already exists at {}",
                    paths.config_file.display()
                );
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            paths.ensure_directories()?;
            std::fs::write(&paths.config_file, EngineConfig::default().to_toml()?)
                .with_context(|| format!("Failed to write {}", paths.config_file.display()))?;

            println!("Created engine.toml at {}", paths.config_file.display());
            println!();
            println!("You can now customize:");
            println!("  - [engine] max_running, timeout, slot_pattern");
            println!("  - [container] program, image, volumes");
            println!("  - [logs] severity levels and completion_marker");
            println!("  - [migration] source directories");
            println!();
        }
    }

    Ok(())
}
