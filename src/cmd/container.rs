//! Direct container runtime commands.

use anyhow::{Context, Result};
use std::path::Path;

use buildyard::config::ProjectPaths;
use buildyard::container::{ContainerRuntime, DockerCli};

use super::super::Cli;
use super::load_config;

pub async fn cmd_image(project_dir: &Path, cli: &Cli, context: Option<&Path>) -> Result<()> {
    let config = load_config(project_dir, cli, None)?;
    let runtime = DockerCli::from_config(&config.container);
    let context = context.unwrap_or(project_dir);

    let paths = ProjectPaths::new(project_dir);
    let logs_dir = paths.state_dir.join("logs");
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("Failed to create {}", logs_dir.display()))?;
    let log_path = logs_dir.join("docker_build.txt");

    println!(
        "Building {} from {} (log: {})",
        config.container.image,
        context.display(),
        log_path.display()
    );
    runtime.build_image(context, &log_path).await?;
    println!("Image {} built", config.container.image);
    Ok(())
}

pub async fn cmd_gateway(project_dir: &Path, cli: &Cli) -> Result<()> {
    let config = load_config(project_dir, cli, None)?;
    let runtime = DockerCli::from_config(&config.container);

    match runtime.host_gateway_address().await {
        Some(address) => {
            println!("{}", address);
            Ok(())
        }
        None => anyhow::bail!(
            "Could not read the bridge network gateway from {}",
            runtime.program()
        ),
    }
}
