//! `ContainerRuntime` backed by the docker command line.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    CONTAINER_WORKSPACE, ContainerRuntime, FIRST_CONTAINER_PORT, RunOptions, ShellCommand,
    transcript,
};
use crate::config::ContainerSection;
use crate::errors::{ImageBuildError, OrchestratorError};

const WAIT_INTERVAL: Duration = Duration::from_millis(500);

/// Runs containers through `docker` (or whatever `program` points at).
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
    image: String,
    shm_size: String,
    volumes: Vec<String>,
    rc_file: Option<PathBuf>,
    rc_target: String,
    wait_timeout: Duration,
}

impl DockerCli {
    /// Build from the `[container]` section, resolving the rc file against
    /// the current home directory.
    pub fn from_config(section: &ContainerSection) -> Self {
        let rc_file = dirs::home_dir().and_then(|home| {
            section
                .rc_files
                .iter()
                .map(|name| home.join(name))
                .find(|path| path.is_file())
        });

        Self {
            program: section.program.clone(),
            image: section.image.clone(),
            shm_size: section.shm_size.clone(),
            volumes: section.volumes.clone(),
            rc_file,
            rc_target: section.rc_target.clone(),
            wait_timeout: Duration::from_secs(section.wait_timeout),
        }
    }

    pub fn with_rc_file(mut self, rc_file: Option<PathBuf>) -> Self {
        self.rc_file = rc_file;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments after the program name for `docker run`.
    pub fn run_args(
        &self,
        run_cmd: &str,
        workspace: &Path,
        name: &str,
        options: &RunOptions,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        args.extend(self.volumes.iter().map(|v| format!("--volume={}", v)));
        args.push(format!(
            "--volume={}:{}",
            workspace.display(),
            CONTAINER_WORKSPACE
        ));
        args.push(format!("--shm-size={}", self.shm_size));
        args.push("--init".to_string());

        for (dest, source) in &options.ro_volumes {
            args.push(format!(
                "--volume={}:{}/{}:ro",
                source.display(),
                CONTAINER_WORKSPACE,
                dest
            ));
        }
        args.extend(options.env.iter().map(|var| format!("-e={}", var)));
        if let Some(rc) = &self.rc_file {
            args.push(format!("--volume={}:{}:ro", rc.display(), self.rc_target));
        }
        for (host_port, container_port) in options.exposed_ports.iter().zip(FIRST_CONTAINER_PORT..)
        {
            args.push("-p".to_string());
            args.push(format!("127.0.0.1:{}:{}", host_port, container_port));
        }
        if let Some(cpu) = options.cpu_limit {
            args.push("--ulimit".to_string());
            args.push(format!("cpu={}", cpu));
        }
        args.push(self.image.clone());
        args.push("/bin/bash".to_string());
        args.push("-c".to_string());
        args.push(run_cmd.to_string());
        args
    }

    fn create_log(path: &Path) -> Result<File, OrchestratorError> {
        let log_error = |source| OrchestratorError::LogFile {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(log_error)?;
        }
        File::create(path).map_err(log_error)
    }

    fn log_stdio(file: &File, path: &Path) -> Result<(Stdio, Stdio), OrchestratorError> {
        let clone = || {
            file.try_clone().map_err(|source| OrchestratorError::LogFile {
                path: path.to_path_buf(),
                source,
            })
        };
        Ok((Stdio::from(clone()?), Stdio::from(clone()?)))
    }

    /// Poll until `name` is visible or the wait timeout elapses.
    async fn wait_for(&self, name: &str) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < self.wait_timeout {
            if self.is_running(name).await {
                return true;
            }
            tokio::time::sleep(WAIT_INTERVAL).await;
        }
        warn!(container = %name, "Container never seen");
        false
    }
}

/// Docker accepts `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
pub fn validate_container_name(name: &str) -> Result<(), OrchestratorError> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidContainerName {
            name: name.to_string(),
        })
    }
}

/// Extract `[0].IPAM.Config[0].Gateway` from `docker network inspect` output.
pub fn parse_gateway(output: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(output).ok()?;
    value
        .get(0)?
        .get("IPAM")?
        .get("Config")?
        .get(0)?
        .get("Gateway")?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn build_image(
        &self,
        workspace: &Path,
        log_path: &Path,
    ) -> Result<(), OrchestratorError> {
        if !workspace.is_dir() {
            return Err(OrchestratorError::MissingWorkspace {
                path: workspace.to_path_buf(),
            });
        }

        let mut log = Self::create_log(log_path)?;
        let header = transcript(&format!("{} build --tag {} .", self.program, self.image));
        log.write_all(header.as_bytes())
            .map_err(|source| OrchestratorError::LogFile {
                path: log_path.to_path_buf(),
                source,
            })?;
        let (stdout, stderr) = Self::log_stdio(&log, log_path)?;

        info!(image = %self.image, workspace = %workspace.display(), "Building image");
        let status = Command::new(&self.program)
            .args(["build", "--tag", &self.image, "."])
            .current_dir(workspace)
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .await
            .map_err(|source| OrchestratorError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !status.success() {
            return Err(ImageBuildError {
                image: self.image.clone(),
                code: status.code(),
                log_path: log_path.to_path_buf(),
            }
            .into());
        }
        Ok(())
    }

    async fn run_container(
        &self,
        command: &ShellCommand,
        log_path: &Path,
        workspace: &Path,
        name: &str,
        options: &RunOptions,
    ) -> Result<String, OrchestratorError> {
        validate_container_name(name)?;
        if command.is_empty() {
            return Err(OrchestratorError::EmptyCommand {
                container: name.to_string(),
            });
        }
        if !workspace.is_dir() {
            return Err(OrchestratorError::MissingWorkspace {
                path: workspace.to_path_buf(),
            });
        }

        let run_cmd = format!("cd {} && {}", CONTAINER_WORKSPACE, command.build());
        debug!(container = %name, command = %run_cmd, "Docker run command");

        let mut log = Self::create_log(log_path)?;
        let mut header = transcript(&run_cmd);
        for (dest, source) in &options.ro_volumes {
            header.push_str(&format!(
                "Adding readonly volume '{}' pointing to {} \n",
                dest,
                source.display()
            ));
        }
        log.write_all(header.as_bytes())
            .map_err(|source| OrchestratorError::LogFile {
                path: log_path.to_path_buf(),
                source,
            })?;
        let (stdout, stderr) = Self::log_stdio(&log, log_path)?;

        // The child is not awaited: completion is observed through `is_running`.
        let mut command = Command::new(&self.program);
        command
            .args(self.run_args(&run_cmd, workspace, name, options))
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        // Own process group, so a Ctrl-C aimed at the engine leaves containers alone
        #[cfg(unix)]
        command.process_group(0);
        command
            .spawn()
            .map_err(|source| OrchestratorError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        self.wait_for(name).await;
        info!(container = %name, "Started container");
        Ok(name.to_string())
    }

    async fn stop_container(&self, name: &str) {
        info!(container = %name, "Stopping container");
        let result = Command::new(&self.program)
            .args(["stop", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!(container = %name, error = %e, "Failed to stop container");
        }
    }

    async fn is_running(&self, name: &str) -> bool {
        Command::new(&self.program)
            .args(["container", "inspect", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn list_running_names(&self) -> Vec<String> {
        let output = match Command::new(&self.program)
            .args(["ps", "--format", "{{.Names}}"])
            .stderr(Stdio::null())
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(program = %self.program, error = %e, "Container runtime not found, returning an empty list");
                return Vec::new();
            }
        };
        if !output.status.success() {
            return Vec::new();
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }

    async fn host_gateway_address(&self) -> Option<String> {
        let output = Command::new(&self.program)
            .args(["network", "inspect", "bridge"])
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_gateway(&String::from_utf8_lossy(&output.stdout))
    }
}
