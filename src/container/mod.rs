//! Container lifecycle: image build, launch, stop and liveness.
//!
//! The runtime knows nothing about builds. Callers give it a command, a log
//! file, a workspace and a container name; it answers whether a name is still
//! running. A container that does not exist is simply "not running".

mod command;
mod docker;
#[cfg(test)]
pub(crate) mod fake;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::OrchestratorError;

pub use command::{ShellCommand, transcript};
pub use docker::{DockerCli, parse_gateway, validate_container_name};

/// First container port exposed; host ports map onto 8069, 8070, ...
pub const FIRST_CONTAINER_PORT: u16 = 8069;

/// Where the workspace is mounted inside every container.
pub const CONTAINER_WORKSPACE: &str = "/data/build";

/// Per-launch options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Read-only mounts, `dest` (relative to the workspace mount) to host `source`
    pub ro_volumes: BTreeMap<String, PathBuf>,
    /// Host ports, bound on 127.0.0.1 to sequential container ports
    pub exposed_ports: Vec<u16>,
    pub cpu_limit: Option<u32>,
    /// `VAR=value` entries
    pub env: Vec<String>,
}

impl RunOptions {
    pub fn with_ro_volume(mut self, dest: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        self.ro_volumes.insert(dest.into(), source.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.exposed_ports.push(port);
        self
    }

    pub fn with_env(mut self, var: impl Into<String>) -> Self {
        self.env.push(var.into());
        self
    }
}

/// Abstraction over the container runtime for testability.
/// Real implementation: `DockerCli`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build the engine image from `workspace`, full output going to `log_path`.
    async fn build_image(&self, workspace: &Path, log_path: &Path)
    -> Result<(), OrchestratorError>;

    /// Launch a detached container and return its name once it is observable
    /// (or once the wait gave up, which is only logged).
    async fn run_container(
        &self,
        command: &ShellCommand,
        log_path: &Path,
        workspace: &Path,
        name: &str,
        options: &RunOptions,
    ) -> Result<String, OrchestratorError>;

    /// Best-effort stop.
    async fn stop_container(&self, name: &str);

    async fn is_running(&self, name: &str) -> bool;

    /// Names of every running container; empty when the runtime is unavailable.
    async fn list_running_names(&self) -> Vec<String>;

    async fn host_gateway_address(&self) -> Option<String>;
}
