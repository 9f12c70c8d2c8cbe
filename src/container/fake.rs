//! In-memory runtime for state machine and scheduler tests.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ContainerRuntime, RunOptions, ShellCommand, transcript};
use crate::errors::OrchestratorError;

#[derive(Debug, Clone)]
pub(crate) struct Launch {
    pub name: String,
    pub command: String,
    pub log_path: PathBuf,
    pub options: RunOptions,
}

#[derive(Default)]
struct State {
    running: BTreeSet<String>,
    /// Running containers started outside the engine
    external: BTreeSet<String>,
    launches: Vec<Launch>,
    stopped: Vec<String>,
    failing: HashSet<String>,
}

#[derive(Default)]
pub(crate) struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a container exiting on its own.
    pub fn finish(&self, name: &str) {
        self.state.lock().unwrap().running.remove(name);
    }

    /// Make every future launch of `name` fail.
    pub fn fail_launch(&self, name: &str) {
        self.state.lock().unwrap().failing.insert(name.to_string());
    }

    pub fn add_external(&self, name: &str) {
        self.state.lock().unwrap().external.insert(name.to_string());
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.state.lock().unwrap().launches.clone()
    }

    pub fn launched_names(&self) -> Vec<String> {
        self.launches().into_iter().map(|l| l.name).collect()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn running(&self) -> Vec<String> {
        self.state.lock().unwrap().running.iter().cloned().collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build_image(
        &self,
        workspace: &Path,
        _log_path: &Path,
    ) -> Result<(), OrchestratorError> {
        if !workspace.is_dir() {
            return Err(OrchestratorError::MissingWorkspace {
                path: workspace.to_path_buf(),
            });
        }
        Ok(())
    }

    async fn run_container(
        &self,
        command: &ShellCommand,
        log_path: &Path,
        _workspace: &Path,
        name: &str,
        options: &RunOptions,
    ) -> Result<String, OrchestratorError> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(name) {
            return Err(OrchestratorError::InvalidContainerName {
                name: name.to_string(),
            });
        }
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(log_path, transcript(&command.build())).unwrap();
        state.running.insert(name.to_string());
        state.launches.push(Launch {
            name: name.to_string(),
            command: command.build(),
            log_path: log_path.to_path_buf(),
            options: options.clone(),
        });
        Ok(name.to_string())
    }

    async fn stop_container(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.running.remove(name);
        state.stopped.push(name.to_string());
    }

    async fn is_running(&self, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.running.contains(name) || state.external.contains(name)
    }

    async fn list_running_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .running
            .iter()
            .chain(state.external.iter())
            .cloned()
            .collect()
    }

    async fn host_gateway_address(&self) -> Option<String> {
        Some("172.17.0.1".to_string())
    }
}
