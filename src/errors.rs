//! Typed error hierarchy for the build engine.
//!
//! - `ConfigError` rejects a step list before any build uses it
//! - `OrchestratorError` / `ImageBuildError` come from the container runtime
//! - `ClassificationError` explains a log that could not be read
//! - `TimeoutExceeded` describes a step killed for running too long
//! - `DispatchError` is everything that can go wrong while starting a step;
//!   the state machines turn it into a terminal state instead of returning it

use std::path::PathBuf;

use thiserror::Error;

/// Invalid build configuration. Surfaced to whoever submits the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Build configuration has no steps")]
    NoSteps,

    #[error("Step {step}: jobs of type run must be the last step")]
    RunNotLast { step: String },

    #[error("Step {step}: jobs of type run must be preceded by an install or restore step")]
    RunWithoutDatabase { step: String },

    #[error("Steps {first} and {second} share order index {index}")]
    DuplicateOrder {
        index: u32,
        first: String,
        second: String,
    },

    #[error("Step {step} has order index {index}, which does not follow {previous}")]
    OrderNotIncreasing {
        step: String,
        index: u32,
        previous: u32,
    },

    #[error("Step {step}: custom_parse steps need a command")]
    MissingCommand { step: String },

    #[error("Step {step}: invalid {kind} pattern: {source}")]
    InvalidPattern {
        step: String,
        kind: &'static str,
        #[source]
        source: regex::Error,
    },
}

/// Failure to build the container image.
#[derive(Debug, Error)]
#[error("Image {image} failed to build (exit code {code:?}), see {log_path}")]
pub struct ImageBuildError {
    pub image: String,
    pub code: Option<i32>,
    pub log_path: PathBuf,
}

/// Errors from the container runtime wrapper.
///
/// A container that does not exist is never an error: `is_running` answers
/// `false` and `stop_container` does nothing.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Workspace {path} does not exist")]
    MissingWorkspace { path: PathBuf },

    #[error("Refusing to run an empty command in container {container}")]
    EmptyCommand { container: String },

    #[error("Invalid container name '{name}'")]
    InvalidContainerName { name: String },

    #[error("Failed to open log file at {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    ImageBuild(#[from] ImageBuildError),
}

/// A step log that could not be classified. Always counts as `ko`.
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("Log file not found at {path}")]
    LogMissing { path: PathBuf },

    #[error("Failed to read log file at {path}: {source}")]
    LogUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A non-final step that outlived its time limit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Step {step} killed by timeout after {elapsed_secs}s (limit {limit_secs}s)")]
pub struct TimeoutExceeded {
    pub step: String,
    pub elapsed_secs: i64,
    pub limit_secs: u64,
}

/// Anything that prevents a step or phase from starting.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Step {step}: command template references unknown placeholder {{{placeholder}}}")]
    UnknownPlaceholder { step: String, placeholder: String },

    #[error("Failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No free port found starting at {base}")]
    NoFreePort { base: u16 },
}
