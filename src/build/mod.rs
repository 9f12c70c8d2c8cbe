//! Build records and the state machines that drive them.
//!
//! A [`Build`] walks its configured steps one container at a time. A
//! [`MigrationBuild`] walks the fixed base/addon/migrate phases. Both are
//! advanced by `tick`, which never returns an error: anything that goes
//! wrong ends the build in a terminal state with a recorded reason.

mod dispatch;
mod machine;
mod migration;
mod sidecar;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use buildyard_common::{BuildState, StepConfig, Verdict};

use crate::classify::{Cause, LogDefaults};
use crate::config::EngineConfig;
use crate::container::ContainerRuntime;
use crate::errors::{ConfigError, DispatchError, TimeoutExceeded};

pub use dispatch::{render_template, step_command};
pub use migration::{MigrationBuild, MigrationStatus, clean_logs};
pub use sidecar::{head_commit, sidecar_path, write_commit_hashes};

/// Why a build ended in `killed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KillReason {
    Timeout {
        step: String,
        elapsed_secs: i64,
        limit_secs: u64,
    },
    DispatchFailed {
        step: String,
        message: String,
    },
    Requested,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout {
                step,
                elapsed_secs,
                limit_secs,
            } => write!(
                f,
                "{}",
                TimeoutExceeded {
                    step: step.clone(),
                    elapsed_secs: *elapsed_secs,
                    limit_secs: *limit_secs,
                }
            ),
            Self::DispatchFailed { step, message } => {
                write!(f, "Step {} failed to start: {}", step, message)
            }
            Self::Requested => f.write_str("Killed on request"),
        }
    }
}

/// The step whose log degraded the build result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub step: String,
    pub verdict: Verdict,
    pub cause: Cause,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

/// One build of one source change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    /// Stable identity, prefix of container and database names
    pub dest: String,
    pub workspace: PathBuf,
    pub state: BuildState,
    /// Snapshot of the configuration taken at submission
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub current_step: Option<usize>,
    #[serde(default)]
    pub step_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub result: Verdict,
    #[serde(default)]
    pub port: Option<u16>,
    /// Read-only checkouts mounted into every step, `dest` to host path
    #[serde(default)]
    pub volumes: BTreeMap<String, PathBuf>,
    /// Restore and upgrade steps are skipped without a database to restore
    #[serde(default)]
    pub restore_db: bool,
    /// Host path of the dump to restore when no template database is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_zip: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_reason: Option<KillReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    /// Create a pending build from a validated copy of `steps`.
    pub fn new(
        dest: impl Into<String>,
        workspace: impl Into<PathBuf>,
        steps: Vec<StepConfig>,
    ) -> Result<Self, ConfigError> {
        crate::steps::validate(&steps)?;
        Ok(Self {
            dest: dest.into(),
            workspace: workspace.into(),
            state: BuildState::Pending,
            steps,
            current_step: None,
            step_started_at: None,
            container: None,
            result: Verdict::Ok,
            port: None,
            volumes: BTreeMap::new(),
            restore_db: false,
            restore_zip: None,
            kill_reason: None,
            failure: None,
            created_at: Utc::now(),
            finished_at: None,
        })
    }

    pub fn with_volume(mut self, dest: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        self.volumes.insert(dest.into(), source.into());
        self
    }

    pub fn with_restore(mut self, restore_zip: Option<PathBuf>) -> Self {
        self.restore_db = true;
        self.restore_zip = restore_zip;
        self
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.workspace.join("logs")
    }

    pub fn log_path(&self, step: &StepConfig) -> PathBuf {
        self.logs_dir().join(step.log_file_name())
    }

    pub fn current(&self) -> Option<&StepConfig> {
        self.current_step.and_then(|i| self.steps.get(i))
    }

    /// Database a step works on: `{dest}-{db_name}`.
    pub fn database(&self, step: &StepConfig) -> String {
        format!("{}-{}", self.dest, step.db_name)
    }

    pub fn container_name(&self, step: &StepConfig) -> String {
        format!("{}-{}", self.dest, step.name)
    }

    /// Seconds the current step has been running.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<i64> {
        self.step_started_at
            .map(|start| (now - start).num_seconds().max(0))
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn status(&self, now: DateTime<Utc>) -> BuildStatus {
        let reason = match (&self.kill_reason, &self.failure) {
            (Some(kill), _) => Some(kill.to_string()),
            (None, Some(failure)) => Some(match &failure.excerpt {
                Some(line) => format!("{}: {}", failure.step, line),
                None => format!("{}: {:?}", failure.step, failure.cause),
            }),
            (None, None) => None,
        };
        BuildStatus {
            dest: self.dest.clone(),
            state: self.state,
            result: self.result,
            current_step: self.current().map(|s| s.name.clone()),
            elapsed: if self.is_terminal() {
                None
            } else {
                self.elapsed(now)
            },
            reason,
        }
    }
}

/// What `status` reports for a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub dest: String,
    pub state: BuildState,
    pub result: Verdict,
    pub current_step: Option<String>,
    /// Seconds in the current step
    pub elapsed: Option<i64>,
    pub reason: Option<String>,
}

/// Hands out host ports to builds, two at a time (server and longpolling).
#[derive(Debug, Clone)]
pub struct PortAllocator {
    base: u16,
    used: BTreeSet<u16>,
    check_bind: bool,
}

impl PortAllocator {
    /// `used` are ports held by active builds. With `check_bind`, ports that
    /// cannot be bound on 127.0.0.1 are skipped as well.
    pub fn new(base: u16, used: impl IntoIterator<Item = u16>, check_bind: bool) -> Self {
        Self {
            base,
            used: used.into_iter().collect(),
            check_bind,
        }
    }

    fn is_free(&self, port: u16) -> bool {
        if self.used.contains(&port) || self.used.contains(&(port + 1)) {
            return false;
        }
        !self.check_bind || TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    pub fn allocate(&mut self) -> Result<u16, DispatchError> {
        let port = (self.base..u16::MAX - 1)
            .step_by(2)
            .find(|&p| self.is_free(p))
            .ok_or(DispatchError::NoFreePort { base: self.base })?;
        self.used.insert(port);
        self.used.insert(port + 1);
        Ok(port)
    }
}

/// Everything one scheduler pass shares between builds.
pub struct TickContext<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub config: &'a EngineConfig,
    pub log_defaults: &'a LogDefaults,
    pub ports: PortAllocator,
    pub now: DateTime<Utc>,
}

impl<'a> TickContext<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        config: &'a EngineConfig,
        log_defaults: &'a LogDefaults,
        ports: PortAllocator,
    ) -> Self {
        Self {
            runtime,
            config,
            log_defaults,
            ports,
            now: Utc::now(),
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

fn create_logs_dir(dir: &Path) -> Result<(), DispatchError> {
    std::fs::create_dir_all(dir).map_err(|source| DispatchError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildyard_common::JobType;
    use chrono::Duration;

    fn steps() -> Vec<StepConfig> {
        vec![
            StepConfig::new("install_odoo", JobType::Install, 1),
            StepConfig::new("run_odoo", JobType::Run, 2),
        ]
    }

    #[test]
    fn test_new_build_validates_steps() {
        let bad = vec![
            StepConfig::new("run_odoo", JobType::Run, 1),
            StepConfig::new("install_odoo", JobType::Install, 2),
        ];
        assert!(matches!(
            Build::new("1-abc", "/ws", bad).unwrap_err(),
            ConfigError::RunNotLast { .. }
        ));

        let build = Build::new("1-abc", "/ws", steps()).unwrap();
        assert_eq!(build.state, BuildState::Pending);
        assert_eq!(build.result, Verdict::Ok);
        assert!(build.current_step.is_none());
    }

    #[test]
    fn test_derived_names() {
        let build = Build::new("12-feature", "/srv/ws", steps()).unwrap();
        let install = &build.steps[0];
        assert_eq!(build.container_name(install), "12-feature-install_odoo");
        assert_eq!(build.database(install), "12-feature-all");
        assert_eq!(
            build.log_path(install),
            PathBuf::from("/srv/ws/logs/install_odoo.txt")
        );

        let tests = StepConfig::new("tests", JobType::Install, 3).with_db_name("test");
        assert_eq!(build.database(&tests), "12-feature-test");
    }

    #[test]
    fn test_status_reports_elapsed_and_reason() {
        let mut build = Build::new("1-abc", "/ws", steps()).unwrap();
        let now = Utc::now();
        build.state = BuildState::Testing;
        build.current_step = Some(0);
        build.step_started_at = Some(now - Duration::seconds(90));

        let status = build.status(now);
        assert_eq!(status.current_step.as_deref(), Some("install_odoo"));
        assert_eq!(status.elapsed, Some(90));
        assert!(status.reason.is_none());

        build.state = BuildState::Killed;
        build.kill_reason = Some(KillReason::Timeout {
            step: "install_odoo".into(),
            elapsed_secs: 1900,
            limit_secs: 1800,
        });
        let status = build.status(now);
        assert!(status.elapsed.is_none());
        assert!(status.reason.unwrap().contains("killed by timeout"));
    }

    #[test]
    fn test_build_serde_keeps_snapshot() {
        let build = Build::new("1-abc", "/ws", steps())
            .unwrap()
            .with_volume("odoo", "/srv/odoo")
            .with_restore(None);
        let json = serde_json::to_string(&build).unwrap();
        let back: Build = serde_json::from_str(&json).unwrap();
        assert_eq!(back.steps, build.steps);
        assert!(back.restore_db);
        assert_eq!(back.volumes.get("odoo"), Some(&PathBuf::from("/srv/odoo")));
    }

    #[test]
    fn test_port_allocator_skips_used_pairs() {
        let mut ports = PortAllocator::new(2000, [2000, 2001, 2003], false);
        // 2002 is free but 2003 is taken, so the pair starts at 2004
        assert_eq!(ports.allocate().unwrap(), 2004);
        assert_eq!(ports.allocate().unwrap(), 2006);
    }

    #[test]
    fn test_port_allocator_exhausted() {
        let mut ports = PortAllocator::new(u16::MAX - 1, [], false);
        assert!(matches!(
            ports.allocate().unwrap_err(),
            DispatchError::NoFreePort { .. }
        ));
    }
}
