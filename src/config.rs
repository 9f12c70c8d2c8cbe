//! Engine configuration read from `.buildyard/engine.toml`.
//!
//! Every field has a default, so a missing file or a partial file is fine.
//! Layering is file, then environment (`DOCKER_CMD`,
//! `BUILDYARD_MAX_RUNNING`), then CLI flags applied by the binary.
//!
//! ```toml
//! [engine]
//! max_running = 4
//! timeout = 1800
//! base_port = 2000
//! slot_pattern = "-(base|addon|migrate)$"
//!
//! [container]
//! program = "docker"
//! image = "buildyard:tests"
//! wait_timeout = 5
//! volumes = ["/var/run/postgresql:/var/run/postgresql"]
//!
//! [logs]
//! warning = "error"
//! failed = "warning"
//!
//! [commands]
//! install = "python3 odoo/odoo-bin -d {db} -i {modules} --stop-after-init"
//!
//! [migration]
//! servers_dir = "/srv/servers"
//! addons_dirs = ["/srv/addons/enterprise"]
//! migration_scripts_dir = "/srv/upgrade"
//! version_target = "17.0"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::classify::SeverityLevels;

/// Directory holding engine configuration and the build store.
pub const STATE_DIR: &str = ".buildyard";

/// `[engine]`: admission control and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Maximum containers counted against the slot pattern
    pub max_running: usize,
    /// Seconds a non-final step may run before it is killed
    pub timeout: u64,
    /// First host port handed out to builds
    pub base_port: u16,
    /// Regex selecting the running containers that occupy a slot; all when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_pattern: Option<String>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_running: 4,
            timeout: 1800,
            base_port: 2000,
            slot_pattern: None,
        }
    }
}

/// `[container]`: how containers are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSection {
    pub program: String,
    pub image: String,
    pub shm_size: String,
    /// Seconds to wait for a launched container to become visible
    pub wait_timeout: u64,
    /// Host volumes mounted read-write into every container (`src:dest`)
    pub volumes: Vec<String>,
    /// Candidate rc files in the home directory, first existing one is mounted
    pub rc_files: Vec<String>,
    pub rc_target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<u32>,
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            image: "buildyard:tests".to_string(),
            shm_size: "128m".to_string(),
            wait_timeout: 5,
            volumes: vec!["/var/run/postgresql:/var/run/postgresql".to_string()],
            rc_files: vec![".odoorc".to_string(), ".openerp_serverrc".to_string()],
            rc_target: "/home/odoo/.odoorc".to_string(),
            cpu_limit: None,
        }
    }
}

/// `[logs]`: default classification rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsSection {
    #[serde(flatten)]
    pub levels: SeverityLevels,
    /// Overrides the default completion marker regex
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_marker: Option<String>,
}

/// `[commands]`: templates for the built-in job types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTemplates {
    pub install: String,
    pub upgrade: String,
    pub run: String,
    pub restore_from_template: String,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            install: "python3 odoo/odoo-bin -d {db} -i {modules} --stop-after-init --max-cron-threads=0"
                .to_string(),
            upgrade: "python3 odoo/odoo-bin -d {db} -u {modules} --stop-after-init --log-level=info"
                .to_string(),
            run: "python3 odoo/odoo-bin -d {db} --db-filter={dest}.* --max-cron-threads=0 --longpolling-port=8070"
                .to_string(),
            restore_from_template: "createdb -T {template} {db}".to_string(),
        }
    }
}

/// `[migration]`: source trees for phase-based migration builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSection {
    /// Contains one server checkout per version, e.g. `servers/16.0`
    pub servers_dir: PathBuf,
    /// Each contains one checkout per version, e.g. `enterprise/16.0`
    pub addons_dirs: Vec<PathBuf>,
    pub migration_scripts_dir: PathBuf,
    pub version_target: String,
    pub python: String,
    /// Database role passed as `-r`; the server default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_user: Option<String>,
}

impl Default for MigrationSection {
    fn default() -> Self {
        Self {
            servers_dir: PathBuf::from("servers"),
            addons_dirs: Vec::new(),
            migration_scripts_dir: PathBuf::from("migration_scripts"),
            version_target: "master".to_string(),
            python: "python3".to_string(),
            db_user: None,
        }
    }
}

/// The complete `engine.toml` structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub container: ContainerSection,
    #[serde(default)]
    pub logs: LogsSection,
    #[serde(default)]
    pub commands: CommandTemplates,
    #[serde(default)]
    pub migration: MigrationSection,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse engine.toml")
    }

    /// Load `.buildyard/engine.toml` under the project directory, with
    /// environment overrides applied. Missing file gives defaults.
    pub fn load_for_project(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(STATE_DIR).join("engine.toml");
        let mut config = if config_path.exists() {
            Self::load(&config_path)?
        } else {
            Self::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `DOCKER_CMD` and `BUILDYARD_MAX_RUNNING`.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(program) = std::env::var("DOCKER_CMD")
            && !program.trim().is_empty()
        {
            self.container.program = program;
        }
        if let Ok(max) = std::env::var("BUILDYARD_MAX_RUNNING") {
            self.engine.max_running = max
                .trim()
                .parse()
                .with_context(|| format!("Invalid BUILDYARD_MAX_RUNNING '{}'", max))?;
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize engine.toml")
    }

    /// Compiled slot pattern, if one is configured and valid.
    pub fn slot_regex(&self) -> Result<Option<Regex>> {
        self.engine
            .slot_pattern
            .as_deref()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid slot_pattern '{}'", p)))
            .transpose()
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.engine.max_running == 0 {
            warnings.push(
                "max_running is 0: the scheduler will still admit one build per phase".to_string(),
            );
        }
        if self.engine.timeout == 0 {
            warnings.push("timeout is 0: every non-final step will be killed".to_string());
        }
        if let Err(e) = self.slot_regex() {
            warnings.push(format!("{:#}", e));
        }
        if let Some(marker) = &self.logs.completion_marker
            && let Err(e) = Regex::new(marker)
        {
            warnings.push(format!("Invalid completion_marker '{}': {}", marker, e));
        }
        if self.container.image.trim().is_empty() {
            warnings.push("container image is empty".to_string());
        }

        warnings
    }
}

/// Where the engine keeps its state for one project directory.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub store_file: PathBuf,
    pub lock_file: PathBuf,
    pub config_file: PathBuf,
}

impl ProjectPaths {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let state_dir = project_dir.join(STATE_DIR);
        Self {
            store_file: state_dir.join("builds.json"),
            lock_file: state_dir.join("builds.lock"),
            config_file: state_dir.join("engine.toml"),
            state_dir,
            project_dir,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).with_context(|| {
            format!(
                "Failed to create state directory {}",
                self.state_dir.display()
            )
        })
    }
}
