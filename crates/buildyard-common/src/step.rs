use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ParseEnumError;

/// What a step does. Selects the command template and the log rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Install modules on a fresh database
    #[serde(alias = "install_odoo")]
    Install,
    /// Serve the built database; always the last step
    #[serde(alias = "run_odoo")]
    Run,
    /// Restore a database from a template or a dump
    Restore,
    /// Upgrade modules on a restored database
    Upgrade,
    /// Run an arbitrary command and classify its log by patterns only
    CustomParse,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Run => "run",
            Self::Restore => "restore",
            Self::Upgrade => "upgrade",
            Self::CustomParse => "custom_parse",
        }
    }

    /// Steps that leave a database a `run` step can serve.
    pub fn provides_database(&self) -> bool {
        matches!(self, Self::Install | Self::Restore)
    }

    /// Whether a clean log must also contain a completion marker.
    pub fn requires_completion_marker(&self) -> bool {
        matches!(self, Self::Install | Self::Upgrade | Self::Run)
    }

    /// Steps that only have work to do when the build restores a database.
    pub fn needs_restored_database(&self) -> bool {
        matches!(self, Self::Restore | Self::Upgrade)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" | "install_odoo" => Ok(Self::Install),
            "run" | "run_odoo" => Ok(Self::Run),
            "restore" => Ok(Self::Restore),
            "upgrade" => Ok(Self::Upgrade),
            "custom_parse" => Ok(Self::CustomParse),
            _ => Err(ParseEnumError::new("job type", s)),
        }
    }
}

fn default_db_name() -> String {
    "all".to_string()
}

fn default_modules() -> String {
    "all".to_string()
}

/// One configured unit of work in a build configuration.
///
/// Builds keep their own copy of the steps they were submitted with, so
/// editing a configuration never reaches an in-flight build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    pub job_type: JobType,
    pub order_index: u32,
    /// Overrides the default error regex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_pattern: Option<String>,
    /// Overrides the default warning regex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_pattern: Option<String>,
    /// Overrides the default completion marker regex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_marker: Option<String>,
    /// Overrides the job type's marker requirement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_completion_marker: Option<bool>,
    /// Command template; required for `custom_parse`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Database suffix, the database is `{dest}-{db_name}`
    #[serde(default = "default_db_name")]
    pub db_name: String,
    #[serde(default = "default_modules")]
    pub modules: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_tags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_params: Option<String>,
    /// Template database for restore steps; absent means restore from `restore.zip`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_template: Option<String>,
}

impl StepConfig {
    pub fn new(name: impl Into<String>, job_type: JobType, order_index: u32) -> Self {
        Self {
            name: name.into(),
            job_type,
            order_index,
            error_pattern: None,
            warning_pattern: None,
            completion_marker: None,
            require_completion_marker: None,
            command: None,
            db_name: default_db_name(),
            modules: default_modules(),
            test_tags: None,
            extra_params: None,
            restore_template: None,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_error_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.error_pattern = Some(pattern.into());
        self
    }

    pub fn with_warning_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.warning_pattern = Some(pattern.into());
        self
    }

    pub fn with_db_name(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = db_name.into();
        self
    }

    pub fn requires_completion_marker(&self) -> bool {
        self.require_completion_marker
            .unwrap_or_else(|| self.job_type.requires_completion_marker())
    }

    /// Log file name for this step, relative to the workspace `logs/` directory.
    pub fn log_file_name(&self) -> String {
        format!("{}.txt", self.name)
    }
}
