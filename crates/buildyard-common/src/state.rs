use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ParseEnumError;

/// Lifecycle of a step-sequenced build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    /// Waiting for an execution slot
    #[default]
    Pending,
    /// Running the steps before the final one
    Testing,
    /// Running the final step
    Running,
    /// All steps finished, or a step classified as `ko`
    Done,
    /// Stopped by timeout, dispatch failure or explicit request
    Killed,
}

impl BuildState {
    /// Non-terminal states in the order the scheduler visits them.
    pub const SCHEDULE_ORDER: [BuildState; 3] = [Self::Pending, Self::Testing, Self::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Testing => "testing",
            Self::Running => "running",
            Self::Done => "done",
            Self::Killed => "killed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Killed)
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for BuildState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "testing" => Ok(Self::Testing),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "killed" => Ok(Self::Killed),
            _ => Err(ParseEnumError::new("build state", s)),
        }
    }
}

/// Lifecycle of a migration build: one container per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    #[default]
    Pending,
    /// Installing `base` on the template database
    Base,
    /// Installing the addon under test
    Addon,
    /// Upgrading to the target version
    Migrate,
    Done,
}

impl MigrationPhase {
    /// Non-terminal phases in the order the scheduler visits them.
    pub const SCHEDULE_ORDER: [MigrationPhase; 4] =
        [Self::Pending, Self::Base, Self::Addon, Self::Migrate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Base => "base",
            Self::Addon => "addon",
            Self::Migrate => "migrate",
            Self::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for MigrationPhase {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "base" => Ok(Self::Base),
            "addon" => Ok(Self::Addon),
            "migrate" => Ok(Self::Migrate),
            "done" => Ok(Self::Done),
            _ => Err(ParseEnumError::new("migration phase", s)),
        }
    }
}
