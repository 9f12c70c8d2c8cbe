//! Step sequencing: validation, ordering and loading of build configurations.
//!
//! A configuration file lists its steps as TOML tables:
//!
//! ```toml
//! [[steps]]
//! name = "install_odoo"
//! job_type = "install"
//! order_index = 10
//!
//! [[steps]]
//! name = "run_odoo"
//! job_type = "run"
//! order_index = 20
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use buildyard_common::{JobType, StepConfig};

use crate::errors::ConfigError;

/// On-disk shape of a build configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepsFile {
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// Parse a configuration and sort its steps by `order_index`.
///
/// The sort is stable, so duplicate indices stay in file order and are
/// reported by `validate`.
pub fn parse_steps(content: &str) -> Result<Vec<StepConfig>> {
    let file: StepsFile = toml::from_str(content).context("Failed to parse steps file")?;
    let mut steps = file.steps;
    steps.sort_by_key(|s| s.order_index);
    Ok(steps)
}

pub fn load_steps(path: &Path) -> Result<Vec<StepConfig>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read steps file: {}", path.display()))?;
    parse_steps(&content).with_context(|| format!("Invalid steps file: {}", path.display()))
}

fn check_pattern(
    step: &StepConfig,
    pattern: &Option<String>,
    kind: &'static str,
) -> Result<(), ConfigError> {
    if let Some(p) = pattern {
        Regex::new(p).map_err(|source| ConfigError::InvalidPattern {
            step: step.name.clone(),
            kind,
            source,
        })?;
    }
    Ok(())
}

/// Check a step list in order and return the first violation.
pub fn validate(steps: &[StepConfig]) -> Result<(), ConfigError> {
    if steps.is_empty() {
        return Err(ConfigError::NoSteps);
    }

    let mut has_database = false;
    for (i, step) in steps.iter().enumerate() {
        if let Some(previous) = i.checked_sub(1).map(|p| &steps[p]) {
            if step.order_index == previous.order_index {
                return Err(ConfigError::DuplicateOrder {
                    index: step.order_index,
                    first: previous.name.clone(),
                    second: step.name.clone(),
                });
            }
            if step.order_index < previous.order_index {
                return Err(ConfigError::OrderNotIncreasing {
                    step: step.name.clone(),
                    index: step.order_index,
                    previous: previous.order_index,
                });
            }
        }

        if step.job_type == JobType::CustomParse
            && step.command.as_deref().is_none_or(|c| c.trim().is_empty())
        {
            return Err(ConfigError::MissingCommand {
                step: step.name.clone(),
            });
        }

        check_pattern(step, &step.error_pattern, "error")?;
        check_pattern(step, &step.warning_pattern, "warning")?;
        check_pattern(step, &step.completion_marker, "completion marker")?;

        if step.job_type == JobType::Run {
            if i + 1 != steps.len() {
                return Err(ConfigError::RunNotLast {
                    step: step.name.clone(),
                });
            }
            if !has_database {
                return Err(ConfigError::RunWithoutDatabase {
                    step: step.name.clone(),
                });
            }
        }
        has_database |= step.job_type.provides_database();
    }
    Ok(())
}

/// Index of the step after `completed`, or `None` when it was the last.
pub fn next_step(steps: &[StepConfig], completed: usize) -> Option<usize> {
    let next = completed + 1;
    (next < steps.len()).then_some(next)
}
