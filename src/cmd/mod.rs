//! CLI command implementations.
//!
//! | Module      | Commands handled                                              |
//! |-------------|---------------------------------------------------------------|
//! | `builds`    | `Validate`, `Submit`, `SubmitMigration`, `Status`, `Kill`, `ResetMigration` |
//! | `tick`      | `Tick`, `Watch`                                               |
//! | `container` | `Image`, `Gateway`                                            |
//! | `config`    | `Config`                                                      |

pub mod builds;
pub mod config;
pub mod container;
pub mod tick;

use anyhow::Result;
use std::path::Path;

use buildyard::config::EngineConfig;

use super::Cli;

pub use builds::{
    SubmitArgs, cmd_kill, cmd_reset_migration, cmd_status, cmd_submit, cmd_submit_migration,
    cmd_validate,
};
pub use config::cmd_config;
pub use container::{cmd_gateway, cmd_image};
pub use tick::{cmd_tick, cmd_watch};

/// engine.toml, then environment, then CLI flags.
pub(crate) fn load_config(
    project_dir: &Path,
    cli: &Cli,
    max_running: Option<usize>,
) -> Result<EngineConfig> {
    let mut config = EngineConfig::load_for_project(project_dir)?;
    if let Some(program) = &cli.docker_cmd {
        config.container.program = program.clone();
    }
    if let Some(max) = max_running {
        config.engine.max_running = max;
    }
    Ok(config)
}
