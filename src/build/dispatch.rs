//! Turning a step into the command and mounts its container runs with.

use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use buildyard_common::{JobType, StepConfig};

use super::Build;
use crate::config::EngineConfig;
use crate::container::{CONTAINER_WORKSPACE, RunOptions, ShellCommand};
use crate::errors::{ConfigError, DispatchError};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\$?)\{([a-z_]+)\}").expect("placeholder regex compiles"));

/// Substitute `{name}` placeholders. `${name}` is left alone for the shell.
pub fn render_template(
    template: &str,
    vars: &[(&str, &str)],
    step: &str,
) -> Result<String, DispatchError> {
    let lookup = |name: &str| vars.iter().find(|(k, _)| *k == name).map(|(_, v)| *v);

    for caps in PLACEHOLDER.captures_iter(template) {
        if caps[1].is_empty() && lookup(&caps[2]).is_none() {
            return Err(DispatchError::UnknownPlaceholder {
                step: step.to_string(),
                placeholder: caps[2].to_string(),
            });
        }
    }

    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        if caps[1].is_empty() {
            lookup(&caps[2]).unwrap_or_default().to_string()
        } else {
            caps[0].to_string()
        }
    });
    Ok(rendered.into_owned())
}

/// `--test-enable --test-tags` plus extra parameters, for install and upgrade.
fn test_arguments(step: &StepConfig) -> String {
    let mut args = Vec::new();
    if let Some(tags) = step.test_tags.as_deref().filter(|t| !t.trim().is_empty()) {
        args.push(format!("--test-enable --test-tags {}", tags.replace(' ', "")));
    }
    if let Some(extra) = step.extra_params.as_deref().filter(|e| !e.trim().is_empty()) {
        args.push(extra.trim().to_string());
    }
    args.join(" ")
}

/// Restore chain for a zipped dump holding `dump.sql` and `filestore/`.
fn restore_from_zip(db: &str, zip_in_container: &str) -> ShellCommand {
    let folder = format!("{}/datadir/filestore/{}", CONTAINER_WORKSPACE, db);
    ShellCommand::new(format!("psql -a {} < {}/dump.sql", db, folder))
        .with_pre(format!("createdb {}", db))
        .with_pre(format!("mkdir -p {}", folder))
        .with_pre(format!("unzip {} -d {}", zip_in_container, folder))
        .with_pre(format!("mv {}/filestore/* {}", folder, folder))
        .with_post(format!("rm -rf {}", folder))
}

/// Where the dump lives inside the container, plus the mount that puts it there.
fn zip_location(build: &Build) -> (String, Option<(String, &Path)>) {
    match build
        .restore_zip
        .as_deref()
        .and_then(|zip| Some((zip.parent()?, zip.file_name()?)))
    {
        Some((dir, file)) => (
            format!(
                "{}/restore_volume/{}",
                CONTAINER_WORKSPACE,
                file.to_string_lossy()
            ),
            Some(("restore_volume".to_string(), dir)),
        ),
        None => (format!("{}/restore.zip", CONTAINER_WORKSPACE), None),
    }
}

/// Command and options for `step`, or `None` when the step has nothing to do
/// for this build.
pub fn step_command(
    build: &Build,
    step: &StepConfig,
    config: &EngineConfig,
) -> Result<Option<(ShellCommand, RunOptions)>, DispatchError> {
    if step.job_type.needs_restored_database() && !build.restore_db {
        return Ok(None);
    }

    let db = build.database(step);
    let port = build.port.map(|p| p.to_string()).unwrap_or_default();
    let template_db = step.restore_template.clone().unwrap_or_default();
    let vars = [
        ("db", db.as_str()),
        ("dest", build.dest.as_str()),
        ("modules", step.modules.as_str()),
        ("port", port.as_str()),
        ("template", template_db.as_str()),
    ];
    let render = |template: &str| render_template(template, &vars, &step.name);

    let mut options = RunOptions {
        ro_volumes: build.volumes.clone(),
        ..Default::default()
    };

    let command = match (step.job_type, step.command.as_deref()) {
        (JobType::CustomParse, None) => {
            return Err(ConfigError::MissingCommand {
                step: step.name.clone(),
            }
            .into());
        }
        (_, Some(custom)) => ShellCommand::new(render(custom)?),
        (JobType::Install, None) => {
            let mut cmd = ShellCommand::new(render(&config.commands.install)?);
            cmd.push_args(&test_arguments(step));
            cmd
        }
        (JobType::Upgrade, None) => {
            let mut cmd = ShellCommand::new(render(&config.commands.upgrade)?);
            cmd.push_args(&test_arguments(step));
            cmd
        }
        (JobType::Run, None) => ShellCommand::new(render(&config.commands.run)?),
        (JobType::Restore, None) if step.restore_template.is_some() => {
            ShellCommand::new(render(&config.commands.restore_from_template)?)
        }
        (JobType::Restore, None) => {
            let (zip, mount) = zip_location(build);
            if let Some((dest, dir)) = mount {
                options.ro_volumes.insert(dest, dir.to_path_buf());
            }
            restore_from_zip(&db, &zip)
        }
    };

    if step.job_type == JobType::Run {
        if let Some(port) = build.port {
            options.exposed_ports = vec![port, port + 1];
        }
    } else {
        options.cpu_limit = config.container.cpu_limit;
    }

    Ok(Some((command, options)))
}
