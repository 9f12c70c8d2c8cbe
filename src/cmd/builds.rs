//! Build submission, status and control commands.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};

use buildyard::build::{Build, BuildStatus, MigrationBuild, MigrationStatus};
use buildyard::config::{ProjectPaths, STATE_DIR};
use buildyard::container::DockerCli;
use buildyard::steps::{load_steps, validate};
use buildyard::store::{BuildStore, StoreLock};

use super::super::Cli;
use super::load_config;

pub fn cmd_validate(steps_file: &Path) -> Result<()> {
    let steps = load_steps(steps_file)?;
    validate(&steps).with_context(|| format!("Invalid steps in {}", steps_file.display()))?;

    println!("{} is valid ({} steps):", steps_file.display(), steps.len());
    for step in &steps {
        println!("  {:<4} {:<24} {}", step.order_index, step.name, step.job_type);
    }
    Ok(())
}

pub struct SubmitArgs<'a> {
    pub dest: &'a str,
    pub steps: &'a Path,
    pub workspace: Option<&'a Path>,
    pub volumes: &'a [String],
    pub restore_db: bool,
    pub restore_zip: Option<&'a Path>,
}

fn default_workspace(project_dir: &Path, name: &str) -> PathBuf {
    project_dir.join(STATE_DIR).join("builds").join(name)
}

fn parse_volume(volume: &str) -> Result<(String, PathBuf)> {
    match volume.split_once('=') {
        Some((dest, path)) if !dest.is_empty() && !path.is_empty() => {
            Ok((dest.to_string(), PathBuf::from(path)))
        }
        _ => bail!("Invalid volume '{}', expected DEST=PATH", volume),
    }
}

pub fn cmd_submit(project_dir: &Path, args: SubmitArgs<'_>) -> Result<()> {
    let steps = load_steps(args.steps)?;
    let workspace = args
        .workspace
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_workspace(project_dir, args.dest));

    let mut build = Build::new(args.dest, &workspace, steps)
        .with_context(|| format!("Invalid steps in {}", args.steps.display()))?;
    for volume in args.volumes {
        let (dest, path) = parse_volume(volume)?;
        build = build.with_volume(dest, path);
    }
    if args.restore_db {
        build = build.with_restore(args.restore_zip.map(Path::to_path_buf));
    }

    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

    let paths = ProjectPaths::new(project_dir);
    let _lock = StoreLock::acquire(&paths)?;
    let mut store = BuildStore::load(&paths.store_file)?;
    let step_count = build.steps.len();
    store.submit(build)?;
    store.save(&paths.store_file)?;

    println!("Submitted build {} ({} steps)", args.dest, step_count);
    Ok(())
}

pub fn cmd_submit_migration(
    project_dir: &Path,
    name: &str,
    addon: &str,
    target_db: &str,
    version_src: &str,
    workspace: Option<&Path>,
) -> Result<()> {
    let workspace = workspace
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_workspace(project_dir, name));
    std::fs::create_dir_all(workspace.join("logs"))
        .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

    let paths = ProjectPaths::new(project_dir);
    let _lock = StoreLock::acquire(&paths)?;
    let mut store = BuildStore::load(&paths.store_file)?;
    store.submit_migration(MigrationBuild::new(
        name,
        addon,
        target_db,
        version_src,
        workspace,
    ))?;
    store.save(&paths.store_file)?;

    println!("Submitted migration build {} ({})", name, addon);
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    builds: Vec<BuildStatus>,
    migrations: Vec<MigrationStatus>,
}

pub fn cmd_status(project_dir: &Path, dest: Option<&str>, json: bool) -> Result<()> {
    let paths = ProjectPaths::new(project_dir);
    let store = BuildStore::load(&paths.store_file)?;
    let now = Utc::now();

    let report = StatusReport {
        builds: store
            .builds
            .iter()
            .filter(|b| dest.is_none_or(|d| b.dest == d))
            .map(|b| b.status(now))
            .collect(),
        migrations: store
            .migrations
            .iter()
            .filter(|m| dest.is_none_or(|d| m.name == d))
            .map(MigrationBuild::status)
            .collect(),
    };

    if let Some(d) = dest
        && report.builds.is_empty()
        && report.migrations.is_empty()
    {
        bail!("No build named {}", d);
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize status")?
        );
        return Ok(());
    }

    if report.builds.is_empty() && report.migrations.is_empty() {
        println!("No builds.");
        return Ok(());
    }

    if !report.builds.is_empty() {
        println!(
            "{:<24} {:<8} {:<6} {:<20} {:>8}  Reason",
            "Build", "State", "Result", "Step", "Elapsed"
        );
        for status in &report.builds {
            println!(
                "{:<24} {:<8} {:<6} {:<20} {:>8}  {}",
                status.dest,
                status.state,
                status.result,
                status.current_step.as_deref().unwrap_or("-"),
                status
                    .elapsed
                    .map(|s| format!("{}s", s))
                    .unwrap_or_else(|| "-".to_string()),
                status.reason.as_deref().unwrap_or("")
            );
        }
    }

    if !report.migrations.is_empty() {
        if !report.builds.is_empty() {
            println!();
        }
        println!(
            "{:<24} {:<20} {:<8} {:<6}  Container",
            "Migration", "Addon", "State", "Result"
        );
        for status in &report.migrations {
            println!(
                "{:<24} {:<20} {:<8} {:<6}  {}",
                status.name,
                status.addon,
                status.state,
                status.result.map(|r| r.as_str()).unwrap_or("-"),
                status.container.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

pub async fn cmd_kill(project_dir: &Path, cli: &Cli, dest: &str) -> Result<()> {
    let config = load_config(project_dir, cli, None)?;
    let runtime = DockerCli::from_config(&config.container);

    let paths = ProjectPaths::new(project_dir);
    let _lock = StoreLock::acquire(&paths)?;
    let mut store = BuildStore::load(&paths.store_file)?;
    let build = store
        .find_mut(dest)
        .with_context(|| format!("No build named {}", dest))?;

    if build.is_terminal() {
        println!("Build {} is already {}", dest, build.state);
        return Ok(());
    }
    build.kill(&runtime, Utc::now()).await;
    store.save(&paths.store_file)?;

    println!("Killed build {}", dest);
    Ok(())
}

pub fn cmd_reset_migration(project_dir: &Path, name: &str) -> Result<()> {
    let paths = ProjectPaths::new(project_dir);
    let _lock = StoreLock::acquire(&paths)?;
    let mut store = BuildStore::load(&paths.store_file)?;
    let migration = store
        .find_migration_mut(name)
        .with_context(|| format!("No migration build named {}", name))?;

    let removed = migration.reset()?;
    store.save(&paths.store_file)?;

    println!("Reset migration build {} ({} log files removed)", name, removed);
    Ok(())
}
