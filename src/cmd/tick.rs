//! Scheduler passes: `buildyard tick` for cron, `buildyard watch` as a loop.

use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use buildyard::build::{PortAllocator, TickContext};
use buildyard::classify::LogDefaults;
use buildyard::config::{EngineConfig, ProjectPaths};
use buildyard::container::DockerCli;
use buildyard::scheduler::{BUILD_PHASES, MIGRATION_PHASES, PassReport, SlotScheduler};
use buildyard::store::{BuildStore, StoreLock};

use super::super::Cli;
use super::load_config;

/// One locked load, pass, save cycle.
async fn run_pass(project_dir: &Path, config: &EngineConfig) -> Result<PassReport> {
    let runtime = DockerCli::from_config(&config.container);
    let defaults = LogDefaults::from_section(&config.logs)?;
    let scheduler = SlotScheduler::from_config(config)?;

    let paths = ProjectPaths::new(project_dir);
    let _lock = StoreLock::acquire(&paths)?;
    let mut store = BuildStore::load(&paths.store_file)?;

    let ports = PortAllocator::new(config.engine.base_port, store.active_ports(), true);
    let mut ctx = TickContext::new(&runtime, config, &defaults, ports);
    let mut report = scheduler
        .tick(&mut store.builds, &BUILD_PHASES, &mut ctx)
        .await;
    report.merge(
        scheduler
            .tick(&mut store.migrations, &MIGRATION_PHASES, &mut ctx)
            .await,
    );

    store.save(&paths.store_file)?;
    Ok(report)
}

pub async fn cmd_tick(project_dir: &Path, cli: &Cli, max_running: Option<usize>) -> Result<()> {
    let config = load_config(project_dir, cli, max_running)?;
    let report = run_pass(project_dir, &config).await?;

    println!(
        "Ticked {} builds, {} waiting for a slot",
        report.ticked, report.deferred
    );
    for key in &report.failed {
        println!("  failed: {}", key);
    }
    Ok(())
}

pub async fn cmd_watch(
    project_dir: &Path,
    cli: &Cli,
    interval: u64,
    max_running: Option<usize>,
    passes: Option<u64>,
) -> Result<()> {
    let config = load_config(project_dir, cli, max_running)?;
    let interval = Duration::from_secs(interval.max(1));
    info!(
        max_running = config.engine.max_running,
        interval_secs = interval.as_secs(),
        "Watching builds"
    );

    let mut done = 0u64;
    loop {
        match run_pass(project_dir, &config).await {
            Ok(report) => info!(
                ticked = report.ticked,
                deferred = report.deferred,
                failed = report.failed.len(),
                "Scheduler pass"
            ),
            Err(e) => warn!(error = %format!("{:#}", e), "Scheduler pass failed"),
        }
        done += 1;
        if passes.is_some_and(|max| done >= max) {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                break;
            }
        }
    }
    Ok(())
}
