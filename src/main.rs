use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cmd;

#[derive(Parser)]
#[command(name = "buildyard")]
#[command(version, about = "Containerized CI build engine")]
pub struct Cli {
    /// Debug logging (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Container runtime program, overrides DOCKER_CMD and engine.toml
    #[arg(long, global = true)]
    pub docker_cmd: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a steps file
    Validate {
        /// TOML file with [[steps]] tables
        steps: PathBuf,
    },
    /// Queue a build
    Submit {
        /// Build identity, prefix of container and database names
        dest: String,
        #[arg(short, long)]
        steps: PathBuf,
        /// Defaults to .buildyard/builds/<dest>
        #[arg(short, long)]
        workspace: Option<PathBuf>,
        /// Read-only checkout mounted in every step, as dest=path
        #[arg(long = "volume", value_name = "DEST=PATH")]
        volumes: Vec<String>,
        /// The build carries a database to restore
        #[arg(long)]
        restore_db: bool,
        /// Dump to restore when the step has no template database
        #[arg(long, requires = "restore_db")]
        restore_zip: Option<PathBuf>,
    },
    /// Queue a migration build
    SubmitMigration {
        name: String,
        #[arg(long)]
        addon: String,
        #[arg(long)]
        target_db: String,
        #[arg(long)]
        version_src: String,
        /// Defaults to .buildyard/builds/<name>
        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },
    /// Run one scheduler pass
    Tick {
        #[arg(long)]
        max_running: Option<usize>,
    },
    /// Run scheduler passes until interrupted
    Watch {
        /// Seconds between passes
        #[arg(long, default_value = "10")]
        interval: u64,
        #[arg(long)]
        max_running: Option<usize>,
        /// Stop after this many passes
        #[arg(long)]
        passes: Option<u64>,
    },
    /// Show builds
    Status {
        /// Only this build
        dest: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Kill a build
    Kill { dest: String },
    /// Put a done migration build back in the queue
    ResetMigration { name: String },
    /// Build the container image
    Image {
        /// Build context, defaults to the project directory
        #[arg(long)]
        context: Option<PathBuf>,
    },
    /// Print the host address of the default bridge network
    Gateway,
    /// View or validate engine.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default engine.toml
    Init,
}

fn init_tracing(verbose: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "buildyard.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr_layer)
                .init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.verbose, cli.log_dir.as_deref())?;
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Validate { steps } => cmd::cmd_validate(steps)?,
        Commands::Submit {
            dest,
            steps,
            workspace,
            volumes,
            restore_db,
            restore_zip,
        } => cmd::cmd_submit(
            &project_dir,
            cmd::SubmitArgs {
                dest,
                steps,
                workspace: workspace.as_deref(),
                volumes,
                restore_db: *restore_db,
                restore_zip: restore_zip.as_deref(),
            },
        )?,
        Commands::SubmitMigration {
            name,
            addon,
            target_db,
            version_src,
            workspace,
        } => cmd::cmd_submit_migration(
            &project_dir,
            name,
            addon,
            target_db,
            version_src,
            workspace.as_deref(),
        )?,
        Commands::Tick { max_running } => {
            cmd::cmd_tick(&project_dir, &cli, *max_running).await?;
        }
        Commands::Watch {
            interval,
            max_running,
            passes,
        } => {
            cmd::cmd_watch(&project_dir, &cli, *interval, *max_running, *passes).await?;
        }
        Commands::Status { dest, json } => cmd::cmd_status(&project_dir, dest.as_deref(), *json)?,
        Commands::Kill { dest } => cmd::cmd_kill(&project_dir, &cli, dest).await?,
        Commands::ResetMigration { name } => cmd::cmd_reset_migration(&project_dir, name)?,
        Commands::Image { context } => {
            cmd::cmd_image(&project_dir, &cli, context.as_deref()).await?;
        }
        Commands::Gateway => cmd::cmd_gateway(&project_dir, &cli).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, &cli, command.clone())?,
    }

    Ok(())
}
