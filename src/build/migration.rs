//! Phase-based migration builds.
//!
//! Each build installs `base` with the source version, copies that database
//! and installs one addon on it, then upgrades everything with the target
//! version and the migration scripts mounted. The update log decides the
//! result: it must say `Modules loaded.`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use buildyard_common::{MigrationPhase, Verdict};

use super::sidecar::write_commit_hashes;
use super::{TickContext, create_logs_dir};
use crate::classify::read_log;
use crate::config::MigrationSection;
use crate::container::{CONTAINER_WORKSPACE, RunOptions, ShellCommand};
use crate::errors::DispatchError;

const MIGRATION_SUCCESS: &str = "Modules loaded.";

const MIGRATE_LOG_HANDLERS: &[&str] = &[
    ":INFO",
    "odoo.models.schema:INFO",
    "odoo.modules.loading:DEBUG",
    "odoo.modules.graph:CRITICAL",
    "odoo.modules.migration:DEBUG",
    "odoo.tools.misc:INFO",
    "odoo.addons.base.maintenance.migrations:DEBUG",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationBuild {
    pub name: String,
    pub addon: String,
    pub target_db: String,
    pub version_src: String,
    pub workspace: PathBuf,
    pub state: MigrationPhase,
    /// `None` until the build is done
    #[serde(default)]
    pub result: Option<Verdict>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub template_db: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub name: String,
    pub addon: String,
    pub state: MigrationPhase,
    pub result: Option<Verdict>,
    pub container: Option<String>,
    pub reason: Option<String>,
}

impl MigrationBuild {
    pub fn new(
        name: impl Into<String>,
        addon: impl Into<String>,
        target_db: impl Into<String>,
        version_src: impl Into<String>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            addon: addon.into(),
            target_db: target_db.into(),
            version_src: version_src.into(),
            workspace: workspace.into(),
            state: MigrationPhase::Pending,
            result: None,
            container: None,
            template_db: None,
            reason: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.workspace.join("logs")
    }

    pub fn log_path(&self, phase: MigrationPhase) -> Option<PathBuf> {
        let prefix = match phase {
            MigrationPhase::Base => "base",
            MigrationPhase::Addon => "addon",
            MigrationPhase::Migrate => "update",
            MigrationPhase::Pending | MigrationPhase::Done => return None,
        };
        Some(self.logs_dir().join(format!("{}_{}.txt", prefix, self.name)))
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn status(&self) -> MigrationStatus {
        MigrationStatus {
            name: self.name.clone(),
            addon: self.addon.clone(),
            state: self.state,
            result: self.result,
            container: self.container.clone(),
            reason: self.reason.clone(),
        }
    }

    /// Advance by one phase once the current container has exited.
    pub async fn tick(&mut self, ctx: &mut TickContext<'_>) {
        if self.is_terminal() {
            return;
        }
        if let Some(name) = &self.container
            && ctx.runtime.is_running(name).await
        {
            return;
        }

        let next = match self.state {
            MigrationPhase::Pending => MigrationPhase::Base,
            MigrationPhase::Base => MigrationPhase::Addon,
            MigrationPhase::Addon => MigrationPhase::Migrate,
            MigrationPhase::Migrate => {
                self.finish(ctx.now);
                return;
            }
            MigrationPhase::Done => return,
        };

        if let Err(e) = self.launch(next, ctx).await {
            error!(migration = %self.name, phase = %next, error = %e, "Migration phase failed to start");
            self.state = MigrationPhase::Done;
            self.result = Some(Verdict::Ko);
            self.container = None;
            self.reason = Some(format!("Phase {} failed to start: {}", next, e));
            self.finished_at = Some(ctx.now);
        }
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        let verdict = match self.log_path(MigrationPhase::Migrate).map(|p| read_log(&p)) {
            Some(Ok(content)) if content.contains(MIGRATION_SUCCESS) => Verdict::Ok,
            Some(Ok(_)) => {
                self.reason = Some("Update log has no 'Modules loaded.'".to_string());
                Verdict::Ko
            }
            Some(Err(e)) => {
                self.reason = Some(e.to_string());
                Verdict::Ko
            }
            None => Verdict::Ko,
        };
        info!(migration = %self.name, result = %verdict, "Migration done");
        self.state = MigrationPhase::Done;
        self.result = Some(verdict);
        self.container = None;
        self.finished_at = Some(now);
    }

    /// Database a phase works on.
    fn database(&self, phase: MigrationPhase) -> String {
        match phase {
            MigrationPhase::Base => format!("{}-base", self.name),
            _ => self.name.clone(),
        }
    }

    /// Read-only mounts: addon checkouts and the server for `version`.
    fn volumes(&self, section: &MigrationSection, version: &str) -> BTreeMap<String, PathBuf> {
        let mut volumes = BTreeMap::new();
        for dir in &section.addons_dirs {
            let repo = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| dir.display().to_string());
            volumes.insert(format!("addons/{}", repo), dir.join(version));
        }
        volumes
    }

    /// The full command for `phase`.
    pub fn phase_command(
        &self,
        phase: MigrationPhase,
        section: &MigrationSection,
    ) -> (ShellCommand, RunOptions) {
        let db = self.database(phase);
        let version = match phase {
            MigrationPhase::Migrate => section.version_target.as_str(),
            _ => self.version_src.as_str(),
        };
        let addons = self.volumes(section, version);

        let mut cmd = ShellCommand::new(format!("{} odoo/odoo-bin --no-http", section.python));
        if let Some(user) = &section.db_user {
            cmd.push_args(&format!("-r {}", user));
        }
        cmd.push_args(&format!("-d {}", db));
        match phase {
            MigrationPhase::Base => cmd.push_args("-i base"),
            MigrationPhase::Addon => cmd.push_args(&format!("-i {}", self.addon)),
            _ => {
                cmd.push_args(&format!("-u all --db-filter=^{}$", db));
                for handler in MIGRATE_LOG_HANDLERS {
                    cmd.push_args(&format!("--log-handler={}", handler));
                }
            }
        }
        cmd.push_args("--stop-after-init --max-cron-threads=0");
        let addons_path: Vec<String> = std::iter::once(format!("{}/odoo/addons", CONTAINER_WORKSPACE))
            .chain(addons.keys().cloned())
            .collect();
        cmd.push_args(&format!("--addons-path {}", addons_path.join(",")));

        match phase {
            MigrationPhase::Base => {
                cmd = cmd.with_pre(format!("dropdb --if-exists {}", db));
            }
            MigrationPhase::Addon => {
                let template = self.database(MigrationPhase::Base);
                cmd = cmd
                    .with_pre(format!("dropdb --if-exists {}", db))
                    .with_pre(format!("createdb -T {} {}", template, db));
                if let Some(country) = self.addon.strip_prefix("l10n_").and_then(|r| r.split('_').next()) {
                    let mut update = format!(
                        "psql -d \"{}\" -c \"UPDATE res_partner SET country_id = (SELECT id FROM res_country WHERE lower(code)='{}')\"",
                        db, country
                    );
                    if let Some(user) = &section.db_user {
                        update.push_str(&format!(" -U {}", user));
                    }
                    cmd = cmd.with_pre(update);
                }
            }
            _ => {}
        }

        let mut options = RunOptions {
            ro_volumes: addons,
            ..Default::default()
        };
        options
            .ro_volumes
            .insert("odoo".to_string(), section.servers_dir.join(version));
        if phase == MigrationPhase::Migrate {
            options.ro_volumes.insert(
                "migration_scripts".to_string(),
                section.migration_scripts_dir.clone(),
            );
        }
        (cmd, options)
    }

    async fn launch(
        &mut self,
        phase: MigrationPhase,
        ctx: &TickContext<'_>,
    ) -> Result<(), DispatchError> {
        create_logs_dir(&self.logs_dir())?;
        let Some(log_path) = self.log_path(phase) else {
            return Ok(());
        };
        let (command, options) = self.phase_command(phase, &ctx.config.migration);
        let db = self.database(phase);

        self.state = phase;
        self.template_db = match phase {
            MigrationPhase::Addon => Some(self.database(MigrationPhase::Base)),
            _ => None,
        };
        let name = format!("{}-{}", db, phase);
        self.container = Some(name.clone());

        write_commit_hashes(&log_path, &options.ro_volumes)?;
        info!(migration = %self.name, phase = %phase, db = %db, "Launching migration phase");
        ctx.runtime
            .run_container(&command, &log_path, &self.workspace, &name, &options)
            .await?;
        Ok(())
    }

    /// Put a finished build back to `pending` and delete its logs.
    /// Returns how many files were removed.
    pub fn reset(&mut self) -> Result<usize> {
        if !self.is_terminal() {
            bail!(
                "Migration {} is still in phase {}, only done builds can be reset",
                self.name,
                self.state
            );
        }
        let removed = clean_logs(&self.logs_dir(), &self.name)?;
        self.state = MigrationPhase::Pending;
        self.result = None;
        self.container = None;
        self.template_db = None;
        self.reason = None;
        self.finished_at = None;
        Ok(removed)
    }
}

/// Prefixes of the per-phase logs, see [`MigrationBuild::log_path`].
const LOG_PREFIXES: [&str; 3] = ["base", "addon", "update"];

/// Remove the phase logs of migration `name` from `logs_dir`, sidecars included.
pub fn clean_logs(logs_dir: &Path, name: &str) -> Result<usize> {
    if !logs_dir.is_dir() {
        return Ok(0);
    }
    let dir = glob::Pattern::escape(&logs_dir.to_string_lossy());
    let name = glob::Pattern::escape(name);
    let mut removed = 0;
    for prefix in LOG_PREFIXES {
        let pattern = format!("{}/{}_{}.txt*", dir, prefix, name);
        for entry in glob::glob(&pattern).context("Invalid log glob pattern")? {
            let path = entry.context("Failed to read log directory entry")?;
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}
