//! On-disk build records, `.buildyard/builds.json`.
//!
//! Every command that touches the store holds an exclusive lock on
//! `.buildyard/builds.lock` for its whole duration, so overlapping cron
//! invocations run one after the other.

use std::fs::{self, File, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::build::{Build, MigrationBuild};
use crate::config::ProjectPaths;

/// Held for as long as the store may be read and written.
pub struct StoreLock {
    file: File,
}

impl StoreLock {
    /// Block until the exclusive lock is ours.
    pub fn acquire(paths: &ProjectPaths) -> Result<Self> {
        paths.ensure_directories()?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&paths.lock_file)
            .with_context(|| format!("Failed to open lock file {}", paths.lock_file.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", paths.lock_file.display()))?;
        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildStore {
    #[serde(default)]
    pub builds: Vec<Build>,
    #[serde(default)]
    pub migrations: Vec<MigrationBuild>,
}

impl BuildStore {
    /// Load the store; a missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read build store {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse build store {}", path.display()))
    }

    /// Write through a temporary file and rename, so readers never see half a store.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize build store")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write build store {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace build store {}", path.display()))?;
        Ok(())
    }

    pub fn find(&self, dest: &str) -> Option<&Build> {
        self.builds.iter().find(|b| b.dest == dest)
    }

    pub fn find_mut(&mut self, dest: &str) -> Option<&mut Build> {
        self.builds.iter_mut().find(|b| b.dest == dest)
    }

    pub fn find_migration_mut(&mut self, name: &str) -> Option<&mut MigrationBuild> {
        self.migrations.iter_mut().find(|m| m.name == name)
    }

    /// Add a build. A `dest` may be reused only once its previous build is terminal.
    pub fn submit(&mut self, build: Build) -> Result<()> {
        if let Some(existing) = self.find(&build.dest) {
            if !existing.is_terminal() {
                bail!(
                    "Build {} is still {}, kill it before submitting again",
                    build.dest,
                    existing.state
                );
            }
            self.builds.retain(|b| b.dest != build.dest);
        }
        self.builds.push(build);
        Ok(())
    }

    pub fn submit_migration(&mut self, migration: MigrationBuild) -> Result<()> {
        if self.migrations.iter().any(|m| m.name == migration.name) {
            bail!("Migration build {} already exists", migration.name);
        }
        self.migrations.push(migration);
        Ok(())
    }

    /// Ports held by builds that are not terminal.
    pub fn active_ports(&self) -> Vec<u16> {
        self.builds
            .iter()
            .filter(|b| !b.is_terminal())
            .filter_map(|b| b.port)
            .flat_map(|p| std::iter::once(p).chain(p.checked_add(1)))
            .collect()
    }
}
