//! Slot scheduler: advances many builds per pass under a global container limit.
//!
//! A pass visits lifecycle phases in forward order. Phases that start a new
//! container (admission phases) admit builds until `free_slots` of them hold
//! a container; polling phases take every build. Phases are read once at the start of the pass,
//! so a build moves at most one tick per pass.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use regex::Regex;
use tracing::{debug, error, info};

use buildyard_common::{BuildState, MigrationPhase};

use crate::build::{Build, MigrationBuild, TickContext};
use crate::config::EngineConfig;
use crate::container::ContainerRuntime;

/// Anything the scheduler can advance.
#[async_trait]
pub trait Tickable: Send {
    type Phase: Copy + Eq + fmt::Display + Send + Sync;

    fn key(&self) -> &str;

    fn phase(&self) -> Self::Phase;

    /// Whether a container is attached after the last tick.
    fn holds_container(&self) -> bool;

    async fn tick(&mut self, ctx: &mut TickContext<'_>);
}

#[async_trait]
impl Tickable for Build {
    type Phase = BuildState;

    fn key(&self) -> &str {
        &self.dest
    }

    fn phase(&self) -> BuildState {
        self.state
    }

    fn holds_container(&self) -> bool {
        self.container.is_some()
    }

    async fn tick(&mut self, ctx: &mut TickContext<'_>) {
        Build::tick(self, ctx).await
    }
}

#[async_trait]
impl Tickable for MigrationBuild {
    type Phase = MigrationPhase;

    fn key(&self) -> &str {
        &self.name
    }

    fn phase(&self) -> MigrationPhase {
        self.state
    }

    fn holds_container(&self) -> bool {
        self.container.is_some()
    }

    async fn tick(&mut self, ctx: &mut TickContext<'_>) {
        MigrationBuild::tick(self, ctx).await
    }
}

/// One phase of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhasePlan<P> {
    pub phase: P,
    /// Ticking a build in this phase starts a container
    pub admission: bool,
}

/// Only pending builds start a container; the others are polled.
pub const BUILD_PHASES: [PhasePlan<BuildState>; 3] = [
    PhasePlan {
        phase: BuildState::Pending,
        admission: true,
    },
    PhasePlan {
        phase: BuildState::Testing,
        admission: false,
    },
    PhasePlan {
        phase: BuildState::Running,
        admission: false,
    },
];

/// Every migration phase but the last starts the next container.
pub const MIGRATION_PHASES: [PhasePlan<MigrationPhase>; 4] = [
    PhasePlan {
        phase: MigrationPhase::Pending,
        admission: true,
    },
    PhasePlan {
        phase: MigrationPhase::Base,
        admission: true,
    },
    PhasePlan {
        phase: MigrationPhase::Addon,
        admission: true,
    },
    PhasePlan {
        phase: MigrationPhase::Migrate,
        admission: false,
    },
];

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub ticked: usize,
    /// Builds left waiting for a slot
    pub deferred: usize,
    /// Builds whose tick panicked
    pub failed: Vec<String>,
}

impl PassReport {
    pub fn merge(&mut self, other: PassReport) {
        self.ticked += other.ticked;
        self.deferred += other.deferred;
        self.failed.extend(other.failed);
    }
}

/// `max_running` minus the running containers that match, never below 1.
///
/// The floor keeps the queue moving when containers outside the engine's
/// control fill the host; it does not guarantee the limit is respected.
pub fn free_slots<F>(max_running: usize, running: &[String], occupies_slot: F) -> usize
where
    F: Fn(&str) -> bool,
{
    let used = running.iter().filter(|name| occupies_slot(name)).count();
    max_running.saturating_sub(used).max(1)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct SlotScheduler {
    max_running: usize,
    slot_pattern: Option<Regex>,
}

impl SlotScheduler {
    pub fn new(max_running: usize, slot_pattern: Option<Regex>) -> Self {
        Self {
            max_running,
            slot_pattern,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self::new(config.engine.max_running, config.slot_regex()?))
    }

    /// Without a slot pattern every running container counts.
    pub fn occupies_slot(&self, name: &str) -> bool {
        self.slot_pattern
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(name))
    }

    pub async fn free_slots(&self, runtime: &dyn ContainerRuntime) -> usize {
        let running = runtime.list_running_names().await;
        free_slots(self.max_running, &running, |name| self.occupies_slot(name))
    }

    /// Run one pass over `items` following `plan`.
    pub async fn tick<T: Tickable>(
        &self,
        items: &mut [T],
        plan: &[PhasePlan<T::Phase>],
        ctx: &mut TickContext<'_>,
    ) -> PassReport {
        let snapshot: Vec<T::Phase> = items.iter().map(|item| item.phase()).collect();
        let mut report = PassReport::default();

        for step in plan {
            let eligible: Vec<usize> = snapshot
                .iter()
                .enumerate()
                .filter(|(_, phase)| **phase == step.phase)
                .map(|(i, _)| i)
                .collect();
            if eligible.is_empty() {
                continue;
            }

            let limit = if step.admission {
                self.free_slots(ctx.runtime).await
            } else {
                eligible.len()
            };

            // A build whose launch failed does not use up a slot
            let mut admitted = 0;
            let mut visited = 0;
            for &index in &eligible {
                if admitted >= limit {
                    break;
                }
                visited += 1;
                let item = &mut items[index];
                let key = item.key().to_string();
                let outcome = AssertUnwindSafe(item.tick(ctx)).catch_unwind().await;
                match outcome {
                    Ok(()) => {
                        report.ticked += 1;
                        if !step.admission || item.holds_container() {
                            admitted += 1;
                        }
                    }
                    Err(panic) => {
                        error!(build = %key, phase = %step.phase, "Tick failed: {}", panic_message(panic.as_ref()));
                        report.failed.push(key);
                    }
                }
            }

            let waiting = eligible.len() - visited;
            if waiting > 0 {
                debug!(phase = %step.phase, waiting, "Not enough free slots");
                report.deferred += waiting;
            }
        }

        if report.ticked > 0 || report.deferred > 0 {
            info!(
                ticked = report.ticked,
                deferred = report.deferred,
                failed = report.failed.len(),
                "Scheduler pass complete"
            );
        }
        report
    }
}
