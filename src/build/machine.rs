//! Step-based build lifecycle.
//!
//! `pending -> testing -> running -> done`, with `killed` reachable from any
//! active state. One tick does at most one transition per finished step, plus
//! any number of skipped steps.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use buildyard_common::{BuildState, Verdict};

use super::dispatch::step_command;
use super::sidecar::write_commit_hashes;
use super::{Build, Failure, KillReason, TickContext, create_logs_dir};
use crate::classify::ClassifyRules;
use crate::container::ContainerRuntime;
use crate::errors::DispatchError;
use crate::steps::next_step;

impl Build {
    /// Advance the build by one step of its lifecycle. Terminal builds are left alone.
    pub async fn tick(&mut self, ctx: &mut TickContext<'_>) {
        match self.state {
            BuildState::Done | BuildState::Killed => {}
            BuildState::Pending => self.start(ctx).await,
            BuildState::Testing | BuildState::Running => self.poll(ctx).await,
        }
    }

    /// Stop the build now. No-op on a terminal build.
    pub async fn kill(&mut self, runtime: &dyn ContainerRuntime, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        if let Some(name) = self.container.take() {
            runtime.stop_container(&name).await;
        }
        info!(build = %self.dest, "Build killed on request");
        self.terminate(KillReason::Requested, now);
    }

    fn terminate(&mut self, reason: KillReason, now: DateTime<Utc>) {
        self.container = None;
        self.state = BuildState::Killed;
        self.result = Verdict::Ko;
        self.kill_reason = Some(reason);
        self.finished_at = Some(now);
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        info!(build = %self.dest, result = %self.result, "Build done");
        self.state = BuildState::Done;
        self.current_step = None;
        self.container = None;
        self.finished_at = Some(now);
    }

    fn abort_dispatch(&mut self, step: String, err: DispatchError, now: DateTime<Utc>) {
        error!(build = %self.dest, step = %step, error = %err, "Failed to start step");
        self.terminate(
            KillReason::DispatchFailed {
                step,
                message: err.to_string(),
            },
            now,
        );
    }

    async fn start(&mut self, ctx: &mut TickContext<'_>) {
        let first = self.steps.first().map(|s| s.name.clone()).unwrap_or_default();
        let prepared = ctx
            .ports
            .allocate()
            .and_then(|port| create_logs_dir(&self.logs_dir()).map(|()| port));
        match prepared {
            Ok(port) => {
                info!(build = %self.dest, port, "Starting build");
                self.port = Some(port);
                self.state = BuildState::Testing;
                self.advance_to(0, ctx).await;
            }
            Err(e) => self.abort_dispatch(first, e, ctx.now),
        }
    }

    /// Dispatch step `index`, moving straight past steps with nothing to do.
    async fn advance_to(&mut self, index: usize, ctx: &mut TickContext<'_>) {
        let mut index = index;
        loop {
            self.current_step = Some(index);
            self.step_started_at = Some(ctx.now);
            self.container = None;
            if index + 1 == self.steps.len() && self.steps.len() > 1 {
                self.state = BuildState::Running;
            }

            match self.dispatch(index, ctx).await {
                Ok(Some(name)) => {
                    self.container = Some(name);
                    return;
                }
                Ok(None) => {
                    info!(build = %self.dest, step = %self.steps[index].name, "Nothing to do, skipping step");
                    match next_step(&self.steps, index) {
                        Some(next) => index = next,
                        None => {
                            self.finish(ctx.now);
                            return;
                        }
                    }
                }
                Err(e) => {
                    let step = self.steps[index].name.clone();
                    self.abort_dispatch(step, e, ctx.now);
                    return;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        index: usize,
        ctx: &TickContext<'_>,
    ) -> Result<Option<String>, DispatchError> {
        let step = &self.steps[index];
        let Some((command, options)) = step_command(self, step, ctx.config)? else {
            return Ok(None);
        };

        let log_path = self.log_path(step);
        write_commit_hashes(&log_path, &options.ro_volumes)?;
        info!(build = %self.dest, step = %step.name, job = %step.job_type, "Running step");
        let name = ctx
            .runtime
            .run_container(
                &command,
                &log_path,
                &self.workspace,
                &self.container_name(step),
                &options,
            )
            .await?;
        Ok(Some(name))
    }

    async fn poll(&mut self, ctx: &mut TickContext<'_>) {
        let Some(index) = self.current_step.filter(|&i| i < self.steps.len()) else {
            warn!(build = %self.dest, "Active build has no current step, closing it");
            self.finish(ctx.now);
            return;
        };
        let step = self.steps[index].clone();

        if let Some(name) = self.container.clone()
            && ctx.runtime.is_running(&name).await
        {
            let elapsed = self.elapsed(ctx.now).unwrap_or_default();
            let limit = ctx.config.engine.timeout;
            let is_last = index + 1 == self.steps.len();
            if !is_last && elapsed > limit as i64 {
                warn!(build = %self.dest, step = %step.name, elapsed, "Step time exceeded ({}s)", limit);
                ctx.runtime.stop_container(&name).await;
                self.terminate(
                    KillReason::Timeout {
                        step: step.name.clone(),
                        elapsed_secs: elapsed,
                        limit_secs: limit,
                    },
                    ctx.now,
                );
            }
            return;
        }

        info!(build = %self.dest, step = %step.name, "Step finished");
        let classification = match ClassifyRules::for_step(&step, ctx.log_defaults) {
            Ok(rules) => rules.classify(&self.log_path(&step)),
            Err(e) => {
                self.abort_dispatch(step.name.clone(), e.into(), ctx.now);
                return;
            }
        };

        let verdict = classification.verdict;
        self.result = self.result.combine(verdict);
        let replaces = match &self.failure {
            None => verdict != Verdict::Ok,
            Some(previous) => verdict > previous.verdict,
        };
        if replaces {
            self.failure = Some(Failure {
                step: step.name.clone(),
                verdict,
                cause: classification.cause.clone(),
                excerpt: classification.excerpt.clone(),
            });
        }
        info!(build = %self.dest, step = %step.name, verdict = %verdict, "Step classified");

        if verdict.is_failure() {
            self.finish(ctx.now);
            return;
        }
        match next_step(&self.steps, index) {
            Some(next) => self.advance_to(next, ctx).await,
            None => self.finish(ctx.now),
        }
    }
}
