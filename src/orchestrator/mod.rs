//! Experiment sequencer: drives one node-CPU-hog run from target resolution
//! through injection to verified teardown.
//!
//! Phases: `Initializing -> RampingUp -> Injecting -> Verifying ->
//! CleaningUp -> Completed`, with `Failed` reachable from any of them.
//! Cleanup is never skipped once a helper has been launched, including on
//! cancellation.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::ClusterApi;
use crate::config::{ExperimentConfig, OrchestratorSettings, SequenceMode};
use crate::error::Result;
use crate::helper::{HelperHandle, HelperLifecycleManager, HelperTemplate, deadline_after};
use crate::report::ExperimentReport;
use crate::state::{
    ExperimentPhase, ExperimentState, HelperPhase, HelperTask, StateJournal, StateRecorder,
    Verdict,
};
use crate::targets::{TargetNode, TargetResolver};
use crate::types::RunId;

const ABORTED: &str = "aborted";

enum WindowEnd {
    AllFinished,
    Expired,
    Cancelled,
}

pub struct Orchestrator {
    cluster: Arc<dyn ClusterApi>,
    recorder: Arc<dyn StateRecorder>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        recorder: Arc<dyn StateRecorder>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            cluster,
            recorder,
            settings,
        }
    }

    /// Run one experiment to a terminal phase and report its result.
    ///
    /// Per-target failures and cancellation end up in the report, not in
    /// the error: the report always says pass or fail.
    pub async fn run(
        &self,
        cfg: &ExperimentConfig,
        cancel: CancellationToken,
    ) -> Result<ExperimentReport> {
        let journal = Arc::new(StateJournal::new(
            ExperimentState::new(cfg.run_id.clone(), &cfg.experiment_name, cfg.sequence),
            self.recorder.clone(),
        ));
        info!(
            run_id = %cfg.run_id,
            experiment = %cfg.experiment_name,
            sequence = %cfg.sequence,
            duration_secs = cfg.chaos_duration.as_secs(),
            "starting experiment"
        );
        journal.set_phase(ExperimentPhase::Initializing).await;

        let resolver = TargetResolver::new(self.cluster.as_ref());
        let targets = match resolver
            .resolve(&cfg.target, cfg.affected_percentage, &cfg.run_id)
            .await
        {
            Ok(targets) => targets,
            Err(e) => {
                error!(run_id = %cfg.run_id, error = %e, "target resolution failed");
                let reason = e.to_string();
                journal
                    .update(|s| {
                        s.failure = Some(reason);
                        s.verdict = Some(Verdict::Fail);
                    })
                    .await;
                return Ok(self.finish(&journal).await);
            }
        };
        journal.update(|s| s.targets = targets.clone()).await;

        journal.set_phase(ExperimentPhase::RampingUp).await;
        let mut aborted = !self.ramp_up(cfg, &cancel).await;

        let manager = HelperLifecycleManager::new(
            self.cluster.clone(),
            journal.clone(),
            self.settings.clone(),
        );
        let mut handles: Vec<HelperHandle> = Vec::with_capacity(targets.len());

        if !aborted {
            journal.set_phase(ExperimentPhase::Injecting).await;
            let template = HelperTemplate::from_config(cfg);
            aborted = match cfg.sequence {
                SequenceMode::Serial => {
                    self.inject_serial(cfg, &manager, &template, &targets, &cancel, &mut handles)
                        .await
                }
                SequenceMode::Parallel => {
                    self.inject_parallel(cfg, &manager, &template, &targets, &cancel, &mut handles)
                        .await
                }
            };
        }

        if aborted {
            warn!(run_id = %cfg.run_id, launched = handles.len(), "experiment aborted, cleaning up");
            journal
                .update(|s| {
                    s.failure = Some(ABORTED.to_string());
                    s.verdict = Some(Verdict::Fail);
                })
                .await;
        } else {
            journal.set_phase(ExperimentPhase::Verifying).await;
            let verdict = verify(&journal.snapshot().await);
            journal.update(|s| s.verdict = Some(verdict)).await;
        }

        journal.set_phase(ExperimentPhase::CleaningUp).await;
        let results = join_all(handles.iter().map(|h| manager.teardown(h))).await;
        let failed: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err())
            .map(|e| {
                error!(run_id = %cfg.run_id, error = %e, "helper teardown failed");
                e.to_string()
            })
            .collect();
        drop(handles);

        if !failed.is_empty() {
            journal
                .update(|s| {
                    s.verdict = Some(Verdict::Fail);
                    s.failure.get_or_insert_with(|| failed.join("; "));
                })
                .await;
        }

        Ok(self.finish(&journal).await)
    }

    /// Wait out the ramp time. Returns `false` if cancelled.
    async fn ramp_up(&self, cfg: &ExperimentConfig, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        if cfg.ramp_time.is_zero() {
            return true;
        }

        info!(run_id = %cfg.run_id, ramp_secs = cfg.ramp_time.as_secs(), "waiting for ramp time");
        tokio::select! {
            _ = tokio::time::sleep(cfg.ramp_time) => true,
            _ = cancel.cancelled() => false,
        }
    }

    /// Launch one helper at a time, each only after the previous one has an
    /// outcome and the inter-target delay has passed. Returns `true` if
    /// cancelled.
    async fn inject_serial(
        &self,
        cfg: &ExperimentConfig,
        manager: &HelperLifecycleManager,
        template: &HelperTemplate,
        targets: &[TargetNode],
        cancel: &CancellationToken,
        handles: &mut Vec<HelperHandle>,
    ) -> bool {
        for (i, target) in targets.iter().enumerate() {
            if i > 0 && !cfg.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(cfg.delay) => {}
                    _ = cancel.cancelled() => return true,
                }
            }
            if cancel.is_cancelled() {
                return true;
            }

            let mut handle = match manager.launch(target, template).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(node = %target.name, error = %e, "continuing with remaining targets");
                    continue;
                }
            };

            let cancelled = tokio::select! {
                _ = handle.finished() => false,
                _ = cancel.cancelled() => true,
            };
            if cancelled {
                handle.stop(ABORTED).await;
                handles.push(handle);
                return true;
            }
            handles.push(handle);
        }
        false
    }

    /// Launch every helper, then wait for all of them within the chaos
    /// window. Returns `true` if cancelled.
    async fn inject_parallel(
        &self,
        cfg: &ExperimentConfig,
        manager: &HelperLifecycleManager,
        template: &HelperTemplate,
        targets: &[TargetNode],
        cancel: &CancellationToken,
        handles: &mut Vec<HelperHandle>,
    ) -> bool {
        for target in targets {
            if cancel.is_cancelled() {
                break;
            }
            match manager.launch(target, template).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!(node = %target.name, error = %e, "continuing with remaining targets");
                }
            }
        }

        // Monitors enforce the per-helper bound themselves; the window
        // closes one poll later so their verdict lands first.
        let window_end = deadline_after(
            Instant::now(),
            cfg.helper_bound().saturating_add(self.settings.poll_interval),
        );
        let end = if cancel.is_cancelled() {
            WindowEnd::Cancelled
        } else {
            let all = join_all(handles.iter_mut().map(|h| h.finished()));
            tokio::select! {
                _ = all => WindowEnd::AllFinished,
                _ = tokio::time::sleep_until(window_end) => WindowEnd::Expired,
                _ = cancel.cancelled() => WindowEnd::Cancelled,
            }
        };

        match end {
            WindowEnd::AllFinished => false,
            WindowEnd::Expired => {
                warn!(run_id = %cfg.run_id, "chaos window expired, stopping remaining helpers");
                stop_all(handles, "chaos window expired").await;
                false
            }
            WindowEnd::Cancelled => {
                stop_all(handles, ABORTED).await;
                true
            }
        }
    }

    async fn finish(&self, journal: &StateJournal) -> ExperimentReport {
        let mut phase = ExperimentPhase::Failed;
        journal.update(|s| phase = s.finish()).await;

        let state = journal.snapshot().await;
        let report = ExperimentReport::from_state(&state);
        info!(
            run_id = %state.run_id,
            phase = %phase,
            result = ?report.result,
            reason = report.reason.as_deref().unwrap_or(""),
            "experiment finished"
        );
        report
    }

    /// Re-enter cleanup for a persisted run and remove every helper that
    /// was never confirmed gone.
    pub async fn recover(&self, run_id: &RunId, grace: Duration) -> Result<ExperimentReport> {
        let state = self.recorder.load(run_id).await?;
        let pending: Vec<HelperTask> = state
            .tasks
            .iter()
            .filter(|t| t.needs_teardown())
            .cloned()
            .collect();
        info!(run_id = %run_id, phase = %state.phase, pending = pending.len(), "recovering experiment");

        let journal = Arc::new(StateJournal::new(state, self.recorder.clone()));
        journal.set_phase(ExperimentPhase::CleaningUp).await;

        let manager = HelperLifecycleManager::new(
            self.cluster.clone(),
            journal.clone(),
            self.settings.clone(),
        );
        let results = join_all(
            pending
                .into_iter()
                .map(|task| manager.teardown_detached(task, grace)),
        )
        .await;
        let failed: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err())
            .map(|e| e.to_string())
            .collect();

        journal
            .update(|s| {
                if s.verdict.is_none() {
                    s.verdict = Some(Verdict::Fail);
                    s.failure
                        .get_or_insert_with(|| "interrupted before completion".to_string());
                }
                if !failed.is_empty() {
                    s.failure = Some(failed.join("; "));
                }
            })
            .await;

        Ok(self.finish(&journal).await)
    }

    /// Recover every persisted run that still has helpers to remove.
    pub async fn recover_all(&self, grace: Duration) -> Result<Vec<ExperimentReport>> {
        let runs = self.recorder.runs_needing_cleanup().await?;
        info!(runs = runs.len(), "recovering experiments with pending cleanup");

        let mut reports = Vec::with_capacity(runs.len());
        for state in runs {
            match self.recover(&state.run_id, grace).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(run_id = %state.run_id, error = %e, "recovery failed"),
            }
        }
        Ok(reports)
    }

    pub async fn show(&self, run_id: &RunId) -> Result<ExperimentState> {
        Ok(self.recorder.load(run_id).await?)
    }
}

/// Pass only if every target's helper ran its full window.
fn verify(state: &ExperimentState) -> Verdict {
    let mut verdict = Verdict::Pass;
    for target in &state.targets {
        let outcome = state.task(&target.name).and_then(|t| t.outcome);
        if outcome == Some(HelperPhase::Succeeded) {
            info!(node = %target.name, "target passed");
        } else {
            warn!(node = %target.name, outcome = ?outcome, "target failed");
            verdict = Verdict::Fail;
        }
    }
    if state.targets.is_empty() {
        verdict = Verdict::Fail;
    }
    verdict
}

async fn stop_all(handles: &[HelperHandle], reason: &str) {
    join_all(handles.iter().map(|h| h.stop(reason))).await;
}
