//! Per-helper monitor task.
//!
//! The monitor owns its `HelperTask`. It polls the cluster until the helper
//! reaches an outcome, then stays alive to serve teardown requests. Every
//! transition is published on a watch channel and written to the journal.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterApi, WorkloadStatus};
use crate::error::{ClusterError, HelperError};
use crate::retry::RetryPolicy;
use crate::state::{HelperPhase, HelperTask, StateJournal};
use crate::types::WorkloadId;

pub(crate) enum Control {
    /// Stop watching; an unfinished helper is recorded as failed.
    Stop(String),
    Teardown(oneshot::Sender<Result<HelperTask, HelperError>>),
}

/// Timing knobs shared by every monitor of a run.
#[derive(Debug, Clone)]
pub(crate) struct MonitorTiming {
    pub poll_interval: Duration,
    /// Intended runtime; a clean exit before this is premature.
    pub duration: Duration,
    /// Hard runtime bound (duration + timeout).
    pub bound: Duration,
    pub termination_grace: Duration,
    pub teardown_retry: RetryPolicy,
}

pub(crate) struct Monitor {
    pub cluster: Arc<dyn ClusterApi>,
    pub journal: Arc<StateJournal>,
    pub task: HelperTask,
    pub workload: WorkloadId,
    pub launched: Instant,
    pub timing: MonitorTiming,
    pub state: watch::Sender<HelperTask>,
    pub control: mpsc::Receiver<Control>,
}

impl Monitor {
    pub async fn run(mut self) {
        let deadline = super::deadline_after(self.launched, self.timing.bound);
        let timeout = tokio::time::sleep_until(deadline);
        tokio::pin!(timeout);

        let mut ticker = tokio::time::interval(self.timing.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Control requests first, then the hard bound, then polling.
            tokio::select! {
                biased;

                cmd = self.control.recv() => match cmd {
                    Some(Control::Stop(reason)) => {
                        self.finish(HelperPhase::Failed, None, reason).await;
                        break;
                    }
                    Some(Control::Teardown(reply)) => {
                        self.finish(HelperPhase::Failed, None, "torn down before completion".to_string()).await;
                        let _ = reply.send(self.teardown().await);
                        break;
                    }
                    None => {
                        self.finish(HelperPhase::Failed, None, "helper handle dropped".to_string()).await;
                        break;
                    }
                },
                _ = &mut timeout => {
                    let err = HelperError::Timeout {
                        workload: self.workload.clone(),
                        bound_secs: self.timing.bound.as_secs(),
                    };
                    self.finish(HelperPhase::TimedOut, None, err.to_string()).await;
                    break;
                }
                _ = ticker.tick() => {
                    if self.poll().await {
                        break;
                    }
                }
            }
        }

        while let Some(cmd) = self.control.recv().await {
            match cmd {
                Control::Stop(_) => {}
                Control::Teardown(reply) => {
                    let _ = reply.send(self.teardown().await);
                }
            }
        }

        // The handle is gone. Never leave a workload behind.
        if self.task.needs_teardown() && !self.task.cleanup_pending {
            warn!(node = %self.task.node, workload = %self.workload, "handle dropped before teardown, cleaning up");
            let _ = self.teardown().await;
        }
    }

    /// One status poll. Returns `true` once the helper has an outcome.
    async fn poll(&mut self) -> bool {
        let status = match self.cluster.workload_status(&self.workload).await {
            Ok(status) => status,
            Err(e) => {
                warn!(node = %self.task.node, workload = %self.workload, error = %e, "helper status poll failed");
                return false;
            }
        };
        debug!(node = %self.task.node, workload = %self.workload, ?status, "helper status");

        match status {
            WorkloadStatus::Pending => false,
            WorkloadStatus::Running => {
                self.transition(HelperPhase::Running).await;
                false
            }
            WorkloadStatus::Succeeded => {
                let ran_for = self.launched.elapsed();
                if ran_for < self.timing.duration {
                    let err = HelperError::Execution {
                        workload: self.workload.clone(),
                        reason: format!(
                            "exited after {}s, before the {}s chaos duration",
                            ran_for.as_secs(),
                            self.timing.duration.as_secs()
                        ),
                    };
                    self.finish(HelperPhase::Failed, Some(0), err.to_string()).await;
                } else {
                    self.finish(HelperPhase::Succeeded, Some(0), "completed".to_string()).await;
                }
                true
            }
            WorkloadStatus::Failed { exit_code, reason } => {
                let err = HelperError::Execution {
                    workload: self.workload.clone(),
                    reason,
                };
                self.finish(HelperPhase::Failed, exit_code, err.to_string()).await;
                true
            }
            WorkloadStatus::Unschedulable(reason) => {
                let err = HelperError::Scheduling {
                    node: self.task.node.clone(),
                    reason,
                };
                self.finish(HelperPhase::Failed, None, err.to_string()).await;
                true
            }
            WorkloadStatus::Gone => {
                self.finish(HelperPhase::Failed, None, "workload disappeared".to_string()).await;
                true
            }
        }
    }

    async fn transition(&mut self, phase: HelperPhase) {
        let from = self.task.phase;
        if self.task.transition(phase) {
            info!(node = %self.task.node, workload = %self.workload, from = %from, to = %phase, "helper phase transition");
            self.publish().await;
        }
    }

    /// Record the helper's outcome unless it already has one.
    async fn finish(&mut self, phase: HelperPhase, exit_code: Option<i32>, reason: String) {
        if self.task.phase.is_terminal() {
            return;
        }
        if phase != HelperPhase::Succeeded {
            warn!(node = %self.task.node, workload = %self.workload, ?exit_code, %reason, "helper did not succeed");
        }
        self.task.exit_code = exit_code;
        self.task.exit_reason = Some(reason);
        self.transition(phase).await;
    }

    async fn publish(&self) {
        self.state.send_replace(self.task.clone());
        self.journal.record_task(&self.task).await;
    }

    async fn teardown(&mut self) -> Result<HelperTask, HelperError> {
        let result = teardown_task(
            self.cluster.as_ref(),
            &self.journal,
            &mut self.task,
            &self.timing.teardown_retry,
            self.timing.termination_grace,
            self.timing.poll_interval,
        )
        .await;
        self.publish().await;
        result.map(|_| self.task.clone())
    }
}

/// Delete a workload and wait up to `grace` for it to disappear, forcing
/// removal if it is still present afterwards.
async fn delete_and_confirm(
    cluster: &dyn ClusterApi,
    workload: &WorkloadId,
    grace: Duration,
    poll_interval: Duration,
) -> Result<(), ClusterError> {
    cluster.delete_workload(workload, grace).await?;

    let confirm_by = super::deadline_after(Instant::now(), grace);
    loop {
        if cluster.workload_status(workload).await? == WorkloadStatus::Gone {
            return Ok(());
        }
        let now = Instant::now();
        if now >= confirm_by {
            break;
        }
        tokio::time::sleep(poll_interval.min(confirm_by - now)).await;
    }

    warn!(workload = %workload, grace_secs = grace.as_secs(), "graceful deletion did not complete, forcing removal");
    cluster.delete_workload(workload, Duration::ZERO).await?;
    match cluster.workload_status(workload).await? {
        WorkloadStatus::Gone => Ok(()),
        other => Err(ClusterError::Api(format!(
            "workload still present after forced deletion: {:?}",
            other
        ))),
    }
}

/// Tear down the task's workload with bounded retries.
///
/// Idempotent: an already cleaned task is left untouched. A task without a
/// workload has nothing to remove and is marked cleaned directly. A task
/// removed before it had an outcome is journaled as failed before it is
/// marked cleaned; the caller records the final state.
pub(crate) async fn teardown_task(
    cluster: &dyn ClusterApi,
    journal: &StateJournal,
    task: &mut HelperTask,
    retry: &RetryPolicy,
    grace: Duration,
    poll_interval: Duration,
) -> Result<(), HelperError> {
    if task.is_cleaned() {
        return Ok(());
    }
    let Some(workload) = task.workload_id.clone() else {
        task.transition(HelperPhase::Cleaned);
        return Ok(());
    };

    let mut made = 0;
    let target = &workload;
    let result = retry
        .run("helper teardown", |attempt| {
            made = attempt;
            delete_and_confirm(cluster, target, grace, poll_interval)
        })
        .await;
    task.teardown_attempts += made;

    match result {
        Ok(()) => {
            if !task.phase.is_terminal() {
                task.exit_reason
                    .get_or_insert_with(|| "torn down before completion".to_string());
                if task.transition(HelperPhase::Failed) {
                    journal.record_task(task).await;
                }
            }
            task.transition(HelperPhase::Cleaned);
            info!(node = %task.node, workload = %workload, "helper torn down");
            Ok(())
        }
        Err((e, attempts)) => {
            task.cleanup_pending = true;
            error!(node = %task.node, workload = %workload, attempts, error = %e, "helper teardown exhausted retries");
            Err(HelperError::Teardown {
                workload,
                attempts,
                reason: e.to_string(),
            })
        }
    }
}
