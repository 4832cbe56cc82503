//! Experiment state and its persistence.
//!
//! `ExperimentState` is the aggregate the sequencer reports and the state
//! recorder persists. Individual `HelperTask` records are owned by their
//! monitor; the aggregate only holds snapshots delivered through the
//! `StateJournal`.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::SequenceMode;
use crate::error::StateError;
use crate::targets::TargetNode;
use crate::types::{NodeName, RunId, WorkloadId};

pub use memory::MemoryStateRecorder;

/// Lifecycle of one helper workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HelperPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cleaned,
}

impl HelperPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cleaned
        )
    }
}

impl fmt::Display for HelperPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One helper workload on one target node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperTask {
    pub node: NodeName,
    /// Absent when the workload was never created.
    pub workload_id: Option<WorkloadId>,
    pub phase: HelperPhase,
    /// How the helper finished, kept once the task is cleaned.
    pub outcome: Option<HelperPhase>,
    /// Last observed exit signal or failure reason.
    pub exit_reason: Option<String>,
    pub exit_code: Option<i32>,
    pub launched_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cleaned_at: Option<DateTime<Utc>>,
    pub teardown_attempts: u32,
    /// Teardown gave up; the workload may still exist on the cluster.
    pub cleanup_pending: bool,
}

impl HelperTask {
    pub fn pending(node: NodeName, workload_id: WorkloadId) -> Self {
        Self {
            node,
            workload_id: Some(workload_id),
            phase: HelperPhase::Pending,
            outcome: None,
            exit_reason: None,
            exit_code: None,
            launched_at: Some(Utc::now()),
            finished_at: None,
            cleaned_at: None,
            teardown_attempts: 0,
            cleanup_pending: false,
        }
    }

    /// A task whose workload could not be created at all.
    pub fn unscheduled(node: NodeName, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            node,
            workload_id: None,
            phase: HelperPhase::Failed,
            outcome: Some(HelperPhase::Failed),
            exit_reason: Some(reason.into()),
            exit_code: None,
            launched_at: Some(now),
            finished_at: Some(now),
            cleaned_at: None,
            teardown_attempts: 0,
            cleanup_pending: false,
        }
    }

    /// Move to `phase`. Returns `false` when the transition is not allowed:
    /// nothing leaves `Cleaned`, and run outcomes are final.
    pub(crate) fn transition(&mut self, phase: HelperPhase) -> bool {
        if self.phase == phase || self.phase == HelperPhase::Cleaned {
            return false;
        }
        if self.phase.is_terminal() && phase != HelperPhase::Cleaned {
            return false;
        }

        match phase {
            HelperPhase::Succeeded | HelperPhase::Failed | HelperPhase::TimedOut => {
                self.outcome = Some(phase);
                self.finished_at = Some(Utc::now());
            }
            HelperPhase::Cleaned => {
                self.cleaned_at = Some(Utc::now());
                self.cleanup_pending = false;
            }
            HelperPhase::Pending | HelperPhase::Running => {}
        }
        self.phase = phase;
        true
    }

    pub fn is_cleaned(&self) -> bool {
        self.phase == HelperPhase::Cleaned
    }

    /// A workload exists on the cluster and has not been confirmed gone.
    pub fn needs_teardown(&self) -> bool {
        self.workload_id.is_some() && !self.is_cleaned()
    }
}

/// Phases of the experiment sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentPhase {
    Initializing,
    RampingUp,
    Injecting,
    Verifying,
    CleaningUp,
    Completed,
    Failed,
}

impl ExperimentPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExperimentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Fail,
}

/// Aggregate state of one experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentState {
    pub run_id: RunId,
    pub experiment_name: String,
    pub phase: ExperimentPhase,
    pub sequence: SequenceMode,
    pub targets: Vec<TargetNode>,
    pub tasks: Vec<HelperTask>,
    pub verdict: Option<Verdict>,
    /// Why the run failed or was aborted.
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExperimentState {
    pub fn new(run_id: RunId, experiment_name: impl Into<String>, sequence: SequenceMode) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            experiment_name: experiment_name.into(),
            phase: ExperimentPhase::Initializing,
            sequence,
            targets: Vec::new(),
            tasks: Vec::new(),
            verdict: None,
            failure: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn task(&self, node: &NodeName) -> Option<&HelperTask> {
        self.tasks.iter().find(|t| &t.node == node)
    }

    /// Insert or replace the snapshot of the task on `task.node`.
    pub fn upsert_task(&mut self, task: HelperTask) {
        match self.tasks.iter_mut().find(|t| t.node == task.node) {
            Some(existing) => *existing = task,
            None => self.tasks.push(task),
        }
        self.updated_at = Utc::now();
    }

    /// Every task finished and every started helper was torn down.
    pub fn can_complete(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| t.phase.is_terminal() && !t.needs_teardown())
    }

    pub fn needs_cleanup(&self) -> bool {
        self.tasks.iter().any(HelperTask::needs_teardown)
    }

    /// Set a non-final phase.
    pub fn set_phase(&mut self, phase: ExperimentPhase) {
        self.phase = phase;
        self.updated_at = Utc::now();
    }

    /// Enter the final phase: `Completed` when the completion invariant
    /// holds and nothing failed fatally, `Failed` otherwise.
    pub fn finish(&mut self) -> ExperimentPhase {
        let phase = if self.failure.is_none() && self.can_complete() {
            ExperimentPhase::Completed
        } else {
            ExperimentPhase::Failed
        };
        self.set_phase(phase);
        phase
    }
}

/// Durable store of experiment state keyed by run id.
#[async_trait]
pub trait StateRecorder: Send + Sync {
    async fn persist(&self, state: &ExperimentState) -> Result<(), StateError>;

    async fn load(&self, run_id: &RunId) -> Result<ExperimentState, StateError>;

    /// Runs that still have helpers without confirmed teardown.
    async fn runs_needing_cleanup(&self) -> Result<Vec<ExperimentState>, StateError>;
}

/// The aggregate state of a live run plus the recorder it is written to.
///
/// Every change goes through here and is persisted immediately. Persistence
/// failures are logged and never interrupt the experiment.
pub struct StateJournal {
    state: Mutex<ExperimentState>,
    recorder: Arc<dyn StateRecorder>,
}

impl StateJournal {
    pub fn new(state: ExperimentState, recorder: Arc<dyn StateRecorder>) -> Self {
        Self {
            state: Mutex::new(state),
            recorder,
        }
    }

    pub async fn snapshot(&self) -> ExperimentState {
        self.state.lock().await.clone()
    }

    pub async fn set_phase(&self, phase: ExperimentPhase) {
        let mut state = self.state.lock().await;
        let from = state.phase;
        state.set_phase(phase);
        info!(run_id = %state.run_id, from = %from, to = %phase, "experiment phase transition");
        self.persist(&state).await;
    }

    pub async fn record_task(&self, task: &HelperTask) {
        let mut state = self.state.lock().await;
        state.upsert_task(task.clone());
        self.persist(&state).await;
    }

    /// Apply an arbitrary change and persist it.
    pub async fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut ExperimentState),
    {
        let mut state = self.state.lock().await;
        change(&mut state);
        state.updated_at = Utc::now();
        self.persist(&state).await;
    }

    async fn persist(&self, state: &ExperimentState) {
        if let Err(e) = self.recorder.persist(state).await {
            error!(run_id = %state.run_id, phase = %state.phase, error = %e, "failed to persist experiment state");
        }
    }
}
