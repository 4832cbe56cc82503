use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{ExperimentState, HelperPhase, StateRecorder};
use crate::error::StateError;
use crate::types::{NodeName, RunId};

/// Process-local recorder for dry runs. Does not survive a restart.
#[derive(Default)]
pub struct MemoryStateRecorder {
    states: Mutex<HashMap<RunId, ExperimentState>>,
    writes: Mutex<u64>,
    /// Distinct task phases in the order they were persisted.
    phases: Mutex<HashMap<(RunId, NodeName), Vec<HelperPhase>>>,
}

impl MemoryStateRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `persist` calls so far.
    pub async fn write_count(&self) -> u64 {
        *self.writes.lock().await
    }

    /// Every phase the task on `node` was persisted in, oldest first.
    pub async fn persisted_phases(&self, run_id: &RunId, node: &NodeName) -> Vec<HelperPhase> {
        self.phases
            .lock()
            .await
            .get(&(run_id.clone(), node.clone()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl StateRecorder for MemoryStateRecorder {
    async fn persist(&self, state: &ExperimentState) -> Result<(), StateError> {
        self.states
            .lock()
            .await
            .insert(state.run_id.clone(), state.clone());
        *self.writes.lock().await += 1;

        let mut phases = self.phases.lock().await;
        for task in &state.tasks {
            let seen = phases
                .entry((state.run_id.clone(), task.node.clone()))
                .or_default();
            if seen.last() != Some(&task.phase) {
                seen.push(task.phase);
            }
        }
        Ok(())
    }

    async fn load(&self, run_id: &RunId) -> Result<ExperimentState, StateError> {
        self.states
            .lock()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| StateError::NotFound(run_id.clone()))
    }

    async fn runs_needing_cleanup(&self) -> Result<Vec<ExperimentState>, StateError> {
        let mut runs: Vec<ExperimentState> = self
            .states
            .lock()
            .await
            .values()
            .filter(|s| s.needs_cleanup())
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(runs)
    }
}
