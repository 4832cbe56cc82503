use async_trait::async_trait;

use crate::db::{Db, QueryBuilder};
use crate::error::StateError;
use crate::state::{ExperimentState, StateRecorder};
use crate::types::RunId;

/// State recorder backed by SurrealDB.
#[derive(Clone)]
pub struct SurrealStateRecorder {
    db: Db,
}

impl SurrealStateRecorder {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StateRecorder for SurrealStateRecorder {
    async fn persist(&self, state: &ExperimentState) -> Result<(), StateError> {
        QueryBuilder::upsert_experiment_state(&self.db, state).await
    }

    async fn load(&self, run_id: &RunId) -> Result<ExperimentState, StateError> {
        QueryBuilder::find_experiment_state(&self.db, run_id)
            .await?
            .ok_or_else(|| StateError::NotFound(run_id.clone()))
    }

    async fn runs_needing_cleanup(&self) -> Result<Vec<ExperimentState>, StateError> {
        QueryBuilder::list_states_needing_cleanup(&self.db).await
    }
}
