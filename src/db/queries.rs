// Experiment state queries for SurrealDB.

use serde::Deserialize;

use crate::db::Db;
use crate::error::StateError;
use crate::state::ExperimentState;
use crate::types::RunId;

#[derive(Debug, Deserialize)]
struct PayloadRow {
    payload: String,
}

pub struct QueryBuilder;

impl QueryBuilder {
    /// Insert or replace the row for `state.run_id`.
    pub async fn upsert_experiment_state(db: &Db, state: &ExperimentState) -> Result<(), StateError> {
        let payload = serde_json::to_string(state)?;

        db.query(
            r#"
            UPSERT type::thing('experiment_state', $run_id) SET
                run_id = $run_id,
                phase = $phase,
                needs_cleanup = $needs_cleanup,
                payload = $payload,
                started_at = $started_at
            RETURN NONE
            "#,
        )
        .bind(("run_id", state.run_id.to_string()))
        .bind(("phase", state.phase.to_string()))
        .bind(("needs_cleanup", state.needs_cleanup()))
        .bind(("payload", payload))
        .bind(("started_at", state.started_at.to_rfc3339()))
        .await?
        .check()?;

        Ok(())
    }

    pub async fn find_experiment_state(
        db: &Db,
        run_id: &RunId,
    ) -> Result<Option<ExperimentState>, StateError> {
        let mut res = db
            .query("SELECT payload FROM type::thing('experiment_state', $run_id)")
            .bind(("run_id", run_id.to_string()))
            .await?;

        let row: Option<PayloadRow> = res.take(0)?;
        row.map(|r| serde_json::from_str(&r.payload))
            .transpose()
            .map_err(StateError::from)
    }

    /// States whose helpers have not all been torn down, oldest first.
    pub async fn list_states_needing_cleanup(db: &Db) -> Result<Vec<ExperimentState>, StateError> {
        let mut res = db
            .query(
                r#"
                SELECT payload, started_at FROM experiment_state
                WHERE needs_cleanup = true
                ORDER BY started_at ASC
                "#,
            )
            .await?;

        let rows: Vec<PayloadRow> = res.take(0)?;
        rows.iter()
            .map(|r| serde_json::from_str(&r.payload).map_err(StateError::from))
            .collect()
    }
}
