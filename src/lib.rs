// Core modules
pub mod cluster;
pub mod config;
pub mod db;
pub mod error;
pub mod types;

// Experiment machinery
pub mod helper;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod state;
pub mod targets;

// Re-export key types and functions
pub use cluster::{ClusterApi, KubeCluster, SimulatedCluster};
pub use config::{ExperimentConfig, OrchestratorSettings, RawExperimentConfig, SequenceMode};
pub use db::{DatabaseConfig, SurrealStateRecorder, create_connection, ensure_schema};
pub use error::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
pub use report::ExperimentReport;
pub use state::{ExperimentState, MemoryStateRecorder, StateRecorder};

use std::sync::Arc;

/// Connect to the state store and make sure its schema exists.
pub async fn create_state_recorder(config: DatabaseConfig) -> Result<Arc<SurrealStateRecorder>> {
    let db = create_connection(config).await?;
    ensure_schema(&db).await?;
    Ok(Arc::new(SurrealStateRecorder::new(db)))
}
