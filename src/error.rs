//! Error types for the injection orchestrator.
//!
//! Mirrors the experiment's failure taxonomy:
//! - resolution failures abort a run before any side effect
//! - scheduling, execution and timeout failures are recorded per target
//! - teardown failures are retried and, once exhausted, escalated

use thiserror::Error;

use crate::types::{NodeName, RunId, WorkloadId};

/// Errors raised while validating an experiment configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("failed to read config file: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

impl ConfigError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Errors returned by a cluster collaborator.
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("workload not found: {0}")]
    NotFound(String),

    #[error("cluster API error: {0}")]
    Api(String),

    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

/// Target resolution failures. Always fatal for the run.
#[derive(Error, Debug, Clone)]
pub enum ResolutionError {
    #[error("no eligible target nodes found ({0})")]
    NoEligibleTargets(String),

    #[error("failed to query cluster nodes: {0}")]
    Cluster(#[from] ClusterError),
}

/// Failures of a single helper workload.
#[derive(Error, Debug, Clone)]
pub enum HelperError {
    #[error("helper could not be placed on {node}: {reason}")]
    Scheduling { node: NodeName, reason: String },

    #[error("helper {workload} exited with failure: {reason}")]
    Execution { workload: WorkloadId, reason: String },

    #[error("helper {workload} exceeded its runtime bound of {bound_secs}s")]
    Timeout { workload: WorkloadId, bound_secs: u64 },

    #[error("teardown of {workload} failed after {attempts} attempts: {reason}")]
    Teardown {
        workload: WorkloadId,
        attempts: u32,
        reason: String,
    },

    #[error("helper monitor for {0} is no longer reachable")]
    MonitorGone(NodeName),
}

/// Failures of the state recorder.
#[derive(Error, Debug, Clone)]
pub enum StateError {
    #[error("no persisted state for run {0}")]
    NotFound(RunId),

    #[error("state store error: {0}")]
    Store(String),

    #[error("state serialization error: {0}")]
    Serialization(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Top-level error for orchestrator operations.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Helper(#[from] HelperError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Result type for orchestrator operations.
pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("chaos_duration", "must be greater than zero");
        assert_eq!(
            err.to_string(),
            "invalid value for chaos_duration: must be greater than zero"
        );
    }

    #[test]
    fn test_resolution_error_wraps_cluster_error() {
        let err: ResolutionError = ClusterError::Unavailable("connection refused".into()).into();
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_orchestrator_error_is_transparent() {
        let err: OrchestratorError = HelperError::Timeout {
            workload: WorkloadId::new("hog-1"),
            bound_secs: 90,
        }
        .into();
        assert_eq!(err.to_string(), "helper hog-1 exceeded its runtime bound of 90s");
    }
}
