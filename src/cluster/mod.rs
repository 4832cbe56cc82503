//! Cluster collaborator: the workload-placement API the orchestrator drives.
//!
//! `kubernetes` talks to a real Kubernetes API server. `simulated` is an
//! in-process cluster on tokio time, used for dry runs and tests.

pub mod kubernetes;
pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::PullPolicy;
use crate::error::ClusterError;
use crate::types::{NodeName, WorkloadId};

pub use kubernetes::KubeCluster;
pub use simulated::{NodeBehavior, SimOutcome, SimulatedCluster};

/// A node as seen by the cluster API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: NodeName,
    pub ready: bool,
    /// Whole cores the node can hand out, when the cluster reports it.
    pub allocatable_cpu: Option<u32>,
}

impl NodeInfo {
    pub fn ready(name: impl Into<NodeName>) -> Self {
        Self {
            name: name.into(),
            ready: true,
            allocatable_cpu: None,
        }
    }
}

/// Everything needed to place one helper workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    /// Prefix for the generated workload name.
    pub name_prefix: String,
    pub namespace: String,
    pub node: NodeName,
    pub image: String,
    pub pull_policy: PullPolicy,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub cpu_cores: u32,
    pub labels: BTreeMap<String, String>,
    pub termination_grace: Duration,
    /// Intended runtime of the stress process.
    pub duration: Duration,
}

/// Remote workload state as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadStatus {
    Pending,
    Running,
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        reason: String,
    },
    /// The cluster gave up placing the workload.
    Unschedulable(String),
    /// The workload no longer exists.
    Gone,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Place a workload on `spec.node`, returning its identifier.
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<WorkloadId, ClusterError>;

    async fn workload_status(&self, id: &WorkloadId) -> Result<WorkloadStatus, ClusterError>;

    /// Request deletion. A zero grace period forces immediate removal.
    /// Deleting a workload that no longer exists succeeds.
    async fn delete_workload(&self, id: &WorkloadId, grace: Duration) -> Result<(), ClusterError>;

    /// List nodes, optionally filtered by a label selector.
    async fn list_nodes(&self, selector: Option<&str>) -> Result<Vec<NodeInfo>, ClusterError>;

    /// Nodes currently running pods that match `label` in `namespace`.
    async fn nodes_hosting(
        &self,
        namespace: &str,
        label: &str,
    ) -> Result<Vec<NodeName>, ClusterError>;
}
