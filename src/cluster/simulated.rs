//! In-process cluster for dry runs and tests.
//!
//! Workloads advance on tokio time, so tests running with a paused clock
//! see a full experiment complete instantly. Every node can be given a
//! behavior to reproduce scheduling failures, non-zero exits, hangs and
//! stubborn deletions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{ClusterApi, NodeInfo, WorkloadSpec, WorkloadStatus};
use crate::error::ClusterError;
use crate::types::{NodeName, WorkloadId};

/// What a helper placed on a node ends up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOutcome {
    /// Runs for its requested duration and exits cleanly.
    Complete,
    /// Exits with `code` after running for `after`.
    Exit { after: Duration, code: i32 },
    /// Never exits on its own.
    Hang,
    /// Accepted by the API but never placed.
    Unschedulable(String),
    /// Rejected by the API at creation.
    RejectCreate(String),
}

#[derive(Debug, Clone)]
pub struct NodeBehavior {
    pub outcome: SimOutcome,
    /// Time spent pending before the workload starts running.
    pub startup: Duration,
    /// Deletion requests with a non-zero grace period that are acknowledged
    /// but never complete.
    pub ignored_deletes: u32,
    /// Deletion requests answered with an API error.
    pub failing_deletes: u32,
    /// How long a status query for the workload takes to answer.
    pub status_latency: Duration,
}

impl Default for NodeBehavior {
    fn default() -> Self {
        Self {
            outcome: SimOutcome::Complete,
            startup: Duration::from_secs(1),
            ignored_deletes: 0,
            failing_deletes: 0,
            status_latency: Duration::ZERO,
        }
    }
}

impl NodeBehavior {
    pub fn with_outcome(outcome: SimOutcome) -> Self {
        Self {
            outcome,
            ..Default::default()
        }
    }
}

/// Something that happened to the simulated cluster, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Created { node: NodeName, workload: WorkloadId },
    DeleteRequested { workload: WorkloadId, grace: Duration },
    Removed { workload: WorkloadId },
}

#[derive(Debug, Clone)]
struct SimWorkload {
    node: NodeName,
    created_at: Instant,
    run_for: Duration,
    behavior: NodeBehavior,
}

impl SimWorkload {
    fn status(&self, now: Instant) -> WorkloadStatus {
        let elapsed = now.saturating_duration_since(self.created_at);
        let startup = self.behavior.startup;

        match &self.behavior.outcome {
            SimOutcome::Unschedulable(reason) => WorkloadStatus::Unschedulable(reason.clone()),
            SimOutcome::RejectCreate(_) => WorkloadStatus::Gone,
            _ if elapsed < startup => WorkloadStatus::Pending,
            SimOutcome::Complete if elapsed < startup + self.run_for => WorkloadStatus::Running,
            SimOutcome::Complete => WorkloadStatus::Succeeded,
            SimOutcome::Exit { after, .. } if elapsed < startup + *after => WorkloadStatus::Running,
            SimOutcome::Exit { code, .. } => WorkloadStatus::Failed {
                exit_code: Some(*code),
                reason: format!("stress process exited with code {}", code),
            },
            SimOutcome::Hang => WorkloadStatus::Running,
        }
    }
}

#[derive(Default)]
struct SimState {
    nodes: Vec<NodeInfo>,
    app_pods: Vec<(String, String, NodeName)>,
    behaviors: HashMap<NodeName, NodeBehavior>,
    workloads: HashMap<WorkloadId, SimWorkload>,
    events: Vec<(Instant, ClusterEvent)>,
    next_id: u64,
    unavailable: bool,
}

/// A cluster that lives entirely in memory.
#[derive(Default)]
pub struct SimulatedCluster {
    state: Mutex<SimState>,
}

impl SimulatedCluster {
    /// A cluster of ready nodes with the given names.
    pub fn with_nodes<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeName>,
    {
        let nodes = names.into_iter().map(NodeInfo::ready).collect();
        Self {
            state: Mutex::new(SimState {
                nodes,
                ..Default::default()
            }),
        }
    }

    pub async fn add_node(&self, node: NodeInfo) {
        self.state.lock().await.nodes.push(node);
    }

    pub async fn set_behavior(&self, node: impl Into<NodeName>, behavior: NodeBehavior) {
        self.state.lock().await.behaviors.insert(node.into(), behavior);
    }

    /// Register a pod of an application so app-placement targeting finds its node.
    pub async fn add_app_pod(&self, namespace: &str, label: &str, node: impl Into<NodeName>) {
        self.state
            .lock()
            .await
            .app_pods
            .push((namespace.to_string(), label.to_string(), node.into()));
    }

    /// Make every API call fail as if the API server were down.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    pub async fn events(&self) -> Vec<(Instant, ClusterEvent)> {
        self.state.lock().await.events.clone()
    }

    /// Workloads that still exist on the cluster.
    pub async fn live_workloads(&self) -> Vec<WorkloadId> {
        let mut ids: Vec<WorkloadId> = self.state.lock().await.workloads.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn check_available(state: &SimState) -> Result<(), ClusterError> {
        if state.unavailable {
            Err(ClusterError::Unavailable("simulated API server is down".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ClusterApi for SimulatedCluster {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<WorkloadId, ClusterError> {
        let mut state = self.state.lock().await;
        Self::check_available(&state)?;

        let behavior = state.behaviors.get(&spec.node).cloned().unwrap_or_default();
        if let SimOutcome::RejectCreate(reason) = &behavior.outcome {
            return Err(ClusterError::Api(reason.clone()));
        }
        if !state.nodes.iter().any(|n| n.name == spec.node) {
            return Err(ClusterError::Api(format!("node {} does not exist", spec.node)));
        }

        state.next_id += 1;
        let id = WorkloadId::new(format!("{}-{:05}", spec.name_prefix, state.next_id));
        let now = Instant::now();
        state.workloads.insert(
            id.clone(),
            SimWorkload {
                node: spec.node.clone(),
                created_at: now,
                run_for: spec.duration,
                behavior,
            },
        );
        state.events.push((
            now,
            ClusterEvent::Created {
                node: spec.node.clone(),
                workload: id.clone(),
            },
        ));
        Ok(id)
    }

    async fn workload_status(&self, id: &WorkloadId) -> Result<WorkloadStatus, ClusterError> {
        let latency = {
            let state = self.state.lock().await;
            Self::check_available(&state)?;
            state
                .workloads
                .get(id)
                .map(|w| w.behavior.status_latency)
                .unwrap_or_default()
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let state = self.state.lock().await;
        Self::check_available(&state)?;

        Ok(state
            .workloads
            .get(id)
            .map(|w| w.status(Instant::now()))
            .unwrap_or(WorkloadStatus::Gone))
    }

    async fn delete_workload(&self, id: &WorkloadId, grace: Duration) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        Self::check_available(&state)?;

        let now = Instant::now();
        state.events.push((
            now,
            ClusterEvent::DeleteRequested {
                workload: id.clone(),
                grace,
            },
        ));

        let Some(workload) = state.workloads.get_mut(id) else {
            return Ok(());
        };

        if workload.behavior.failing_deletes > 0 {
            workload.behavior.failing_deletes -= 1;
            return Err(ClusterError::Api(format!(
                "simulated deletion failure for {} on {}",
                id, workload.node
            )));
        }
        if !grace.is_zero() && workload.behavior.ignored_deletes > 0 {
            workload.behavior.ignored_deletes -= 1;
            return Ok(());
        }

        state.workloads.remove(id);
        state
            .events
            .push((now, ClusterEvent::Removed { workload: id.clone() }));
        Ok(())
    }

    async fn list_nodes(&self, selector: Option<&str>) -> Result<Vec<NodeInfo>, ClusterError> {
        let state = self.state.lock().await;
        Self::check_available(&state)?;

        // Labels are not modelled; a selector matches nodes whose name
        // contains the selector's value.
        let nodes = match selector.filter(|s| !s.is_empty()) {
            Some(sel) => {
                let value = sel.rsplit('=').next().unwrap_or(sel);
                state
                    .nodes
                    .iter()
                    .filter(|n| n.name.as_str().contains(value))
                    .cloned()
                    .collect()
            }
            None => state.nodes.clone(),
        };
        Ok(nodes)
    }

    async fn nodes_hosting(
        &self,
        namespace: &str,
        label: &str,
    ) -> Result<Vec<NodeName>, ClusterError> {
        let state = self.state.lock().await;
        Self::check_available(&state)?;

        let mut nodes: Vec<NodeName> = Vec::new();
        for (ns, l, node) in &state.app_pods {
            if (namespace.is_empty() || ns == namespace) && l == label && !nodes.contains(node) {
                nodes.push(node.clone());
            }
        }
        Ok(nodes)
    }
}
