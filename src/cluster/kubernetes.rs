//! Kubernetes implementation of the cluster collaborator.
//!
//! Helpers are bare pods pinned to their target with `nodeName`, so the
//! scheduler is bypassed and a pod that cannot run surfaces as a pod-level
//! condition rather than sitting in a queue.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Node, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    Client, Config,
    api::{Api, DeleteParams, ListParams, PostParams},
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::{ClusterApi, NodeInfo, WorkloadSpec, WorkloadStatus};
use crate::error::ClusterError;
use crate::types::{NodeName, WorkloadId};

const HELPER_CONTAINER: &str = "node-cpu-hog";
/// Nominal CPU request. The pod bypasses the scheduler, so kubelet admission
/// would reject a request for the node's full allocatable CPU.
const HELPER_CPU_REQUEST: &str = "100m";

/// Cluster collaborator backed by a Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

fn map_kube_error(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(ae.message),
        kube::Error::Api(ae) => ClusterError::Api(format!("{} ({})", ae.message, ae.code)),
        other => ClusterError::Unavailable(other.to_string()),
    }
}

impl KubeCluster {
    /// Connect using the in-cluster service account or the default kubeconfig.
    pub async fn connect(namespace: impl Into<String>) -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Unavailable(format!("failed to infer kube config: {}", e)))?;
        Ok(Self::with_client(client, namespace))
    }

    /// Connect using an explicit kubeconfig file and optional context.
    pub async fn from_kubeconfig(
        path: impl AsRef<Path>,
        context: Option<String>,
        namespace: impl Into<String>,
    ) -> Result<Self, ClusterError> {
        let path = path.as_ref();
        let kubeconfig = kube::config::Kubeconfig::read_from(path).map_err(|e| {
            ClusterError::Unavailable(format!(
                "failed to read kubeconfig from {}: {}",
                path.display(),
                e
            ))
        })?;
        let options = kube::config::KubeConfigOptions {
            context,
            cluster: None,
            user: None,
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| ClusterError::Unavailable(format!("invalid kubeconfig: {}", e)))?;
        let client = Client::try_from(config)
            .map_err(|e| ClusterError::Unavailable(format!("failed to build client: {}", e)))?;
        Ok(Self::with_client(client, namespace))
    }

    pub fn with_client(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        let ns = if namespace.is_empty() {
            self.namespace.as_str()
        } else {
            namespace
        };
        Api::namespaced(self.client.clone(), ns)
    }

    /// Pod API and pod name for a workload id of the form `namespace/name`.
    fn locate<'a>(&self, id: &'a WorkloadId) -> (Api<Pod>, &'a str) {
        match id.as_str().split_once('/') {
            Some((ns, name)) => (self.pods(ns), name),
            None => (self.pods(""), id.as_str()),
        }
    }

    fn helper_pod(spec: &WorkloadSpec) -> Pod {
        let resources = ResourceRequirements {
            requests: Some(BTreeMap::from([(
                "cpu".to_string(),
                Quantity(HELPER_CPU_REQUEST.to_string()),
            )])),
            ..Default::default()
        };

        Pod {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", spec.name_prefix)),
                namespace: Some(spec.namespace.clone()),
                labels: Some(spec.labels.clone()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(spec.node.to_string()),
                restart_policy: Some("Never".to_string()),
                termination_grace_period_seconds: Some(
                    i64::try_from(spec.termination_grace.as_secs()).unwrap_or(i64::MAX),
                ),
                containers: vec![Container {
                    name: HELPER_CONTAINER.to_string(),
                    image: Some(spec.image.clone()),
                    image_pull_policy: Some(spec.pull_policy.as_str().to_string()),
                    command: Some(spec.command.clone()),
                    args: Some(spec.args.clone()),
                    resources: Some(resources),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Map a pod's reported status onto the collaborator's workload status.
    fn map_pod_status(pod: &Pod) -> WorkloadStatus {
        let Some(status) = pod.status.as_ref() else {
            return WorkloadStatus::Pending;
        };

        match status.phase.as_deref() {
            Some("Running") => WorkloadStatus::Running,
            Some("Succeeded") => WorkloadStatus::Succeeded,
            Some("Failed") => {
                let terminated = status
                    .container_statuses
                    .as_ref()
                    .and_then(|cs| cs.iter().find_map(|c| c.state.as_ref()?.terminated.as_ref()));
                let exit_code = terminated.map(|t| t.exit_code);
                let reason = terminated
                    .and_then(|t| t.reason.clone().or_else(|| t.message.clone()))
                    .or_else(|| status.reason.clone())
                    .or_else(|| status.message.clone())
                    .unwrap_or_else(|| "pod failed".to_string());
                WorkloadStatus::Failed { exit_code, reason }
            }
            _ => {
                let unschedulable = status.conditions.as_ref().and_then(|conds| {
                    conds.iter().find(|c| {
                        c.type_ == "PodScheduled"
                            && c.status == "False"
                            && c.reason.as_deref() == Some("Unschedulable")
                    })
                });
                match unschedulable {
                    Some(cond) => WorkloadStatus::Unschedulable(
                        cond.message.clone().unwrap_or_else(|| "unschedulable".to_string()),
                    ),
                    None => WorkloadStatus::Pending,
                }
            }
        }
    }

    fn node_info(node: &Node) -> Option<NodeInfo> {
        let name = node.metadata.name.clone()?;
        let status = node.status.as_ref();
        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
            .unwrap_or(false);
        let allocatable_cpu = status
            .and_then(|s| s.allocatable.as_ref())
            .and_then(|a| a.get("cpu"))
            .and_then(|q| parse_cpu_cores(&q.0));

        Some(NodeInfo {
            name: NodeName::new(name),
            ready,
            allocatable_cpu,
        })
    }
}

/// Whole cores in a CPU quantity such as `4`, `3500m` or `1.5`.
fn parse_cpu_cores(quantity: &str) -> Option<u32> {
    let cores = if let Some(milli) = quantity.strip_suffix('m') {
        milli.parse::<u64>().ok()? / 1000
    } else {
        quantity.parse::<f64>().ok()?.floor() as u64
    };
    u32::try_from(cores).ok().filter(|c| *c > 0)
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<WorkloadId, ClusterError> {
        let namespace = if spec.namespace.is_empty() {
            self.namespace.clone()
        } else {
            spec.namespace.clone()
        };
        let pods = self.pods(&namespace);
        let pod = Self::helper_pod(spec);

        let created = pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(map_kube_error)?;

        let name = created
            .metadata
            .name
            .ok_or_else(|| ClusterError::Api("created pod has no name".to_string()))?;
        info!(pod = %name, namespace = %namespace, node = %spec.node, "helper pod created");
        Ok(WorkloadId::new(format!("{}/{}", namespace, name)))
    }

    async fn workload_status(&self, id: &WorkloadId) -> Result<WorkloadStatus, ClusterError> {
        let (pods, name) = self.locate(id);
        match pods.get_opt(name).await.map_err(map_kube_error)? {
            Some(pod) => Ok(Self::map_pod_status(&pod)),
            None => Ok(WorkloadStatus::Gone),
        }
    }

    async fn delete_workload(&self, id: &WorkloadId, grace: Duration) -> Result<(), ClusterError> {
        let (pods, name) = self.locate(id);
        let dp = DeleteParams {
            grace_period_seconds: Some(grace_period_seconds(grace)),
            ..Default::default()
        };

        match pods.delete(name, &dp).await {
            Ok(_) => {
                debug!(pod = %id, grace_secs = grace.as_secs(), "helper pod deletion requested");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(pod = %id, "helper pod already deleted");
                Ok(())
            }
            Err(e) => Err(map_kube_error(e)),
        }
    }

    async fn list_nodes(&self, selector: Option<&str>) -> Result<Vec<NodeInfo>, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if let Some(sel) = selector.filter(|s| !s.is_empty()) {
            params = params.labels(sel);
        }

        let list = nodes.list(&params).await.map_err(map_kube_error)?;
        Ok(list.items.iter().filter_map(Self::node_info).collect())
    }

    async fn nodes_hosting(
        &self,
        namespace: &str,
        label: &str,
    ) -> Result<Vec<NodeName>, ClusterError> {
        let pods: Api<Pod> = if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        };
        let list = pods
            .list(&ListParams::default().labels(label))
            .await
            .map_err(map_kube_error)?;

        let nodes: BTreeSet<String> = list
            .items
            .into_iter()
            .filter_map(|p| p.spec.and_then(|s| s.node_name))
            .collect();
        Ok(nodes.into_iter().map(NodeName::new).collect())
    }
}

fn grace_period_seconds(grace: Duration) -> u32 {
    u32::try_from(grace.as_secs()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PullPolicy;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, NodeCondition, NodeStatus,
        PodCondition, PodStatus,
    };

    fn pod_with_status(status: PodStatus) -> Pod {
        Pod {
            status: Some(status),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_cpu_cores() {
        assert_eq!(parse_cpu_cores("4"), Some(4));
        assert_eq!(parse_cpu_cores("3500m"), Some(3));
        assert_eq!(parse_cpu_cores("1.5"), Some(1));
        assert_eq!(parse_cpu_cores("500m"), None);
        assert_eq!(parse_cpu_cores("lots"), None);
    }

    #[test]
    fn test_map_pod_phase() {
        let running = pod_with_status(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        assert_eq!(KubeCluster::map_pod_status(&running), WorkloadStatus::Running);

        let succeeded = pod_with_status(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        assert_eq!(KubeCluster::map_pod_status(&succeeded), WorkloadStatus::Succeeded);

        assert_eq!(
            KubeCluster::map_pod_status(&Pod::default()),
            WorkloadStatus::Pending
        );
    }

    #[test]
    fn test_failed_pod_reports_exit_code() {
        let failed = pod_with_status(PodStatus {
            phase: Some("Failed".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: HELPER_CONTAINER.to_string(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 137,
                        reason: Some("OOMKilled".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });

        assert_eq!(
            KubeCluster::map_pod_status(&failed),
            WorkloadStatus::Failed {
                exit_code: Some(137),
                reason: "OOMKilled".to_string()
            }
        );
    }

    #[test]
    fn test_unschedulable_condition() {
        let pending = pod_with_status(PodStatus {
            phase: Some("Pending".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "PodScheduled".to_string(),
                status: "False".to_string(),
                reason: Some("Unschedulable".to_string()),
                message: Some("node had taint".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });

        assert_eq!(
            KubeCluster::map_pod_status(&pending),
            WorkloadStatus::Unschedulable("node had taint".to_string())
        );
    }

    #[test]
    fn test_node_info_readiness_and_cpu() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("worker-1".to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                allocatable: Some(BTreeMap::from([(
                    "cpu".to_string(),
                    Quantity("7800m".to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let info = KubeCluster::node_info(&node).unwrap();
        assert_eq!(info.name.as_str(), "worker-1");
        assert!(info.ready);
        assert_eq!(info.allocatable_cpu, Some(7));
    }

    #[test]
    fn test_helper_pod_is_pinned_to_node() {
        let spec = WorkloadSpec {
            name_prefix: "node-cpu-hog-abc123".to_string(),
            namespace: "litmus".to_string(),
            node: NodeName::new("worker-2"),
            image: "litmuschaos/go-runner:latest".to_string(),
            pull_policy: PullPolicy::IfNotPresent,
            command: vec!["stress-ng".to_string()],
            args: vec!["--cpu".to_string(), "2".to_string()],
            cpu_cores: 2,
            labels: BTreeMap::from([("name".to_string(), "node-cpu-hog".to_string())]),
            termination_grace: Duration::from_secs(5),
            duration: Duration::from_secs(60),
        };

        let pod = KubeCluster::helper_pod(&spec);
        let pod_spec = pod.spec.unwrap();
        assert_eq!(pod_spec.node_name.as_deref(), Some("worker-2"));
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod_spec.termination_grace_period_seconds, Some(5));
        assert_eq!(
            pod.metadata.generate_name.as_deref(),
            Some("node-cpu-hog-abc123-")
        );
        let container = &pod_spec.containers[0];
        assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(container.args.as_ref().unwrap()[1], "2");
    }

    #[test]
    fn test_helper_pod_requests_nominal_cpu() {
        let spec = WorkloadSpec {
            name_prefix: "node-cpu-hog-abc123".to_string(),
            namespace: "litmus".to_string(),
            node: NodeName::new("worker-3"),
            image: "litmuschaos/go-runner:latest".to_string(),
            pull_policy: PullPolicy::Always,
            command: vec!["stress-ng".to_string()],
            args: vec!["--cpu".to_string(), "8".to_string()],
            cpu_cores: 8,
            labels: BTreeMap::new(),
            termination_grace: Duration::from_secs(5),
            duration: Duration::from_secs(60),
        };

        let pod = KubeCluster::helper_pod(&spec);
        let container = &pod.spec.unwrap().containers[0];
        let requests = container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .unwrap();
        assert_eq!(requests.get("cpu"), Some(&Quantity("100m".to_string())));
        // Core count only reaches the stress process.
        assert_eq!(container.args.as_ref().unwrap()[1], "8");
    }

    #[test]
    fn test_grace_period_saturates() {
        assert_eq!(grace_period_seconds(Duration::from_secs(30)), 30);
        assert_eq!(grace_period_seconds(Duration::ZERO), 0);
        assert_eq!(
            grace_period_seconds(Duration::from_secs(u64::from(u32::MAX) + 1)),
            u32::MAX
        );
    }
}
