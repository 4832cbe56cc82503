//! Target resolution: which nodes an experiment run hits.
//!
//! An explicit node list is used verbatim. Otherwise the eligible (ready)
//! nodes are put in a seeded order derived from the run id and the first
//! `max(1, ceil(eligible * percentage / 100))` are taken, so repeating a run
//! id against the same cluster selects the same nodes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, NodeInfo};
use crate::config::TargetSelector;
use crate::error::ResolutionError;
use crate::types::{NodeName, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeReadiness {
    Ready,
    NotReady,
    /// The node was named explicitly but the cluster did not report it.
    Unknown,
}

/// A node selected for injection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetNode {
    pub name: NodeName,
    pub readiness: NodeReadiness,
    pub allocatable_cpu: Option<u32>,
}

impl From<&NodeInfo> for TargetNode {
    fn from(info: &NodeInfo) -> Self {
        Self {
            name: info.name.clone(),
            readiness: if info.ready {
                NodeReadiness::Ready
            } else {
                NodeReadiness::NotReady
            },
            allocatable_cpu: info.allocatable_cpu,
        }
    }
}

/// Number of nodes to hit out of `eligible` at `percentage` percent.
pub fn target_count(eligible: usize, percentage: u8) -> usize {
    let wanted = (eligible * percentage as usize).div_ceil(100);
    wanted.max(1).min(eligible)
}

fn seed_key(run_id: &RunId, node: &NodeName) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_str().as_bytes());
    hasher.update(b"/");
    hasher.update(node.as_str().as_bytes());
    hasher.finalize().into()
}

/// Order nodes by a digest of (run id, node name).
fn seeded_order(mut nodes: Vec<NodeInfo>, run_id: &RunId) -> Vec<NodeInfo> {
    nodes.sort_by_cached_key(|n| (seed_key(run_id, &n.name), n.name.clone()));
    nodes
}

pub struct TargetResolver<'a> {
    cluster: &'a dyn ClusterApi,
}

impl<'a> TargetResolver<'a> {
    pub fn new(cluster: &'a dyn ClusterApi) -> Self {
        Self { cluster }
    }

    /// Resolve the ordered, deduplicated target set for one run.
    pub async fn resolve(
        &self,
        selector: &TargetSelector,
        percentage: u8,
        run_id: &RunId,
    ) -> Result<Vec<TargetNode>, ResolutionError> {
        let candidates = match selector {
            TargetSelector::Explicit(names) => return self.resolve_explicit(names).await,
            TargetSelector::NodeLabel(label) => self.cluster.list_nodes(Some(label)).await?,
            TargetSelector::AppPlacement { namespace, label } => {
                let hosting = self.cluster.nodes_hosting(namespace, label).await?;
                let nodes = self.cluster.list_nodes(None).await?;
                nodes
                    .into_iter()
                    .filter(|n| hosting.contains(&n.name))
                    .collect()
            }
            TargetSelector::AllNodes => self.cluster.list_nodes(None).await?,
        };

        let mut eligible: Vec<NodeInfo> = Vec::with_capacity(candidates.len());
        for node in candidates {
            if !node.ready {
                debug!(node = %node.name, "skipping node that is not ready");
                continue;
            }
            if !eligible.iter().any(|n| n.name == node.name) {
                eligible.push(node);
            }
        }

        if eligible.is_empty() {
            return Err(ResolutionError::NoEligibleTargets(format!("{:?}", selector)));
        }

        let count = target_count(eligible.len(), percentage);
        let targets: Vec<TargetNode> = seeded_order(eligible, run_id)
            .iter()
            .take(count)
            .map(TargetNode::from)
            .collect();

        info!(
            run_id = %run_id,
            selected = count,
            percentage,
            targets = ?targets.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "resolved target nodes"
        );
        Ok(targets)
    }

    async fn resolve_explicit(&self, names: &[NodeName]) -> Result<Vec<TargetNode>, ResolutionError> {
        if names.is_empty() {
            return Err(ResolutionError::NoEligibleTargets("empty node list".to_string()));
        }

        let known = match self.cluster.list_nodes(None).await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "could not look up explicit targets, readiness unknown");
                Vec::new()
            }
        };

        let mut targets: Vec<TargetNode> = Vec::with_capacity(names.len());
        for name in names {
            if targets.iter().any(|t| &t.name == name) {
                continue;
            }
            let target = match known.iter().find(|n| &n.name == name) {
                Some(info) => TargetNode::from(info),
                None => TargetNode {
                    name: name.clone(),
                    readiness: NodeReadiness::Unknown,
                    allocatable_cpu: None,
                },
            };
            targets.push(target);
        }

        info!(targets = ?names.iter().map(NodeName::as_str).collect::<Vec<_>>(), "using explicit target nodes");
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::SimulatedCluster;
    use std::collections::HashSet;

    fn cluster_of(n: usize) -> SimulatedCluster {
        SimulatedCluster::with_nodes((0..n).map(|i| format!("node-{}", i)))
    }

    #[test]
    fn test_target_count() {
        assert_eq!(target_count(5, 40), 2);
        assert_eq!(target_count(5, 0), 1);
        assert_eq!(target_count(5, 1), 1);
        assert_eq!(target_count(5, 100), 5);
        assert_eq!(target_count(3, 50), 2);
        assert_eq!(target_count(1, 100), 1);
    }

    #[tokio::test]
    async fn test_count_matches_formula_for_all_sizes() {
        for n in 1..=12usize {
            let cluster = cluster_of(n);
            let resolver = TargetResolver::new(&cluster);
            let eligible: HashSet<String> = (0..n).map(|i| format!("node-{}", i)).collect();

            for p in [0u8, 1, 10, 25, 33, 40, 50, 66, 75, 99, 100] {
                let targets = resolver
                    .resolve(&TargetSelector::AllNodes, p, &RunId::new("seed"))
                    .await
                    .unwrap();
                let expected = ((n * p as usize).div_ceil(100)).max(1);
                assert_eq!(targets.len(), expected, "n={} p={}", n, p);

                let distinct: HashSet<&str> = targets.iter().map(|t| t.name.as_str()).collect();
                assert_eq!(distinct.len(), targets.len());
                assert!(distinct.iter().all(|name| eligible.contains(*name)));
            }
        }
    }

    #[tokio::test]
    async fn test_same_run_id_is_reproducible() {
        let cluster = cluster_of(10);
        let resolver = TargetResolver::new(&cluster);
        let run = RunId::new("abc123");

        let first = resolver.resolve(&TargetSelector::AllNodes, 30, &run).await.unwrap();
        let second = resolver.resolve(&TargetSelector::AllNodes, 30, &run).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_explicit_list_overrides_percentage() {
        let cluster = cluster_of(10);
        let resolver = TargetResolver::new(&cluster);
        let selector = TargetSelector::Explicit(vec![
            NodeName::new("node-7"),
            NodeName::new("node-2"),
            NodeName::new("node-4"),
        ]);

        let targets = resolver.resolve(&selector, 10, &RunId::new("x")).await.unwrap();
        let names: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["node-7", "node-2", "node-4"]);
        assert!(targets.iter().all(|t| t.readiness == NodeReadiness::Ready));
    }

    #[tokio::test]
    async fn test_explicit_unknown_node_kept_verbatim() {
        let cluster = cluster_of(2);
        let resolver = TargetResolver::new(&cluster);
        let selector = TargetSelector::Explicit(vec![NodeName::new("ghost")]);

        let targets = resolver.resolve(&selector, 100, &RunId::new("x")).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].readiness, NodeReadiness::Unknown);
    }

    #[tokio::test]
    async fn test_not_ready_nodes_are_ineligible() {
        let cluster = SimulatedCluster::with_nodes(Vec::<String>::new());
        cluster
            .add_node(NodeInfo {
                name: NodeName::new("sick"),
                ready: false,
                allocatable_cpu: None,
            })
            .await;
        let resolver = TargetResolver::new(&cluster);

        let err = resolver
            .resolve(&TargetSelector::AllNodes, 100, &RunId::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::NoEligibleTargets(_)));
    }

    #[tokio::test]
    async fn test_empty_cluster_has_no_targets() {
        let cluster = cluster_of(0);
        let resolver = TargetResolver::new(&cluster);
        let err = resolver
            .resolve(&TargetSelector::AllNodes, 50, &RunId::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::NoEligibleTargets(_)));
    }

    #[tokio::test]
    async fn test_app_placement_targets_hosting_nodes() {
        let cluster = cluster_of(4);
        cluster.add_app_pod("shop", "app=cart", "node-1").await;
        cluster.add_app_pod("shop", "app=cart", "node-3").await;
        cluster.add_app_pod("other", "app=cart", "node-0").await;
        let resolver = TargetResolver::new(&cluster);

        let selector = TargetSelector::AppPlacement {
            namespace: "shop".to_string(),
            label: "app=cart".to_string(),
        };
        let targets = resolver.resolve(&selector, 100, &RunId::new("x")).await.unwrap();
        let mut names: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["node-1", "node-3"]);
    }

    #[tokio::test]
    async fn test_cluster_failure_is_resolution_error() {
        let cluster = cluster_of(3);
        cluster.set_unavailable(true).await;
        let resolver = TargetResolver::new(&cluster);
        let err = resolver
            .resolve(&TargetSelector::AllNodes, 50, &RunId::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::Cluster(_)));
    }
}
