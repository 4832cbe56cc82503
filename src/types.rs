//! NewType wrappers for strong typing throughout the orchestrator.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a node name where a workload ID is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Name of a cluster node as reported by the cluster API.
    NodeName
);

newtype_string!(
    /// Identifier of a remote helper workload (the pod name on Kubernetes).
    ///
    /// Returned by `ClusterApi::create_workload` and used for every later
    /// status query and deletion.
    WorkloadId
);

newtype_string!(
    /// Identifier of one experiment run.
    ///
    /// Keys persisted experiment state and seeds the target ordering, so two
    /// runs with the same id select the same nodes from the same cluster.
    RunId
);

impl RunId {
    /// Generate a fresh short run id.
    pub fn generate() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self(id[..6].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_name_creation() {
        let node = NodeName::new("worker-1");
        assert_eq!(node.as_str(), "worker-1");
        assert_eq!(node.to_string(), "worker-1");
    }

    #[test]
    fn test_workload_id_from_string() {
        let id: WorkloadId = "hog-abc".into();
        assert_eq!(id.as_str(), "hog-abc");

        let id: WorkloadId = String::from("hog-xyz").into();
        assert_eq!(id.into_inner(), "hog-xyz");
    }

    #[test]
    fn test_run_id_serde() {
        let id = RunId::new("r1x2y3");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"r1x2y3\"");

        let parsed: RunId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_generated_run_ids_are_short_and_distinct() {
        let a = RunId::generate();
        let b = RunId::generate();
        assert_eq!(a.as_str().len(), 6);
        assert_ne!(a, b);
    }

    #[test]
    fn test_borrow_for_set_lookup() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(NodeName::new("worker-1"));

        assert!(set.contains("worker-1"));
        assert!(!set.contains("worker-2"));
    }
}
