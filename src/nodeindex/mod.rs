//! Node index allocation
//!
//! Every node ID of a cluster gets a small positive integer that stays stable
//! for the node's lifetime. Indexes are stored in `status.kvm.nodeIndexes` of
//! the KvmCluster and are computed as a pure function of the current map, so a
//! conflicting write is resolved by re-reading and recomputing.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::KvmCluster;
use crate::retry::{retry_if, RetryConfig};
use crate::Error;

/// Node ID to index assignments
pub type NodeIndexes = BTreeMap<String, u32>;

/// Smallest positive integer not contained in `used`
pub fn next_free_index(used: &BTreeSet<u32>) -> u32 {
    let mut candidate = 1;
    for &index in used.range(1..) {
        if index != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}

/// Assign an index to every candidate that has none yet
///
/// Candidates are processed in the given order and each assignment is visible
/// to the next, so gaps are filled before the run is extended.
pub fn allocate(existing: &NodeIndexes, candidates: &[String]) -> NodeIndexes {
    let mut indexes = existing.clone();
    let mut used: BTreeSet<u32> = indexes.values().copied().collect();

    for id in candidates {
        if indexes.contains_key(id) {
            continue;
        }
        let index = next_free_index(&used);
        used.insert(index);
        indexes.insert(id.clone(), index);
    }

    indexes
}

/// Drop assignments for node IDs that are no longer desired
pub fn retire(existing: &NodeIndexes, desired: &[String]) -> NodeIndexes {
    let desired: BTreeSet<&str> = desired.iter().map(String::as_str).collect();
    existing
        .iter()
        .filter(|(id, _)| desired.contains(id.as_str()))
        .map(|(id, index)| (id.clone(), *index))
        .collect()
}

/// Retire stale IDs, then allocate missing ones
pub fn reconcile_indexes(existing: &NodeIndexes, desired: &[String]) -> NodeIndexes {
    allocate(&retire(existing, desired), desired)
}

/// Status write for a new index map
///
/// Carries the resourceVersion the map was computed from so the API server
/// rejects the write with 409 when another writer got there first.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeIndexPatch {
    /// resourceVersion of the KvmCluster the map was computed from
    pub resource_version: Option<String>,
    /// Assignments currently stored
    pub previous: NodeIndexes,
    /// Assignments to store
    pub next: NodeIndexes,
}

impl NodeIndexPatch {
    /// JSON merge patch for the status subresource
    ///
    /// Retired IDs are written as `null`, which is how a merge patch deletes a
    /// map key.
    pub fn to_json(&self) -> serde_json::Value {
        let mut indexes = serde_json::Map::new();
        for id in self.previous.keys() {
            if !self.next.contains_key(id) {
                indexes.insert(id.clone(), serde_json::Value::Null);
            }
        }
        for (id, index) in &self.next {
            indexes.insert(id.clone(), serde_json::Value::from(*index));
        }

        let mut patch = serde_json::json!({
            "status": { "kvm": { "nodeIndexes": indexes } }
        });
        if let Some(rv) = &self.resource_version {
            patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
        }
        patch
    }
}

/// KvmCluster access needed by the allocator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeIndexClient: Send + Sync {
    /// Read the current KvmCluster
    async fn get_cluster(&self, name: &str) -> Result<KvmCluster, Error>;

    /// Write the node index map to the status subresource
    async fn patch_node_indexes(&self, name: &str, patch: &NodeIndexPatch) -> Result<(), Error>;
}

/// Real implementation backed by the management API
pub struct KubeNodeIndexClient {
    client: Client,
}

impl KubeNodeIndexClient {
    /// Create a new client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeIndexClient for KubeNodeIndexClient {
    async fn get_cluster(&self, name: &str) -> Result<KvmCluster, Error> {
        let api: Api<KvmCluster> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn patch_node_indexes(&self, name: &str, patch: &NodeIndexPatch) -> Result<(), Error> {
        let api: Api<KvmCluster> = Api::all(self.client.clone());
        api.patch_status(
            name,
            &PatchParams::apply(crate::key::FIELD_MANAGER),
            &Patch::Merge(&patch.to_json()),
        )
        .await?;
        Ok(())
    }
}

/// Bring the stored index map in line with the cluster's node IDs
///
/// The first attempt works on `cluster` as observed by the controller; a
/// conflict re-reads the KvmCluster and recomputes. Nothing is written when
/// the map is already correct. Returns the resulting map.
pub async fn ensure_node_indexes(
    client: &dyn NodeIndexClient,
    cluster: &KvmCluster,
) -> Result<NodeIndexes, Error> {
    let name = cluster.name_any();
    let name = name.as_str();
    let mut observed = Some(cluster.clone());

    retry_if(
        &RetryConfig::for_conflicts(),
        "patch_node_indexes",
        Error::is_conflict,
        || {
            let seed = observed.take();
            async move {
                let cluster = match seed {
                    Some(cluster) => cluster,
                    None => client.get_cluster(name).await?,
                };

                let current = cluster.node_indexes();
                let next = reconcile_indexes(&current, &cluster.node_ids());
                if next == current {
                    debug!(cluster = %name, "node indexes up to date");
                    return Ok(next);
                }

                let patch = NodeIndexPatch {
                    resource_version: cluster.resource_version(),
                    previous: current,
                    next,
                };
                client.patch_node_indexes(name, &patch).await?;
                info!(cluster = %name, indexes = ?patch.next, "node indexes updated");
                Ok(patch.next)
            }
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::fixtures::{cluster, with_indexes};
    use crate::error::api_error;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn map(raw: &[(&str, u32)]) -> NodeIndexes {
        raw.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[rstest]
    #[case::empty(&[], 1)]
    #[case::dense(&[1, 2, 3], 4)]
    #[case::gap(&[1, 3], 2)]
    #[case::missing_one(&[2, 3], 1)]
    #[case::zero_ignored(&[0, 1], 2)]
    fn next_free_index_fills_smallest_gap(#[case] used: &[u32], #[case] expected: u32) {
        let used: BTreeSet<u32> = used.iter().copied().collect();
        assert_eq!(next_free_index(&used), expected);
    }

    /// Story: a node removed from the middle frees its index for the next one
    #[test]
    fn story_gap_is_reused_before_extending() {
        let existing = map(&[("a", 1), ("c", 3)]);
        let result = allocate(&existing, &ids(&["a", "c", "d"]));
        assert_eq!(result.get("d"), Some(&2));

        let values: BTreeSet<u32> = result.values().copied().collect();
        assert_eq!(values, BTreeSet::from([1, 2, 3]));
    }

    #[test]
    fn allocation_never_duplicates_indexes() {
        let existing = map(&[("a", 2), ("b", 5)]);
        let result = allocate(&existing, &ids(&["x", "y", "z", "w"]));
        let values: Vec<u32> = result.values().copied().collect();
        let unique: BTreeSet<u32> = values.iter().copied().collect();
        assert_eq!(values.len(), unique.len());
        assert_eq!(unique, BTreeSet::from([1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn existing_assignments_are_stable() {
        let existing = map(&[("m1", 4)]);
        assert_eq!(allocate(&existing, &ids(&["m1"])), existing);
    }

    #[test]
    fn retire_drops_ids_missing_from_spec() {
        let existing = map(&[("m1", 1), ("w1", 2), ("w2", 3)]);
        assert_eq!(
            retire(&existing, &ids(&["m1", "w2"])),
            map(&[("m1", 1), ("w2", 3)])
        );
    }

    #[test]
    fn reconcile_is_deterministic_over_masters_then_workers() {
        let desired = ids(&["m1", "w1", "w2"]);
        let first = reconcile_indexes(&NodeIndexes::new(), &desired);
        assert_eq!(first, map(&[("m1", 1), ("w1", 2), ("w2", 3)]));
        assert_eq!(reconcile_indexes(&first, &desired), first);
    }

    #[test]
    fn patch_nulls_retired_ids_and_pins_resource_version() {
        let patch = NodeIndexPatch {
            resource_version: Some("42".to_string()),
            previous: map(&[("old", 1), ("m1", 2)]),
            next: map(&[("m1", 2), ("w1", 1)]),
        };
        let json = patch.to_json();
        assert_eq!(json["metadata"]["resourceVersion"], "42");
        assert!(json["status"]["kvm"]["nodeIndexes"]["old"].is_null());
        assert_eq!(json["status"]["kvm"]["nodeIndexes"]["w1"], 1);
    }

    #[tokio::test]
    async fn unchanged_map_is_not_written() {
        let mut mock = MockNodeIndexClient::new();
        mock.expect_patch_node_indexes().never();
        mock.expect_get_cluster().never();

        let c = with_indexes(cluster("abc12", &["m1"], &["w1"]), &[("m1", 1), ("w1", 2)]);
        let result = ensure_node_indexes(&mock, &c).await.expect("ensure");
        assert_eq!(result, map(&[("m1", 1), ("w1", 2)]));
    }

    /// Story: a conflicting status write is resolved by re-reading the cluster
    ///
    /// The first write races with another writer that assigned index 2 to a
    /// new worker. After re-reading, the allocator picks 3 for the remaining
    /// node instead of double-allocating 2.
    #[tokio::test]
    async fn story_conflict_recomputes_from_fresh_state() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_in_mock = attempts.clone();

        let mut mock = MockNodeIndexClient::new();
        mock.expect_get_cluster().times(1).returning(|_| {
            Ok(with_indexes(
                cluster("abc12", &["m1"], &["w1", "w2"]),
                &[("m1", 1), ("w1", 2)],
            ))
        });
        mock.expect_patch_node_indexes()
            .times(2)
            .returning(move |_, patch| {
                if attempts_in_mock.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(api_error(409, "Conflict"))
                } else {
                    assert_eq!(patch.next.get("w2"), Some(&3));
                    Ok(())
                }
            });

        let stale = with_indexes(cluster("abc12", &["m1"], &["w2"]), &[("m1", 1)]);
        let result = ensure_node_indexes(&mock, &stale).await.expect("ensure");
        assert_eq!(result, map(&[("m1", 1), ("w1", 2), ("w2", 3)]));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_conflict_errors_are_not_retried() {
        let mut mock = MockNodeIndexClient::new();
        mock.expect_get_cluster().never();
        mock.expect_patch_node_indexes()
            .times(1)
            .returning(|_, _| Err(api_error(403, "Forbidden")));

        let c = cluster("abc12", &["m1"], &[]);
        let err = ensure_node_indexes(&mock, &c).await.expect_err("forbidden");
        assert_eq!(err.api_code(), Some(403));
    }
}
