//! KvmCluster Custom Resource Definition
//!
//! A KvmCluster describes one workload cluster whose nodes run as KVM virtual
//! machines inside Pods of the management cluster. All management objects of
//! the cluster live in the namespace named after the cluster ID.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ClusterNode;

/// Specification for a KvmCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kvm.dev",
    version = "v1alpha1",
    kind = "KvmCluster",
    plural = "kvmclusters",
    shortname = "kc",
    status = "KvmClusterStatus",
    namespaced = false,
    printcolumn = r#"{"name":"ID","type":"string","jsonPath":".spec.cluster.id"}"#,
    printcolumn = r#"{"name":"API","type":"string","jsonPath":".spec.cluster.kubernetes.api.domain"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KvmClusterSpec {
    /// Workload cluster topology and API access
    pub cluster: ClusterSpec,
}

/// Workload cluster description
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cluster ID; also the name of the management namespace
    pub id: String,

    /// Kubernetes settings of the workload cluster
    pub kubernetes: KubernetesSpec,

    /// Master nodes, in declaration order
    #[serde(default)]
    pub masters: Vec<ClusterNode>,

    /// Worker nodes, in declaration order
    #[serde(default)]
    pub workers: Vec<ClusterNode>,
}

/// Kubernetes settings of the workload cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesSpec {
    /// Workload API server settings
    pub api: ApiSpec,
}

/// Workload API server settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiSpec {
    /// DNS name of the workload API server
    pub domain: String,
}

/// Status for a KvmCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KvmClusterStatus {
    /// Provider specific status
    #[serde(default)]
    pub kvm: KvmStatus,
}

/// KVM specific status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KvmStatus {
    /// Stable index per node ID, owned by the node index allocator
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_indexes: BTreeMap<String, u32>,
}

impl KvmClusterSpec {
    /// Validate the cluster specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        let id = &self.cluster.id;
        if id.is_empty() {
            return Err(crate::Error::validation_for(
                crate::error::UNKNOWN_CONTEXT,
                "spec.cluster.id must not be empty",
            ));
        }
        if self.cluster.kubernetes.api.domain.is_empty() {
            return Err(crate::Error::validation_for(
                id,
                "spec.cluster.kubernetes.api.domain must not be empty",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for node in self.cluster.masters.iter().chain(&self.cluster.workers) {
            if node.id.is_empty() {
                return Err(crate::Error::validation_for(id, "node IDs must not be empty"));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(crate::Error::validation_for(
                    id,
                    format!("duplicate node ID {}", node.id),
                ));
            }
        }

        Ok(())
    }
}

impl KvmCluster {
    /// Workload cluster ID
    pub fn cluster_id(&self) -> &str {
        &self.spec.cluster.id
    }

    /// Management namespace holding the cluster's Pods, Endpoints and DrainerConfigs
    pub fn cluster_namespace(&self) -> String {
        crate::key::cluster_namespace(self.cluster_id())
    }

    /// Workload API endpoint URL
    pub fn api_endpoint(&self) -> String {
        format!("https://{}", self.spec.cluster.kubernetes.api.domain)
    }

    /// Node IDs in deterministic order: masters first, then workers
    pub fn node_ids(&self) -> Vec<String> {
        self.spec
            .cluster
            .masters
            .iter()
            .chain(&self.spec.cluster.workers)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Current node index assignments (empty before the first allocation)
    pub fn node_indexes(&self) -> BTreeMap<String, u32> {
        self.status
            .as_ref()
            .map(|s| s.kvm.node_indexes.clone())
            .unwrap_or_default()
    }

    /// True once deletion of the cluster has been requested
    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Registry key of the cluster's node controller
    pub fn controller_key(&self) -> crate::nodecontroller::ClusterKey {
        crate::nodecontroller::ClusterKey::new(self.cluster_namespace(), self.name_any())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    pub fn cluster(id: &str, masters: &[&str], workers: &[&str]) -> KvmCluster {
        KvmCluster {
            metadata: ObjectMeta {
                name: Some(id.to_string()),
                resource_version: Some("100".to_string()),
                ..Default::default()
            },
            spec: KvmClusterSpec {
                cluster: ClusterSpec {
                    id: id.to_string(),
                    kubernetes: KubernetesSpec {
                        api: ApiSpec {
                            domain: format!("api.{}.k8s.example.com", id),
                        },
                    },
                    masters: masters.iter().map(|m| ClusterNode::new(*m)).collect(),
                    workers: workers.iter().map(|w| ClusterNode::new(*w)).collect(),
                },
            },
            status: None,
        }
    }

    pub fn with_indexes(mut cluster: KvmCluster, indexes: &[(&str, u32)]) -> KvmCluster {
        cluster
            .status
            .get_or_insert_with(KvmClusterStatus::default)
            .kvm
            .node_indexes = indexes.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        cluster
    }

    pub fn deleted(mut cluster: KvmCluster) -> KvmCluster {
        cluster.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        cluster
    }
}
