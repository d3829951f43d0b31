//! DrainerConfig Custom Resource Definition
//!
//! A DrainerConfig is a drain request for one workload Node. The operator
//! creates it when a node Pod is being deleted; an external drainer consumes
//! it, drains the Node through the workload API and reports the result as a
//! `Drained` or `TimedOut` condition.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Condition type reported once the Node was drained
pub const CONDITION_DRAINED: &str = "Drained";

/// Condition type reported once draining gave up
pub const CONDITION_TIMED_OUT: &str = "TimedOut";

/// Specification for a DrainerConfig
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.kvm.dev",
    version = "v1alpha1",
    kind = "DrainerConfig",
    plural = "drainerconfigs",
    status = "DrainerConfigStatus",
    namespaced,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.guest.node.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DrainerConfigSpec {
    /// Workload cluster and Node to drain
    pub guest: DrainerGuest,
}

/// Workload side of a drain request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrainerGuest {
    /// Workload cluster identity and API access
    pub cluster: DrainerCluster,
    /// Node to drain
    pub node: DrainerNode,
}

/// Workload cluster identity and API access
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrainerCluster {
    /// Workload cluster ID
    pub id: String,
    /// Workload API access
    pub api: DrainerClusterApi,
}

/// Workload API access for the drainer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrainerClusterApi {
    /// Workload API endpoint URL
    pub endpoint: String,
}

/// Node to drain
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrainerNode {
    /// Workload Node name (equal to the node Pod name)
    pub name: String,
}

/// Status for a DrainerConfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrainerConfigStatus {
    /// Drain result conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl DrainerConfigStatus {
    /// True when the drainer reported the Node as drained
    pub fn has_drained_condition(&self) -> bool {
        self.conditions.iter().any(|c| c.is_true(CONDITION_DRAINED))
    }

    /// True when the drainer gave up draining the Node
    pub fn has_timeout_condition(&self) -> bool {
        self.conditions.iter().any(|c| c.is_true(CONDITION_TIMED_OUT))
    }
}

impl DrainerConfig {
    /// Build the drain request for a node Pod
    ///
    /// The DrainerConfig shares name and namespace with the Pod and carries the
    /// cluster label so drainers can select by cluster.
    pub fn for_node(
        namespace: &str,
        node_name: &str,
        cluster_id: &str,
        api_endpoint: &str,
    ) -> Self {
        let mut config = DrainerConfig::new(
            node_name,
            DrainerConfigSpec {
                guest: DrainerGuest {
                    cluster: DrainerCluster {
                        id: cluster_id.to_string(),
                        api: DrainerClusterApi {
                            endpoint: api_endpoint.to_string(),
                        },
                    },
                    node: DrainerNode {
                        name: node_name.to_string(),
                    },
                },
            },
        );
        config.metadata = ObjectMeta {
            name: Some(node_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                crate::key::LABEL_CLUSTER.to_string(),
                cluster_id.to_string(),
            )])),
            ..Default::default()
        };
        config
    }

    /// True when draining concluded, successfully or not
    pub fn is_finished(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.has_drained_condition() || s.has_timeout_condition())
    }
}
