//! Workload Node readiness to management Pod condition
//!
//! Runs inside a cluster's node loop. Every observed workload Node is mapped
//! to the Pod hosting its VM and the Node's `Ready` condition is mirrored onto
//! the Pod as `WorkloadClusterNodeReady`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, Pod, PodCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::ConditionStatus;
use crate::key;
use crate::Error;

/// Pod access needed to mirror Node readiness
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodConditionClient: Send + Sync {
    /// Read a Pod, `None` when it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Set one condition on the Pod status subresource
    async fn patch_pod_condition(
        &self,
        namespace: &str,
        name: &str,
        condition: &PodCondition,
    ) -> Result<(), Error>;

    /// Record the Node's readiness status in the Pod's annotations
    async fn annotate_node_status(
        &self,
        namespace: &str,
        name: &str,
        status: &str,
    ) -> Result<(), Error>;
}

/// Pod access backed by the management API
pub struct KubePodConditionClient {
    client: Client,
}

impl KubePodConditionClient {
    /// Create a new client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodConditionClient for KubePodConditionClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_pod_condition(
        &self,
        namespace: &str,
        name: &str,
        condition: &PodCondition,
    ) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        // conditions merge by type under strategic merge
        let patch = serde_json::json!({
            "status": { "conditions": [condition] }
        });
        api.patch_status(
            name,
            &PatchParams::apply(key::FIELD_MANAGER),
            &Patch::Strategic(&patch),
        )
        .await?;
        Ok(())
    }

    async fn annotate_node_status(
        &self,
        namespace: &str,
        name: &str,
        status: &str,
    ) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": { "annotations": { key::ANNOTATION_NODE_STATUS: status } }
        });
        api.patch(
            name,
            &PatchParams::apply(key::FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Condition content derived from a workload Node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredCondition {
    /// `True`, `False` or `Unknown`
    pub status: String,
    /// Machine-readable reason
    pub reason: Option<String>,
    /// Human-readable message
    pub message: Option<String>,
}

/// Condition mirroring the Node's `Ready` condition
///
/// `True` and `False` are copied verbatim; any other value, or a missing
/// condition, becomes `Unknown`.
pub fn desired_condition(node: &Node) -> DesiredCondition {
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == key::CONDITION_NODE_READY));

    match ready {
        Some(c) => {
            DesiredCondition {
                status: ConditionStatus::from_k8s(&c.status).to_string(),
                reason: c.reason.clone(),
                message: c.message.clone(),
            }
        }
        None => DesiredCondition {
            status: ConditionStatus::Unknown.to_string(),
            reason: Some(key::REASON_NODE_READY_UNKNOWN.to_string()),
            message: Some("node has no Ready condition".to_string()),
        },
    }
}

/// Condition written when the workload Node disappeared
pub fn deleted_condition() -> DesiredCondition {
    DesiredCondition {
        status: ConditionStatus::False.to_string(),
        reason: Some(key::REASON_NODE_DELETED.to_string()),
        message: Some("node was deleted from the workload cluster".to_string()),
    }
}

/// Condition to write for an observed Node, or `None` when the status is unchanged
pub fn next_condition(
    current: Option<&PodCondition>,
    desired: &DesiredCondition,
    now: Time,
) -> Option<PodCondition> {
    if current.is_some_and(|c| c.status == desired.status) {
        return None;
    }
    Some(build_condition(desired, now))
}

/// Condition to write unconditionally
///
/// The transition time only moves when the status actually changes.
pub fn forced_condition(
    current: Option<&PodCondition>,
    desired: &DesiredCondition,
    now: Time,
) -> PodCondition {
    let mut condition = build_condition(desired, now);
    if let Some(c) = current.filter(|c| c.status == desired.status) {
        condition.last_transition_time = c.last_transition_time.clone();
    }
    condition
}

fn build_condition(desired: &DesiredCondition, now: Time) -> PodCondition {
    PodCondition {
        type_: key::CONDITION_WORKLOAD_NODE_READY.to_string(),
        status: desired.status.clone(),
        reason: desired.reason.clone(),
        message: desired.message.clone(),
        last_transition_time: Some(now),
        ..Default::default()
    }
}

/// Mirrors workload Node readiness onto management Pods of one cluster
pub struct NodeReadinessPropagator {
    pods: Arc<dyn PodConditionClient>,
    cluster_namespace: String,
}

impl NodeReadinessPropagator {
    /// Create a propagator for the Pods in `cluster_namespace`
    pub fn new(pods: Arc<dyn PodConditionClient>, cluster_namespace: impl Into<String>) -> Self {
        Self {
            pods,
            cluster_namespace: cluster_namespace.into(),
        }
    }

    /// Handle a created or updated Node
    pub async fn propagate(&self, node: &Node) -> Result<(), Error> {
        let (namespace, name) = key::pod_key(&self.cluster_namespace, &node.name_any());
        let Some(pod) = self.pods.get_pod(&namespace, &name).await? else {
            debug!(pod = %name, "pod for node not found, skipping");
            return Ok(());
        };

        let desired = desired_condition(node);
        let current = key::pod_condition(&pod, key::CONDITION_WORKLOAD_NODE_READY);
        let Some(condition) = next_condition(current, &desired, Time(Utc::now())) else {
            // condition already current; a failed annotation write may still be pending
            if key::annotation(&pod, key::ANNOTATION_NODE_STATUS) != Some(desired.status.as_str()) {
                self.annotate(&namespace, &name, &desired.status).await?;
                debug!(pod = %name, status = %desired.status, "node status annotation refreshed");
            }
            return Ok(());
        };

        self.write(&namespace, &name, &condition).await?;
        info!(pod = %name, status = %condition.status, "workload node readiness changed");
        Ok(())
    }

    /// Handle a Node that was deleted from the workload cluster
    pub async fn propagate_deleted(&self, node: &Node) -> Result<(), Error> {
        let (namespace, name) = key::pod_key(&self.cluster_namespace, &node.name_any());
        let Some(pod) = self.pods.get_pod(&namespace, &name).await? else {
            debug!(pod = %name, "pod for deleted node not found, skipping");
            return Ok(());
        };

        let current = key::pod_condition(&pod, key::CONDITION_WORKLOAD_NODE_READY);
        let condition = forced_condition(current, &deleted_condition(), Time(Utc::now()));

        self.write(&namespace, &name, &condition).await?;
        info!(pod = %name, "workload node deleted");
        Ok(())
    }

    async fn write(&self, namespace: &str, name: &str, condition: &PodCondition) -> Result<(), Error> {
        match self.pods.patch_pod_condition(namespace, name, condition).await {
            Err(e) if e.is_not_found() => return Ok(()),
            other => other?,
        }
        self.annotate(namespace, name, &condition.status).await
    }

    async fn annotate(&self, namespace: &str, name: &str, status: &str) -> Result<(), Error> {
        match self.pods.annotate_node_status(namespace, name, status).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}
