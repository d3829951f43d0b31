//! Well-known label, annotation, condition and object-name keys
//!
//! Every string the operator shares with other components (the drainer, the
//! Deployments that create node Pods, humans running kubectl) lives here.

use k8s_openapi::api::core::v1::{Pod, PodCondition};
use kube::ResourceExt;

/// Label carrying the workload cluster ID on node Pods and DrainerConfigs
pub const LABEL_CLUSTER: &str = "kvm.dev/cluster";

/// Pod annotation with the node's IP inside the management network
pub const ANNOTATION_IP: &str = "endpoint.kvm.dev/ip";

/// Pod annotation naming the Service whose Endpoints should carry the Pod's IP
pub const ANNOTATION_SERVICE: &str = "endpoint.kvm.dev/service";

/// Pod annotation mirroring the workload Node's readiness status
pub const ANNOTATION_NODE_STATUS: &str = "kvm.dev/node-status";

/// Pod annotation set once drain finalization has run
pub const ANNOTATION_DRAINED: &str = "kvm.dev/drained";

/// Custom Pod condition reflecting the workload cluster Node's `Ready` condition
pub const CONDITION_WORKLOAD_NODE_READY: &str = "WorkloadClusterNodeReady";

/// Standard kubelet Pod condition
pub const CONDITION_POD_READY: &str = "Ready";

/// Standard Node condition
pub const CONDITION_NODE_READY: &str = "Ready";

/// Condition reason used when the workload Node disappeared
pub const REASON_NODE_DELETED: &str = "NodeDeleted";

/// Condition reason used when the workload Node reports no Ready condition
pub const REASON_NODE_READY_UNKNOWN: &str = "NodeReadyUnknown";

/// Service fronting the master node Pods
pub const MASTER_SERVICE: &str = "master";

/// Service fronting the worker node Pods
pub const WORKER_SERVICE: &str = "worker";

/// Finalizer gating node Pod removal on drain completion
pub const POD_DRAIN_FINALIZER: &str = "kvm.dev/drain";

/// Finalizer gating KvmCluster removal on node controller shutdown
pub const CLUSTER_FINALIZER: &str = "kvm.dev/node-controller";

/// Secret suffix holding the workload API certificates (`<cluster-id>-api`)
pub const API_CERTS_SECRET_SUFFIX: &str = "api";

/// Field manager used for every patch the operator issues
pub const FIELD_MANAGER: &str = "kvm-operator";

/// Management namespace holding all objects of a workload cluster
pub fn cluster_namespace(cluster_id: &str) -> String {
    cluster_id.to_string()
}

/// Object key (namespace, name) of the Pod hosting a workload Node
///
/// Workload Node names equal the names of the Pods that run their VMs, so the
/// mapping is deterministic and needs no lookup.
pub fn pod_key(cluster_namespace: &str, node_name: &str) -> (String, String) {
    (cluster_namespace.to_string(), node_name.to_string())
}

/// Name of the Secret holding the workload API certificates
pub fn api_certs_secret_name(cluster_id: &str) -> String {
    format!("{}-{}", cluster_id, API_CERTS_SECRET_SUFFIX)
}

/// Read an annotation value, treating empty values as absent
pub fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.annotations()
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Workload cluster ID from the Pod's cluster label
pub fn cluster_id_of(pod: &Pod) -> Option<&str> {
    pod.labels()
        .get(LABEL_CLUSTER)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// True once drain finalization has annotated the Pod
pub fn is_drained(pod: &Pod) -> bool {
    annotation(pod, ANNOTATION_DRAINED) == Some("true")
}

/// Find a Pod condition by type
pub fn pod_condition<'a>(pod: &'a Pod, type_: &str) -> Option<&'a PodCondition> {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == type_))
}

/// True when the Pod carries the given condition with status `True`
pub fn pod_condition_true(pod: &Pod, type_: &str) -> bool {
    pod_condition(pod, type_).is_some_and(|c| c.status == "True")
}

/// Kubelet readiness of the Pod
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod_condition_true(pod, CONDITION_POD_READY)
}

/// True when at least one container of the Pod is running
pub fn any_container_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .is_some_and(|statuses| {
            statuses
                .iter()
                .any(|cs| cs.state.as_ref().is_some_and(|s| s.running.is_some()))
        })
}
