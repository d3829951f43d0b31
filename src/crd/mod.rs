//! Custom Resource Definitions for the KVM operator

mod cluster;
mod drainer;
mod types;

pub use cluster::{ApiSpec, ClusterSpec, KubernetesSpec, KvmCluster, KvmClusterSpec, KvmClusterStatus, KvmStatus};
pub use drainer::{
    DrainerCluster, DrainerClusterApi, DrainerConfig, DrainerConfigSpec, DrainerConfigStatus,
    DrainerGuest, DrainerNode, CONDITION_DRAINED, CONDITION_TIMED_OUT,
};
pub use types::{ClusterNode, Condition, ConditionStatus};

#[cfg(test)]
pub(crate) use cluster::fixtures;
