//! Finalizer-gated node Pod removal
//!
//! A node Pod being deleted keeps its drain finalizer until the workload
//! cluster confirmed the Node was drained, the drainer gave up, or the VM is no
//! longer running. The handshake with the external drainer goes through a
//! DrainerConfig that shares the Pod's name; its existence is the only state
//! carried between reconciliations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::{DrainerConfig, KvmCluster};
use crate::key;
use crate::outcome::Outcome;
use crate::Error;

/// Requeue delay after the drained annotation lost a write race
pub const ANNOTATE_CONFLICT_REQUEUE: Duration = Duration::from_secs(2);

/// Management objects used while draining a node Pod
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DrainClient: Send + Sync {
    /// Read a Pod, `None` when it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Read a KvmCluster, `None` when it does not exist
    async fn get_cluster(&self, name: &str) -> Result<Option<KvmCluster>, Error>;

    /// Read a DrainerConfig, `None` when it does not exist
    async fn get_drainer_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DrainerConfig>, Error>;

    /// Create a DrainerConfig
    async fn create_drainer_config(&self, config: &DrainerConfig) -> Result<(), Error>;

    /// Delete a DrainerConfig
    async fn delete_drainer_config(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Replace a Pod; the embedded resourceVersion guards the write
    async fn replace_pod(&self, pod: &Pod) -> Result<(), Error>;

    /// Delete a Pod with a zero grace period
    async fn delete_pod_now(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Drain access backed by the management API
pub struct KubeDrainClient {
    client: Client,
}

impl KubeDrainClient {
    /// Create a new client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DrainClient for KubeDrainClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_cluster(&self, name: &str) -> Result<Option<KvmCluster>, Error> {
        let api: Api<KvmCluster> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_drainer_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DrainerConfig>, Error> {
        let api: Api<DrainerConfig> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_drainer_config(&self, config: &DrainerConfig) -> Result<(), Error> {
        let namespace = config.namespace().unwrap_or_default();
        let api: Api<DrainerConfig> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), config).await?;
        Ok(())
    }

    async fn delete_drainer_config(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<DrainerConfig> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn replace_pod(&self, pod: &Pod) -> Result<(), Error> {
        let namespace = pod.namespace().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&pod.name_any(), &PostParams::default(), pod)
            .await?;
        Ok(())
    }

    async fn delete_pod_now(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        api.delete(name, &params).await?;
        Ok(())
    }
}

/// Copy of the Pod carrying the drained annotation
pub fn mark_drained(pod: &Pod) -> Pod {
    let mut pod = pod.clone();
    pod.annotations_mut()
        .insert(key::ANNOTATION_DRAINED.to_string(), "true".to_string());
    pod
}

/// Drives the drain handshake for node Pods being deleted
pub struct PodDrainCoordinator {
    client: Arc<dyn DrainClient>,
}

impl PodDrainCoordinator {
    /// Create a coordinator
    pub fn new(client: Arc<dyn DrainClient>) -> Self {
        Self { client }
    }

    /// Advance the drain of a deleting node Pod by one step
    ///
    /// `Continue` and `Cancel` allow the drain finalizer to be removed;
    /// `KeepFinalizer` and `Requeue` hold it.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Outcome, Error> {
        let Some(pod) = self.client.get_pod(namespace, name).await? else {
            debug!(pod = %name, "pod already gone");
            return Ok(Outcome::Cancel);
        };

        let Some(cluster_id) = key::cluster_id_of(&pod) else {
            return Err(Error::missing_label(
                "Pod",
                format!("{namespace}/{name}"),
                key::LABEL_CLUSTER,
            ));
        };

        let cluster = self.client.get_cluster(cluster_id).await?;
        let Some(cluster) = cluster.filter(|c| !c.is_deleted()) else {
            info!(pod = %name, cluster = %cluster_id, "cluster is being deleted, leaving pod to namespace teardown");
            return Ok(Outcome::Cancel);
        };

        if key::is_drained(&pod) {
            debug!(pod = %name, "pod already drained");
            return Ok(Outcome::Continue);
        }

        let Some(config) = self.client.get_drainer_config(namespace, name).await? else {
            let config =
                DrainerConfig::for_node(namespace, name, cluster_id, &cluster.api_endpoint());
            match self.client.create_drainer_config(&config).await {
                Ok(()) => info!(pod = %name, "drain requested"),
                Err(e) if e.is_conflict() => debug!(pod = %name, "drain already requested"),
                Err(e) => return Err(e),
            }
            return Ok(Outcome::KeepFinalizer);
        };

        let finished = config.is_finished();
        let running = key::any_container_running(&pod);

        if !finished && running {
            debug!(pod = %name, "waiting for drain");
            return Ok(Outcome::KeepFinalizer);
        }

        info!(pod = %name, finished, running, "finalizing drain");
        self.finalize(&pod).await
    }

    async fn finalize(&self, pod: &Pod) -> Result<Outcome, Error> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();

        match self.client.delete_drainer_config(&namespace, &name).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }

        match self.client.replace_pod(&mark_drained(pod)).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                debug!(pod = %name, "pod changed while marking drained, retrying");
                return Ok(Outcome::Requeue(ANNOTATE_CONFLICT_REQUEUE));
            }
            Err(e) if e.is_not_found() => return Ok(Outcome::Cancel),
            Err(e) => return Err(e),
        }

        match self.client.delete_pod_now(&namespace, &name).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }

        info!(pod = %name, "node pod drained and deleted");
        Ok(Outcome::Continue)
    }
}
