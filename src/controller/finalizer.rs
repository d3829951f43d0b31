//! Finalizer bookkeeping for KvmClusters and node Pods
//!
//! Finalizer lists are written with a JSON merge patch of the whole filtered
//! list. A 404 on either write means the object is already gone, which is the
//! state a finalizer removal is trying to reach anyway.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::crd::KvmCluster;
use crate::key::FIELD_MANAGER;
use crate::Error;

/// Writes finalizer lists
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FinalizerClient: Send + Sync {
    /// Replace the finalizers of a KvmCluster
    async fn set_cluster_finalizers(&self, name: &str, finalizers: Vec<String>) -> Result<(), Error>;

    /// Replace the finalizers of a Pod
    async fn set_pod_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error>;
}

/// Finalizer client backed by the management API
pub struct KubeFinalizerClient {
    client: Client,
}

impl KubeFinalizerClient {
    /// Create a finalizer client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn finalizer_patch(finalizers: Vec<String>) -> serde_json::Value {
    json!({ "metadata": { "finalizers": finalizers } })
}

#[async_trait]
impl FinalizerClient for KubeFinalizerClient {
    async fn set_cluster_finalizers(&self, name: &str, finalizers: Vec<String>) -> Result<(), Error> {
        let api: Api<KvmCluster> = Api::all(self.client.clone());
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&finalizer_patch(finalizers)),
        )
        .await?;
        Ok(())
    }

    async fn set_pod_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&finalizer_patch(finalizers)),
        )
        .await?;
        Ok(())
    }
}

/// True when `obj` carries `finalizer`
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Finalizer list with `finalizer` appended, or None when already present
pub fn with_finalizer<K: Resource>(obj: &K, finalizer: &str) -> Option<Vec<String>> {
    if has_finalizer(obj, finalizer) {
        return None;
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    Some(finalizers)
}

/// Finalizer list without `finalizer`, or None when it is absent
pub fn without_finalizer<K: Resource>(obj: &K, finalizer: &str) -> Option<Vec<String>> {
    if !has_finalizer(obj, finalizer) {
        return None;
    }
    Some(
        obj.finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect(),
    )
}

/// Treat "object already gone" as success
pub(crate) fn tolerate_not_found(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
