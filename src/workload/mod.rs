//! Workload cluster API clients
//!
//! The workload API is only reachable once the cluster's certificates exist in
//! the management cluster and its API server accepts requests. Building a
//! client therefore has three legitimate results, captured by
//! [`Availability`]: a ready client, a benign "not yet" while the cluster
//! bootstraps, and a real failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::key;
use crate::Error;

/// Secret key holding the workload CA certificate (PEM)
pub const SECRET_KEY_CA: &str = "ca";
/// Secret key holding the operator's client certificate (PEM)
pub const SECRET_KEY_CRT: &str = "crt";
/// Secret key holding the operator's client key (PEM)
pub const SECRET_KEY_KEY: &str = "key";

/// Result of acquiring something that only exists once a cluster bootstrapped
#[derive(Debug)]
pub enum Availability<T> {
    /// Usable now
    Ready(T),
    /// Not usable yet; retry on the next reconciliation
    NotYetAvailable(String),
    /// A real failure that should be escalated
    Failed(Error),
}

impl<T> Availability<T> {
    /// Transform the ready value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Availability<U> {
        match self {
            Self::Ready(value) => Availability::Ready(f(value)),
            Self::NotYetAvailable(reason) => Availability::NotYetAvailable(reason),
            Self::Failed(e) => Availability::Failed(e),
        }
    }
}

/// PEM material for a workload API client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertMaterial {
    /// CA certificate of the workload API server
    pub ca: String,
    /// Client certificate
    pub crt: String,
    /// Client private key
    pub key: String,
}

/// Extract certificate material from the `<cluster-id>-api` Secret
///
/// A missing key means the certificates are still being issued. Present but
/// malformed data is a failure.
pub fn cert_material_from_secret(secret: &Secret) -> Availability<CertMaterial> {
    let data = secret.data.clone().unwrap_or_default();

    let mut values = Vec::with_capacity(3);
    for name in [SECRET_KEY_CA, SECRET_KEY_CRT, SECRET_KEY_KEY] {
        let Some(bytes) = data.get(name).filter(|b| !b.0.is_empty()) else {
            return Availability::NotYetAvailable(format!("certificate key {name} not present"));
        };
        let pem = match String::from_utf8(bytes.0.clone()) {
            Ok(pem) => pem,
            Err(e) => {
                return Availability::Failed(Error::serialization(format!(
                    "certificate key {name} is not UTF-8: {e}"
                )))
            }
        };
        if !pem.contains("-----BEGIN") {
            return Availability::Failed(Error::serialization(format!(
                "certificate key {name} is not PEM encoded"
            )));
        }
        values.push(pem);
    }

    let [ca, crt, key]: [String; 3] = match values.try_into() {
        Ok(values) => values,
        Err(_) => return Availability::Failed(Error::internal("certificate material incomplete")),
    };
    Availability::Ready(CertMaterial { ca, crt, key })
}

/// Synthesize a single-context kubeconfig for a workload cluster
pub fn build_kubeconfig(
    cluster_id: &str,
    api_endpoint: &str,
    certs: &CertMaterial,
) -> Result<Kubeconfig, Error> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let user = format!("{}-operator", cluster_id);

    let raw = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster_id,
            "cluster": {
                "server": api_endpoint,
                "certificate-authority-data": b64.encode(&certs.ca),
            }
        }],
        "users": [{
            "name": user,
            "user": {
                "client-certificate-data": b64.encode(&certs.crt),
                "client-key-data": b64.encode(&certs.key),
            }
        }],
        "contexts": [{
            "name": cluster_id,
            "context": { "cluster": cluster_id, "user": user }
        }],
        "current-context": cluster_id,
    });

    serde_json::from_value(raw)
        .map_err(|e| Error::serialization(format!("invalid kubeconfig for {cluster_id}: {e}")))
}

/// Source of workload certificate Secrets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertSource: Send + Sync {
    /// Read a Secret, `None` when it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;
}

/// Secret reader backed by the management API
pub struct KubeCertSource {
    client: Client,
}

impl KubeCertSource {
    /// Create a new source wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CertSource for KubeCertSource {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Builds clients for workload cluster APIs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClientFactory: Send + Sync {
    /// Client for the workload API of `cluster_id`, if the cluster can serve one
    async fn client_for(&self, cluster_id: &str, api_endpoint: &str) -> Availability<Client>;
}

/// Factory reading certificates from the management cluster
pub struct KubeWorkloadClientFactory {
    certs: Arc<dyn CertSource>,
    connect_timeout: Duration,
}

impl KubeWorkloadClientFactory {
    /// Create a factory probing new clients within `connect_timeout`
    pub fn new(certs: Arc<dyn CertSource>, connect_timeout: Duration) -> Self {
        Self {
            certs,
            connect_timeout,
        }
    }

    async fn load_certs(&self, cluster_id: &str) -> Availability<CertMaterial> {
        let namespace = key::cluster_namespace(cluster_id);
        let name = key::api_certs_secret_name(cluster_id);

        match self.certs.get_secret(&namespace, &name).await {
            Ok(Some(secret)) => cert_material_from_secret(&secret),
            Ok(None) => Availability::NotYetAvailable(format!("secret {namespace}/{name} not found")),
            Err(e) => Availability::Failed(e),
        }
    }

    async fn build_client(
        &self,
        cluster_id: &str,
        api_endpoint: &str,
        certs: &CertMaterial,
    ) -> Result<Client, Error> {
        let kubeconfig = build_kubeconfig(cluster_id, api_endpoint, certs)?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::workload_client(cluster_id, format!("failed to build config: {e}")))?;
        config.connect_timeout = Some(self.connect_timeout);

        Client::try_from(config)
            .map_err(|e| Error::workload_client(cluster_id, format!("failed to create client: {e}")))
    }

    /// Check that the workload API answers a version request
    async fn probe(&self, client: &Client) -> Result<(), String> {
        match tokio::time::timeout(self.connect_timeout, client.apiserver_version()).await {
            Ok(Ok(version)) => {
                debug!(version = %version.git_version, "workload API reachable");
                Ok(())
            }
            Ok(Err(e)) => Err(format!("API request failed: {e}")),
            Err(_) => Err("timeout waiting for workload API".to_string()),
        }
    }
}

#[async_trait]
impl WorkloadClientFactory for KubeWorkloadClientFactory {
    async fn client_for(&self, cluster_id: &str, api_endpoint: &str) -> Availability<Client> {
        let certs = match self.load_certs(cluster_id).await {
            Availability::Ready(certs) => certs,
            Availability::NotYetAvailable(reason) => return Availability::NotYetAvailable(reason),
            Availability::Failed(e) => return Availability::Failed(e),
        };

        let client = match self.build_client(cluster_id, api_endpoint, &certs).await {
            Ok(client) => client,
            Err(e) => return Availability::Failed(e),
        };

        match self.probe(&client).await {
            Ok(()) => Availability::Ready(client),
            Err(reason) => Availability::NotYetAvailable(reason),
        }
    }
}
