//! Periodic removal of stale Endpoints addresses
//!
//! Pod delete events can be missed (forced deletion, operator restart), which
//! leaves addresses of gone nodes in the master and worker Endpoints. On every
//! cluster resync the sweeper compares the traffic-eligible addresses with the
//! workload Nodes and the management Pods and drops what no healthy pair backs.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EndpointAddress, Node, Pod};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::EndpointsClient;
use crate::crd::KvmCluster;
use crate::key;
use crate::workload::{Availability, WorkloadClientFactory};
use crate::Error;

/// Lists the Nodes of a workload cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeLister: Send + Sync {
    /// All Nodes of the workload cluster
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;
}

/// Node lister backed by a workload API client
pub struct KubeNodeLister {
    client: Client,
}

impl KubeNodeLister {
    /// Create a lister for the workload cluster behind `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeLister for KubeNodeLister {
    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Provides a [`NodeLister`] for a cluster's workload API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeListerSource: Send + Sync {
    /// Lister for the cluster's Nodes, once its API is reachable
    async fn lister_for(&self, cluster: &KvmCluster) -> Availability<Arc<dyn NodeLister>>;
}

/// Builds [`KubeNodeLister`]s from workload clients
pub struct WorkloadNodeListers {
    factory: Arc<dyn WorkloadClientFactory>,
}

impl WorkloadNodeListers {
    /// Create a source using `factory` for workload clients
    pub fn new(factory: Arc<dyn WorkloadClientFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl NodeListerSource for WorkloadNodeListers {
    async fn lister_for(&self, cluster: &KvmCluster) -> Availability<Arc<dyn NodeLister>> {
        self.factory
            .client_for(cluster.cluster_id(), &cluster.api_endpoint())
            .await
            .map(|client| Arc::new(KubeNodeLister::new(client)) as Arc<dyn NodeLister>)
    }
}

/// Result of one sweep
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// The sweep did not run because Nodes and Pods disagree
    pub skipped: bool,
    /// Number of addresses removed across all Endpoints
    pub removed: usize,
}

/// InternalIP of a Node
pub fn node_internal_ip(node: &Node) -> Option<&str> {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
        .map(|a| a.address.as_str())
}

/// True when the Node and Pod sets describe the same machines
///
/// Counts and sorted names must both match; anything else means one side is
/// mid-transition.
pub fn inventories_match(nodes: &[Node], pods: &[Pod]) -> bool {
    if nodes.len() != pods.len() {
        return false;
    }
    let node_names: BTreeSet<String> = nodes.iter().map(|n| n.name_any()).collect();
    let pod_names: BTreeSet<String> = pods.iter().map(|p| p.name_any()).collect();
    node_names == pod_names
}

/// Indices of addresses not backed by a Node with that IP whose Pod is ready
pub fn stale_address_indices(
    addresses: &[EndpointAddress],
    nodes: &[Node],
    pods: &[Pod],
) -> Vec<usize> {
    let backed = |ip: &str| {
        nodes.iter().any(|node| {
            node_internal_ip(node) == Some(ip)
                && pods
                    .iter()
                    .any(|pod| pod.name_any() == node.name_any() && key::is_pod_ready(pod))
        })
    };

    addresses
        .iter()
        .enumerate()
        .filter(|(_, a)| !backed(&a.ip))
        .map(|(i, _)| i)
        .collect()
}

/// Remove the given indices in one pass
pub fn remove_indices(addresses: &mut Vec<EndpointAddress>, indices: &[usize]) {
    let doomed: BTreeSet<usize> = indices.iter().copied().collect();
    let mut i = 0;
    addresses.retain(|_| {
        let keep = !doomed.contains(&i);
        i += 1;
        keep
    });
}

/// Safety net removing stale addresses from the master and worker Endpoints
pub struct EndpointStaleIPSweeper {
    client: Arc<dyn EndpointsClient>,
}

impl EndpointStaleIPSweeper {
    /// Create a sweeper
    pub fn new(client: Arc<dyn EndpointsClient>) -> Self {
        Self { client }
    }

    /// Sweep the Endpoints of one cluster namespace
    pub async fn sweep(&self, namespace: &str, nodes: &dyn NodeLister) -> Result<SweepReport, Error> {
        let nodes = nodes.list_nodes().await?;
        let pods = self.client.list_pods(namespace).await?;

        if !inventories_match(&nodes, &pods) {
            debug!(
                cluster = %namespace,
                nodes = nodes.len(),
                pods = pods.len(),
                "nodes and pods disagree, deferring sweep"
            );
            return Ok(SweepReport {
                skipped: true,
                removed: 0,
            });
        }

        let mut report = SweepReport::default();
        for service in [key::MASTER_SERVICE, key::WORKER_SERVICE] {
            report.removed += self.sweep_endpoints(namespace, service, &nodes, &pods).await?;
        }

        if report.removed > 0 {
            info!(cluster = %namespace, removed = report.removed, "stale endpoint addresses removed");
        }
        Ok(report)
    }

    async fn sweep_endpoints(
        &self,
        namespace: &str,
        service: &str,
        nodes: &[Node],
        pods: &[Pod],
    ) -> Result<usize, Error> {
        let Some(mut endpoints) = self.client.get_endpoints(namespace, service).await? else {
            return Ok(0);
        };

        let mut removed = 0;
        for subset in endpoints.subsets.iter_mut().flatten() {
            let Some(addresses) = subset.addresses.as_mut() else {
                continue;
            };
            let stale = stale_address_indices(addresses, nodes, pods);
            for &i in &stale {
                debug!(service = %service, ip = %addresses[i].ip, "stale endpoint address");
            }
            remove_indices(addresses, &stale);
            removed += stale.len();
        }

        if removed == 0 {
            return Ok(0);
        }

        match self.client.replace_endpoints(namespace, &endpoints).await {
            Ok(()) => Ok(removed),
            // retried on the next tick
            Err(e) if e.is_conflict() || e.is_not_found() => Ok(0),
            Err(e) => Err(e),
        }
    }
}
