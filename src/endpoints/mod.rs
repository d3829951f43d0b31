//! Endpoints membership for node Pods
//!
//! The master and worker Services have no selectors; their Endpoints are
//! maintained here from Pod annotations and readiness. Membership is keyed by
//! the raw IP string and every change is an idempotent set operation on a
//! freshly read object, so `addresses` and `notReadyAddresses` stay disjoint.

pub mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Pod, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, PostParams, Preconditions};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::key;
use crate::outcome::Outcome;
use crate::Error;

pub use sweeper::{
    EndpointStaleIPSweeper, KubeNodeLister, NodeLister, NodeListerSource, SweepReport,
    WorkloadNodeListers,
};

/// Requeue delay after losing an optimistic-concurrency race on an Endpoints write
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(2);

/// Management objects read and written by the endpoint components
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EndpointsClient: Send + Sync {
    /// Read an Endpoints object, `None` when it does not exist
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, Error>;

    /// Read a Service, `None` when it does not exist
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Create an Endpoints object
    async fn create_endpoints(&self, namespace: &str, endpoints: &Endpoints) -> Result<(), Error>;

    /// Replace an Endpoints object; the embedded resourceVersion guards the write
    async fn replace_endpoints(&self, namespace: &str, endpoints: &Endpoints)
        -> Result<(), Error>;

    /// Delete an Endpoints object, guarded by `resource_version` when given
    async fn delete_endpoints(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<(), Error>;

    /// List the node Pods of a cluster namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, Error>;
}

/// Endpoints access backed by the management API
pub struct KubeEndpointsClient {
    client: Client,
}

impl KubeEndpointsClient {
    /// Create a new client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EndpointsClient for KubeEndpointsClient {
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_endpoints(&self, namespace: &str, endpoints: &Endpoints) -> Result<(), Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), endpoints).await?;
        Ok(())
    }

    async fn replace_endpoints(
        &self,
        namespace: &str,
        endpoints: &Endpoints,
    ) -> Result<(), Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&endpoints.name_any(), &PostParams::default(), endpoints)
            .await?;
        Ok(())
    }

    async fn delete_endpoints(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<(), Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version,
                uid: None,
            }),
            ..DeleteParams::default()
        };
        api.delete(name, &params).await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api.list(&ListParams::default().labels(key::LABEL_CLUSTER)).await?;
        Ok(pods.items)
    }
}

/// Where a Pod's IP belongs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointTarget {
    /// Node IP from the `ip` annotation
    pub ip: String,
    /// Service name from the `service` annotation
    pub service: String,
}

/// Read the IP and Service annotations; `None` until both are assigned
pub fn endpoint_target(pod: &Pod) -> Option<EndpointTarget> {
    Some(EndpointTarget {
        ip: key::annotation(pod, key::ANNOTATION_IP)?.to_string(),
        service: key::annotation(pod, key::ANNOTATION_SERVICE)?.to_string(),
    })
}

/// Whether the Pod's IP should receive traffic
///
/// Masters are always ready once annotated: API traffic has to reach a master
/// before any health signal can exist. Everything else needs both the kubelet
/// and the workload Node to report ready.
pub fn is_endpoint_ready(pod: &Pod, service: &str) -> bool {
    service == key::MASTER_SERVICE
        || (key::is_pod_ready(pod)
            && key::pod_condition_true(pod, key::CONDITION_WORKLOAD_NODE_READY))
}

/// True when the list holds the IP
pub fn contains_ip(list: &[EndpointAddress], ip: &str) -> bool {
    list.iter().any(|a| a.ip == ip)
}

/// Add the IP unless present; returns whether the list changed
pub fn add_ip(list: &mut Vec<EndpointAddress>, ip: &str) -> bool {
    if contains_ip(list, ip) {
        return false;
    }
    list.push(EndpointAddress {
        ip: ip.to_string(),
        ..Default::default()
    });
    true
}

/// Remove every occurrence of the IP; returns whether the list changed
pub fn remove_ip(list: &mut Vec<EndpointAddress>, ip: &str) -> bool {
    let before = list.len();
    list.retain(|a| a.ip != ip);
    list.len() != before
}

/// Endpoint ports for a Service's port list
pub fn ports_from_service(service: &Service) -> Vec<EndpointPort> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| EndpointPort {
                    name: p.name.clone(),
                    port: match &p.target_port {
                        Some(IntOrString::Int(target)) => *target,
                        _ => p.port,
                    },
                    protocol: p.protocol.clone(),
                    app_protocol: p.app_protocol.clone(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// New Endpoints for a Service holding a single IP
pub fn synthesize(service: &Service, ip: &str, ready: bool) -> Endpoints {
    let mut subset = EndpointSubset {
        ports: Some(ports_from_service(service)),
        ..Default::default()
    };
    let list = if ready {
        subset.addresses.get_or_insert_with(Vec::new)
    } else {
        subset.not_ready_addresses.get_or_insert_with(Vec::new)
    };
    add_ip(list, ip);

    Endpoints {
        metadata: ObjectMeta {
            name: Some(service.name_any()),
            namespace: service.namespace(),
            labels: service.metadata.labels.clone(),
            ..Default::default()
        },
        subsets: Some(vec![subset]),
    }
}

/// Place the IP in the list matching `ready` and take it out of the other
///
/// Returns whether anything changed.
pub fn set_readiness(endpoints: &mut Endpoints, ip: &str, ready: bool) -> bool {
    let subsets = endpoints.subsets.get_or_insert_with(Vec::new);
    if subsets.is_empty() {
        subsets.push(EndpointSubset::default());
    }

    let mut changed = false;
    for (i, subset) in subsets.iter_mut().enumerate() {
        let (keep, other) = if ready {
            (&mut subset.addresses, &mut subset.not_ready_addresses)
        } else {
            (&mut subset.not_ready_addresses, &mut subset.addresses)
        };
        if let Some(list) = other.as_mut() {
            changed |= remove_ip(list, ip);
        }
        if i == 0 {
            changed |= add_ip(keep.get_or_insert_with(Vec::new), ip);
        } else if let Some(list) = keep.as_mut() {
            changed |= remove_ip(list, ip);
        }
    }
    changed
}

/// Remove the IP from both lists of every subset; returns whether anything changed
pub fn remove_address(endpoints: &mut Endpoints, ip: &str) -> bool {
    let mut changed = false;
    for subset in endpoints.subsets.iter_mut().flatten() {
        for list in [&mut subset.addresses, &mut subset.not_ready_addresses]
            .into_iter()
            .flatten()
        {
            changed |= remove_ip(list, ip);
        }
    }
    changed
}

/// True when no subset lists any address
pub fn has_no_addresses(endpoints: &Endpoints) -> bool {
    endpoints.subsets.iter().flatten().all(|s| {
        s.addresses.as_ref().map_or(true, Vec::is_empty)
            && s.not_ready_addresses.as_ref().map_or(true, Vec::is_empty)
    })
}

/// Keeps Service Endpoints in line with node Pod events
pub struct EndpointSetReconciler {
    client: Arc<dyn EndpointsClient>,
}

impl EndpointSetReconciler {
    /// Create a reconciler
    pub fn new(client: Arc<dyn EndpointsClient>) -> Self {
        Self { client }
    }

    /// Handle a created or updated node Pod
    pub async fn on_pod_event(&self, pod: &Pod) -> Result<Outcome, Error> {
        let Some(target) = endpoint_target(pod) else {
            debug!(pod = %pod.name_any(), "pod has no endpoint annotations yet");
            return Ok(Outcome::Continue);
        };
        let namespace = pod.namespace().unwrap_or_default();
        let ready = is_endpoint_ready(pod, &target.service);

        let write = match self.client.get_endpoints(&namespace, &target.service).await? {
            Some(mut endpoints) => {
                if !set_readiness(&mut endpoints, &target.ip, ready) {
                    return Ok(Outcome::Continue);
                }
                self.client.replace_endpoints(&namespace, &endpoints).await
            }
            None => {
                let Some(service) = self.client.get_service(&namespace, &target.service).await?
                else {
                    debug!(service = %target.service, "service does not exist yet");
                    return Ok(Outcome::Continue);
                };
                let endpoints = synthesize(&service, &target.ip, ready);
                self.client.create_endpoints(&namespace, &endpoints).await
            }
        };

        match write {
            Ok(()) => {
                info!(
                    pod = %pod.name_any(),
                    service = %target.service,
                    ip = %target.ip,
                    ready,
                    "endpoints updated"
                );
                Ok(Outcome::Continue)
            }
            Err(e) if e.is_conflict() => Ok(Outcome::Requeue(CONFLICT_REQUEUE)),
            Err(e) => Err(e),
        }
    }

    /// Handle a node Pod that is being deleted
    ///
    /// Removes the Pod's IP from both lists and deletes the Endpoints object
    /// once it holds no address at all.
    pub async fn on_pod_deleted(&self, pod: &Pod) -> Result<Outcome, Error> {
        let Some(target) = endpoint_target(pod) else {
            return Ok(Outcome::Continue);
        };
        let namespace = pod.namespace().unwrap_or_default();

        let Some(mut endpoints) = self
            .client
            .get_endpoints(&namespace, &target.service)
            .await?
        else {
            return Ok(Outcome::Continue);
        };

        if !remove_address(&mut endpoints, &target.ip) {
            return Ok(Outcome::Continue);
        }

        let write = if has_no_addresses(&endpoints) {
            self.client
                .delete_endpoints(&namespace, &target.service, endpoints.resource_version())
                .await
        } else {
            self.client.replace_endpoints(&namespace, &endpoints).await
        };

        match write {
            Ok(()) => {
                info!(pod = %pod.name_any(), service = %target.service, ip = %target.ip, "endpoint address removed");
                Ok(Outcome::Continue)
            }
            Err(e) if e.is_not_found() => Ok(Outcome::Continue),
            Err(e) if e.is_conflict() => Ok(Outcome::Requeue(CONFLICT_REQUEUE)),
            Err(e) => Err(e),
        }
    }
}
