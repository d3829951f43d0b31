//! Controllers wiring the node lifecycle components to KvmCluster and Pod events
//!
//! Two controllers share one [`Context`]: the cluster controller keeps node
//! indexes, node loops and stale-address sweeps in step with each KvmCluster;
//! the pod controller maintains Endpoints and drains node Pods on deletion.

mod cluster;
mod finalizer;
mod pod;

use std::sync::Arc;

use kube::Client;

pub use cluster::{error_policy, reconcile};
pub use finalizer::{
    has_finalizer, with_finalizer, without_finalizer, FinalizerClient, KubeFinalizerClient,
};
pub use pod::{error_policy_pod, reconcile_pod};

use crate::config::OperatorConfig;
use crate::drain::{DrainClient, KubeDrainClient, PodDrainCoordinator};
use crate::endpoints::{
    EndpointSetReconciler, EndpointStaleIPSweeper, EndpointsClient, KubeEndpointsClient,
    NodeListerSource, WorkloadNodeListers,
};
use crate::nodecontroller::{
    KubePodConditionClient, LoopLauncher, NodeControllerSupervisor, NodeLoopLauncher,
};
use crate::nodeindex::{KubeNodeIndexClient, NodeIndexClient};
use crate::workload::{KubeCertSource, KubeWorkloadClientFactory, WorkloadClientFactory};

/// Controller context shared by every reconciliation
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(OperatorConfig::default())
///     .build();
/// ```
pub struct Context {
    /// Operator-wide settings
    pub config: OperatorConfig,
    /// Finalizer writes for KvmClusters and Pods
    pub finalizers: Arc<dyn FinalizerClient>,
    /// Node index reads and writes
    pub node_indexes: Arc<dyn NodeIndexClient>,
    /// Per-cluster node loops
    pub supervisor: Arc<NodeControllerSupervisor>,
    /// Workload Node listers for the stale-address sweep
    pub node_listers: Arc<dyn NodeListerSource>,
    /// Endpoints membership of node Pods
    pub endpoints: EndpointSetReconciler,
    /// Stale Endpoints address sweep
    pub sweeper: EndpointStaleIPSweeper,
    /// Node Pod drain handshake
    pub drain: PodDrainCoordinator,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        config: OperatorConfig,
        finalizers: Arc<dyn FinalizerClient>,
        node_indexes: Arc<dyn NodeIndexClient>,
        launcher: Arc<dyn LoopLauncher>,
        node_listers: Arc<dyn NodeListerSource>,
        endpoints: Arc<dyn EndpointsClient>,
        drain: Arc<dyn DrainClient>,
    ) -> Self {
        Self {
            supervisor: Arc::new(NodeControllerSupervisor::new(launcher, config.boot_timeout)),
            config,
            finalizers,
            node_indexes,
            node_listers,
            endpoints: EndpointSetReconciler::new(endpoints.clone()),
            sweeper: EndpointStaleIPSweeper::new(endpoints),
            drain: PodDrainCoordinator::new(drain),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// Every client defaults to its Kubernetes-backed implementation; the
/// override setters exist for tests and alternative wiring.
pub struct ContextBuilder {
    client: Client,
    config: OperatorConfig,
    finalizers: Option<Arc<dyn FinalizerClient>>,
    node_indexes: Option<Arc<dyn NodeIndexClient>>,
    workload: Option<Arc<dyn WorkloadClientFactory>>,
    launcher: Option<Arc<dyn LoopLauncher>>,
    node_listers: Option<Arc<dyn NodeListerSource>>,
    endpoints: Option<Arc<dyn EndpointsClient>>,
    drain: Option<Arc<dyn DrainClient>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            config: OperatorConfig::default(),
            finalizers: None,
            node_indexes: None,
            workload: None,
            launcher: None,
            node_listers: None,
            endpoints: None,
            drain: None,
        }
    }

    /// Set the operator configuration
    pub fn config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the finalizer client
    pub fn finalizer_client(mut self, finalizers: Arc<dyn FinalizerClient>) -> Self {
        self.finalizers = Some(finalizers);
        self
    }

    /// Override the node index client
    pub fn node_index_client(mut self, node_indexes: Arc<dyn NodeIndexClient>) -> Self {
        self.node_indexes = Some(node_indexes);
        self
    }

    /// Override the workload client factory
    pub fn workload_factory(mut self, workload: Arc<dyn WorkloadClientFactory>) -> Self {
        self.workload = Some(workload);
        self
    }

    /// Override the node loop launcher
    pub fn loop_launcher(mut self, launcher: Arc<dyn LoopLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Override the workload Node lister source
    pub fn node_listers(mut self, node_listers: Arc<dyn NodeListerSource>) -> Self {
        self.node_listers = Some(node_listers);
        self
    }

    /// Override the Endpoints client
    pub fn endpoints_client(mut self, endpoints: Arc<dyn EndpointsClient>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    /// Override the drain client
    pub fn drain_client(mut self, drain: Arc<dyn DrainClient>) -> Self {
        self.drain = Some(drain);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let client = self.client;
        let config = self.config;

        let workload = self.workload.unwrap_or_else(|| {
            Arc::new(KubeWorkloadClientFactory::new(
                Arc::new(KubeCertSource::new(client.clone())),
                config.workload_connect_timeout,
            ))
        });
        let launcher = self.launcher.unwrap_or_else(|| {
            Arc::new(NodeLoopLauncher::new(
                workload.clone(),
                Arc::new(KubePodConditionClient::new(client.clone())),
            ))
        });
        let node_listers = self
            .node_listers
            .unwrap_or_else(|| Arc::new(WorkloadNodeListers::new(workload.clone())));
        let endpoints = self
            .endpoints
            .unwrap_or_else(|| Arc::new(KubeEndpointsClient::new(client.clone())));
        let drain = self
            .drain
            .unwrap_or_else(|| Arc::new(KubeDrainClient::new(client.clone())));

        Context {
            supervisor: Arc::new(NodeControllerSupervisor::new(launcher, config.boot_timeout)),
            finalizers: self
                .finalizers
                .unwrap_or_else(|| Arc::new(KubeFinalizerClient::new(client.clone()))),
            node_indexes: self
                .node_indexes
                .unwrap_or_else(|| Arc::new(KubeNodeIndexClient::new(client.clone()))),
            node_listers,
            endpoints: EndpointSetReconciler::new(endpoints.clone()),
            sweeper: EndpointStaleIPSweeper::new(endpoints),
            drain: PodDrainCoordinator::new(drain),
            config,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Mock-backed contexts for the controller tests

    use super::*;
    use crate::drain::MockDrainClient;
    use crate::endpoints::sweeper::MockNodeListerSource;
    use crate::endpoints::MockEndpointsClient;
    use crate::nodecontroller::MockLoopLauncher;
    use crate::nodeindex::MockNodeIndexClient;
    use super::finalizer::MockFinalizerClient;

    /// Mocks for every context seam; unconfigured mocks panic when called
    #[derive(Default)]
    pub struct Mocks {
        pub finalizers: MockFinalizerClient,
        pub node_indexes: MockNodeIndexClient,
        pub launcher: MockLoopLauncher,
        pub node_listers: MockNodeListerSource,
        pub endpoints: MockEndpointsClient,
        pub drain: MockDrainClient,
    }

    impl Mocks {
        pub fn into_context(self) -> Arc<Context> {
            Arc::new(Context::for_testing(
                OperatorConfig::default(),
                Arc::new(self.finalizers),
                Arc::new(self.node_indexes),
                Arc::new(self.launcher),
                Arc::new(self.node_listers),
                Arc::new(self.endpoints),
                Arc::new(self.drain),
            ))
        }
    }
}
