//! Per-cluster node controller supervision
//!
//! The supervisor owns one background [`ControllerHandle`] per workload
//! cluster. The registry mapping cluster keys to handles is the only state
//! shared across reconciliations of different clusters; its lock is held for
//! map operations only, never across API calls or loop start/stop.

mod node_loop;
pub mod propagator;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::KvmCluster;
use crate::outcome::Outcome;
use crate::workload::Availability;
use crate::Error;

pub use node_loop::{NodeEvents, NodeLoop, NodeLoopLauncher};
pub use propagator::{KubePodConditionClient, NodeReadinessPropagator, PodConditionClient};

/// Registry key of a cluster's node controller
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterKey {
    /// Cluster namespace
    pub namespace: String,
    /// KvmCluster name
    pub name: String,
}

impl ClusterKey {
    /// Create a key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Lifecycle of a per-cluster loop
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoopState {
    /// Not started, or stopped
    #[default]
    NotRunning,
    /// Started, waiting for the initial listing
    Booting,
    /// Watching
    Running,
    /// Stop requested
    ShuttingDown,
}

/// Handle to a long-running per-cluster loop
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControllerHandle: Send + Sync {
    /// Start the loop in the background; a second call is a no-op
    fn start(&self);

    /// Resolve once the loop has booted; errors if it exited first
    async fn booted(&self) -> Result<(), Error>;

    /// Stop the loop and wait until it released its watches
    async fn stop(&self);

    /// Current lifecycle state
    fn state(&self) -> LoopState;
}

/// Creates handles for clusters whose workload API is available
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoopLauncher: Send + Sync {
    /// Build a handle for the cluster, or report why none can be built yet
    async fn launch(&self, cluster: &KvmCluster) -> Availability<Arc<dyn ControllerHandle>>;
}

/// Owns one node loop per workload cluster
pub struct NodeControllerSupervisor {
    launcher: Arc<dyn LoopLauncher>,
    boot_timeout: Duration,
    registry: Mutex<HashMap<ClusterKey, Arc<dyn ControllerHandle>>>,
}

impl NodeControllerSupervisor {
    /// Create a supervisor waiting at most `boot_timeout` for new loops
    pub fn new(launcher: Arc<dyn LoopLauncher>, boot_timeout: Duration) -> Self {
        Self {
            launcher,
            boot_timeout,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure a booted loop is registered for the cluster
    ///
    /// Returns `Cancel` when the workload cluster cannot serve a loop yet
    /// (certificates pending, API not answering, boot too slow); the caller
    /// retries on its next reconciliation. Only real failures are errors.
    pub async fn ensure_created(&self, cluster: &KvmCluster) -> Result<Outcome, Error> {
        let key = cluster.controller_key();

        let existing = self.registry.lock().get(&key).cloned();
        if let Some(handle) = existing {
            if handle.state() != LoopState::NotRunning {
                return Ok(Outcome::Continue);
            }
            warn!(cluster = %key, "node loop exited, replacing it");
            self.registry.lock().remove(&key);
        }

        let handle = match self.launcher.launch(cluster).await {
            Availability::Ready(handle) => handle,
            Availability::NotYetAvailable(reason) => {
                info!(cluster = %key, reason = %reason, "workload API not yet available");
                return Ok(Outcome::Cancel);
            }
            Availability::Failed(e) => return Err(e),
        };

        handle.start();
        match tokio::time::timeout(self.boot_timeout, handle.booted()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                handle.stop().await;
                return Err(e);
            }
            Err(_) => {
                warn!(
                    cluster = %key,
                    timeout_secs = self.boot_timeout.as_secs(),
                    "node loop did not boot in time"
                );
                handle.stop().await;
                return Ok(Outcome::Cancel);
            }
        }

        self.registry.lock().insert(key.clone(), handle);
        info!(cluster = %key, name = %cluster.name_any(), "node loop registered");
        Ok(Outcome::Continue)
    }

    /// Stop and unregister the cluster's loop; a no-op when none is registered
    pub async fn ensure_deleted(&self, key: &ClusterKey) {
        let handle = self.registry.lock().get(key).cloned();
        let Some(handle) = handle else {
            debug!(cluster = %key, "no node loop registered");
            return;
        };

        handle.stop().await;
        self.registry.lock().remove(key);
        info!(cluster = %key, "node loop unregistered");
    }

    /// State of the cluster's loop, `NotRunning` when none is registered
    pub fn state_of(&self, key: &ClusterKey) -> LoopState {
        self.registry
            .lock()
            .get(key)
            .map(|h| h.state())
            .unwrap_or_default()
    }

    /// Number of registered loops
    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    /// True when no loop is registered
    pub fn is_empty(&self) -> bool {
        self.registry.lock().is_empty()
    }

    /// Stop every registered loop (process shutdown)
    pub async fn shutdown_all(&self) {
        let handles: Vec<(ClusterKey, Arc<dyn ControllerHandle>)> = self
            .registry
            .lock()
            .drain()
            .collect();

        if !handles.is_empty() {
            info!(count = handles.len(), "stopping all node loops");
        }
        for (_, handle) in handles {
            handle.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::fixtures::cluster;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Handle that boots immediately and tracks stop calls
    fn booting_handle(stops: Arc<AtomicU32>) -> Arc<dyn ControllerHandle> {
        let state = Arc::new(Mutex::new(LoopState::NotRunning));
        let mut handle = MockControllerHandle::new();

        let s = state.clone();
        handle.expect_start().returning(move || *s.lock() = LoopState::Running);
        handle.expect_booted().returning(|| Ok(()));
        let s = state.clone();
        handle.expect_stop().returning(move || {
            stops.fetch_add(1, Ordering::SeqCst);
            *s.lock() = LoopState::NotRunning;
        });
        let s = state;
        handle.expect_state().returning(move || *s.lock());
        Arc::new(handle)
    }

    /// Handle whose boot never completes
    struct StuckHandle {
        stopped: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ControllerHandle for StuckHandle {
        fn start(&self) {}

        async fn booted(&self) -> Result<(), Error> {
            std::future::pending().await
        }

        async fn stop(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }

        fn state(&self) -> LoopState {
            LoopState::Booting
        }
    }

    fn supervisor(launcher: MockLoopLauncher) -> NodeControllerSupervisor {
        NodeControllerSupervisor::new(Arc::new(launcher), Duration::from_millis(50))
    }

    /// Story: a cluster gets exactly one loop no matter how often it reconciles
    #[tokio::test]
    async fn story_loop_is_created_once_and_reused() {
        let stops = Arc::new(AtomicU32::new(0));
        let mut launcher = MockLoopLauncher::new();
        let s = stops.clone();
        launcher
            .expect_launch()
            .times(1)
            .returning(move |_| Availability::Ready(booting_handle(s.clone())));

        let sup = supervisor(launcher);
        let c = cluster("abc12", &["m1"], &[]);

        assert_eq!(sup.ensure_created(&c).await.expect("create"), Outcome::Continue);
        assert_eq!(sup.ensure_created(&c).await.expect("reuse"), Outcome::Continue);
        assert_eq!(sup.len(), 1);
        assert_eq!(sup.state_of(&c.controller_key()), LoopState::Running);
    }

    #[tokio::test]
    async fn not_yet_available_cancels_without_registering() {
        let mut launcher = MockLoopLauncher::new();
        launcher
            .expect_launch()
            .returning(|_| Availability::NotYetAvailable("secret abc12/abc12-api not found".into()));

        let sup = supervisor(launcher);
        let c = cluster("abc12", &["m1"], &[]);
        assert_eq!(sup.ensure_created(&c).await.expect("benign"), Outcome::Cancel);
        assert!(sup.is_empty());
    }

    #[tokio::test]
    async fn launch_failures_are_escalated() {
        let mut launcher = MockLoopLauncher::new();
        launcher
            .expect_launch()
            .returning(|_| Availability::Failed(Error::workload_client("abc12", "bad key")));

        let sup = supervisor(launcher);
        let c = cluster("abc12", &["m1"], &[]);
        assert!(sup.ensure_created(&c).await.is_err());
        assert!(sup.is_empty());
    }

    #[tokio::test]
    async fn boot_timeout_stops_the_loop_and_cancels() {
        let stopped = Arc::new(AtomicU32::new(0));
        let mut launcher = MockLoopLauncher::new();
        let s = stopped.clone();
        launcher.expect_launch().returning(move |_| {
            Availability::Ready(Arc::new(StuckHandle { stopped: s.clone() }) as Arc<dyn ControllerHandle>)
        });

        let sup = supervisor(launcher);
        let c = cluster("abc12", &["m1"], &[]);
        assert_eq!(sup.ensure_created(&c).await.expect("timeout"), Outcome::Cancel);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(sup.is_empty());
    }

    /// Story: deleting a cluster stops its loop before the entry disappears,
    /// and deleting again is harmless
    #[tokio::test]
    async fn story_delete_is_idempotent() {
        let stops = Arc::new(AtomicU32::new(0));
        let mut launcher = MockLoopLauncher::new();
        let s = stops.clone();
        launcher
            .expect_launch()
            .returning(move |_| Availability::Ready(booting_handle(s.clone())));

        let sup = supervisor(launcher);
        let c = cluster("abc12", &["m1"], &[]);
        sup.ensure_created(&c).await.expect("create");

        sup.ensure_deleted(&c.controller_key()).await;
        sup.ensure_deleted(&c.controller_key()).await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(sup.is_empty());

        // never-booted cluster
        sup.ensure_deleted(&ClusterKey::new("other", "other")).await;
    }

    #[tokio::test]
    async fn recreate_after_delete_starts_a_fresh_loop() {
        let stops = Arc::new(AtomicU32::new(0));
        let mut launcher = MockLoopLauncher::new();
        let s = stops.clone();
        launcher
            .expect_launch()
            .times(2)
            .returning(move |_| Availability::Ready(booting_handle(s.clone())));

        let sup = supervisor(launcher);
        let c = cluster("abc12", &["m1"], &[]);
        sup.ensure_created(&c).await.expect("create");
        sup.ensure_deleted(&c.controller_key()).await;
        sup.ensure_created(&c).await.expect("recreate");
        assert_eq!(sup.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_all_stops_every_loop() {
        let stops = Arc::new(AtomicU32::new(0));
        let mut launcher = MockLoopLauncher::new();
        let s = stops.clone();
        launcher
            .expect_launch()
            .returning(move |_| Availability::Ready(booting_handle(s.clone())));

        let sup = supervisor(launcher);
        for id in ["abc12", "def34"] {
            sup.ensure_created(&cluster(id, &["m1"], &[]))
                .await
                .expect("create");
        }

        sup.shutdown_all().await;
        assert_eq!(stops.load(Ordering::SeqCst), 2);
        assert!(sup.is_empty());
    }

    #[test]
    fn cluster_key_displays_namespace_and_name() {
        assert_eq!(ClusterKey::new("abc12", "abc12").to_string(), "abc12/abc12");
    }
}
