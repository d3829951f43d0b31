//! Per-cluster workload Node watch loop
//!
//! One [`NodeLoop`] runs per workload cluster. It watches the cluster's Nodes
//! and hands every event to the [`NodeReadinessPropagator`]. The loop reports
//! booted once the watcher delivered its initial listing.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::propagator::{NodeReadinessPropagator, PodConditionClient};
use super::{ControllerHandle, LoopLauncher, LoopState};
use crate::crd::KvmCluster;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::workload::{Availability, WorkloadClientFactory};
use crate::Error;

/// How long `stop` waits for the loop task before aborting it
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Attempts per propagation before the event is dropped
const PROPAGATE_ATTEMPTS: u32 = 3;

/// Node watch events feeding a loop
pub type NodeEvents = BoxStream<'static, Result<Event<Node>, watcher::Error>>;

/// Background watch loop for one workload cluster
pub struct NodeLoop {
    cluster_id: String,
    propagator: Arc<NodeReadinessPropagator>,
    cancel: CancellationToken,
    pending: Mutex<Option<(NodeEvents, watch::Sender<bool>)>>,
    booted_rx: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    state: Arc<Mutex<LoopState>>,
}

impl NodeLoop {
    /// Create a loop watching Nodes through `workload`
    pub fn new(
        cluster_id: impl Into<String>,
        workload: Client,
        propagator: Arc<NodeReadinessPropagator>,
    ) -> Self {
        let nodes: Api<Node> = Api::all(workload);
        let events = kube::runtime::watcher(nodes, watcher::Config::default())
            .default_backoff()
            .boxed();
        Self::from_events(cluster_id, events, propagator)
    }

    /// Create a loop consuming an existing event stream
    pub fn from_events(
        cluster_id: impl Into<String>,
        events: NodeEvents,
        propagator: Arc<NodeReadinessPropagator>,
    ) -> Self {
        let (booted_tx, booted_rx) = watch::channel(false);
        Self {
            cluster_id: cluster_id.into(),
            propagator,
            cancel: CancellationToken::new(),
            pending: Mutex::new(Some((events, booted_tx))),
            booted_rx,
            task: Mutex::new(None),
            state: Arc::new(Mutex::new(LoopState::NotRunning)),
        }
    }
}

#[async_trait]
impl ControllerHandle for NodeLoop {
    fn start(&self) {
        let Some((events, booted_tx)) = self.pending.lock().take() else {
            debug!(cluster = %self.cluster_id, "node loop already started");
            return;
        };

        *self.state.lock() = LoopState::Booting;
        let task = tokio::spawn(run(
            self.cluster_id.clone(),
            events,
            self.propagator.clone(),
            self.cancel.clone(),
            booted_tx,
            self.state.clone(),
        ));
        *self.task.lock() = Some(task);
        info!(cluster = %self.cluster_id, "node loop started");
    }

    async fn booted(&self) -> Result<(), Error> {
        let mut rx = self.booted_rx.clone();
        rx.wait_for(|booted| *booted)
            .await
            .map(|_| ())
            .map_err(|_| Error::internal_with_context("node-loop", "loop exited before booting"))
    }

    async fn stop(&self) {
        *self.state.lock() = LoopState::ShuttingDown;
        self.cancel.cancel();
        // never started: release the boot signal so waiters see the exit
        self.pending.lock().take();

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!(cluster = %self.cluster_id, "node loop did not stop in time, aborting");
                task.abort();
            }
        }

        *self.state.lock() = LoopState::NotRunning;
        info!(cluster = %self.cluster_id, "node loop stopped");
    }

    fn state(&self) -> LoopState {
        *self.state.lock()
    }
}

async fn run<S>(
    cluster_id: String,
    events: S,
    propagator: Arc<NodeReadinessPropagator>,
    cancel: CancellationToken,
    booted_tx: watch::Sender<bool>,
    state: Arc<Mutex<LoopState>>,
) where
    S: Stream<Item = Result<Event<Node>, watcher::Error>>,
{
    let mut events = pin!(events);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(Ok(event)) => {
                    handle_event(&cluster_id, &propagator, event, &booted_tx, &state).await;
                }
                Some(Err(e)) => {
                    warn!(cluster = %cluster_id, error = %e, "workload node watch error");
                }
                None => {
                    warn!(cluster = %cluster_id, "workload node watch ended");
                    break;
                }
            },
        }
    }

    let mut state = state.lock();
    if *state != LoopState::ShuttingDown {
        *state = LoopState::NotRunning;
    }
}

async fn handle_event(
    cluster_id: &str,
    propagator: &NodeReadinessPropagator,
    event: Event<Node>,
    booted_tx: &watch::Sender<bool>,
    state: &Mutex<LoopState>,
) {
    match event {
        Event::Init => debug!(cluster = %cluster_id, "listing workload nodes"),
        Event::InitDone => {
            if !*booted_tx.borrow() {
                *state.lock() = LoopState::Running;
                booted_tx.send_replace(true);
                info!(cluster = %cluster_id, "node loop booted");
            }
        }
        Event::Apply(node) | Event::InitApply(node) => {
            let name = node.name_any();
            let result = retry_with_backoff(
                &RetryConfig::with_max_attempts(PROPAGATE_ATTEMPTS),
                "propagate_node_readiness",
                || propagator.propagate(&node),
            )
            .await;
            if let Err(e) = result {
                error!(cluster = %cluster_id, node = %name, error = %e, "failed to propagate node readiness");
            }
        }
        Event::Delete(node) => {
            let name = node.name_any();
            let result = retry_with_backoff(
                &RetryConfig::with_max_attempts(PROPAGATE_ATTEMPTS),
                "propagate_node_deleted",
                || propagator.propagate_deleted(&node),
            )
            .await;
            if let Err(e) = result {
                error!(cluster = %cluster_id, node = %name, error = %e, "failed to propagate node deletion");
            }
        }
    }
}

/// Launches [`NodeLoop`]s with clients from a [`WorkloadClientFactory`]
pub struct NodeLoopLauncher {
    factory: Arc<dyn WorkloadClientFactory>,
    pods: Arc<dyn PodConditionClient>,
}

impl NodeLoopLauncher {
    /// Create a launcher
    pub fn new(factory: Arc<dyn WorkloadClientFactory>, pods: Arc<dyn PodConditionClient>) -> Self {
        Self { factory, pods }
    }
}

#[async_trait]
impl LoopLauncher for NodeLoopLauncher {
    async fn launch(&self, cluster: &KvmCluster) -> Availability<Arc<dyn ControllerHandle>> {
        let cluster_id = cluster.cluster_id().to_string();
        let namespace = cluster.cluster_namespace();

        self.factory
            .client_for(&cluster_id, &cluster.api_endpoint())
            .await
            .map(|client| {
                let propagator = Arc::new(NodeReadinessPropagator::new(self.pods.clone(), namespace));
                Arc::new(NodeLoop::new(cluster_id, client, propagator)) as Arc<dyn ControllerHandle>
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::fixtures::node;
    use crate::nodecontroller::propagator::MockPodConditionClient;
    use crate::workload::MockWorkloadClientFactory;

    fn propagator_with(mock: MockPodConditionClient) -> NodeReadinessPropagator {
        NodeReadinessPropagator::new(Arc::new(mock), "abc12")
    }

    #[tokio::test]
    async fn init_done_marks_loop_booted_once() {
        let propagator = propagator_with(MockPodConditionClient::new());
        let (tx, rx) = watch::channel(false);
        let state = Mutex::new(LoopState::Booting);

        handle_event("abc12", &propagator, Event::Init, &tx, &state).await;
        assert!(!*rx.borrow());

        handle_event("abc12", &propagator, Event::InitDone, &tx, &state).await;
        assert!(*rx.borrow());
        assert_eq!(*state.lock(), LoopState::Running);
    }

    #[tokio::test]
    async fn apply_and_delete_events_reach_the_propagator() {
        let mut mock = MockPodConditionClient::new();
        mock.expect_get_pod().times(2).returning(|_, _| Ok(None));
        let propagator = propagator_with(mock);
        let (tx, _rx) = watch::channel(true);
        let state = Mutex::new(LoopState::Running);

        let n = node("worker-1", "10.0.0.5", Some("True"));
        handle_event("abc12", &propagator, Event::Apply(n.clone()), &tx, &state).await;
        handle_event("abc12", &propagator, Event::Delete(n), &tx, &state).await;
    }

    #[tokio::test]
    async fn propagation_failures_do_not_stop_the_loop() {
        let mut mock = MockPodConditionClient::new();
        mock.expect_get_pod()
            .times(PROPAGATE_ATTEMPTS as usize)
            .returning(|_, _| Err(crate::error::api_error(500, "InternalError")));
        let propagator = propagator_with(mock);
        let (tx, _rx) = watch::channel(true);
        let state = Mutex::new(LoopState::Running);

        let n = node("worker-1", "10.0.0.5", Some("True"));
        handle_event("abc12", &propagator, Event::InitApply(n), &tx, &state).await;
        assert_eq!(*state.lock(), LoopState::Running);
    }

    type EventSender = futures::channel::mpsc::UnboundedSender<Result<Event<Node>, watcher::Error>>;

    fn channel_loop() -> (NodeLoop, EventSender) {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let propagator = Arc::new(propagator_with(MockPodConditionClient::new()));
        (NodeLoop::from_events("abc12", rx.boxed(), propagator), tx)
    }

    async fn wait_for_state(node_loop: &NodeLoop, expected: LoopState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while node_loop.state() != expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("state reached in time");
    }

    /// Story: a loop boots on the initial listing and releases its watch on stop
    #[tokio::test]
    async fn story_loop_boots_on_init_done_and_stops_cleanly() {
        let (node_loop, tx) = channel_loop();
        node_loop.start();
        assert_eq!(node_loop.state(), LoopState::Booting);

        tx.unbounded_send(Ok(Event::Init)).expect("send");
        tx.unbounded_send(Ok(Event::InitDone)).expect("send");
        tokio::time::timeout(Duration::from_secs(5), node_loop.booted())
            .await
            .expect("booted in time")
            .expect("booted");
        assert_eq!(node_loop.state(), LoopState::Running);

        node_loop.stop().await;
        assert_eq!(node_loop.state(), LoopState::NotRunning);
        assert!(node_loop.task.lock().is_none());
        // the task owned the stream; joining it dropped the receiver
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn stop_before_boot_fails_the_boot_wait() {
        let (node_loop, tx) = channel_loop();
        node_loop.start();
        tx.unbounded_send(Ok(Event::Init)).expect("send");

        node_loop.stop().await;
        let result = tokio::time::timeout(Duration::from_secs(5), node_loop.booted())
            .await
            .expect("boot wait ends");
        assert!(result.is_err());
        assert_eq!(node_loop.state(), LoopState::NotRunning);
    }

    #[tokio::test]
    async fn stop_without_start_fails_the_boot_wait() {
        let (node_loop, _tx) = channel_loop();
        node_loop.stop().await;
        assert!(node_loop.booted().await.is_err());
    }

    #[tokio::test]
    async fn ended_stream_marks_loop_not_running() {
        let (node_loop, tx) = channel_loop();
        node_loop.start();
        tx.unbounded_send(Ok(Event::InitDone)).expect("send");
        node_loop.booted().await.expect("booted");

        drop(tx);
        wait_for_state(&node_loop, LoopState::NotRunning).await;
    }

    #[tokio::test]
    async fn stream_ending_before_boot_fails_the_boot_wait() {
        let (node_loop, tx) = channel_loop();
        node_loop.start();
        drop(tx);

        let result = tokio::time::timeout(Duration::from_secs(5), node_loop.booted())
            .await
            .expect("boot wait ends");
        assert!(result.is_err());
        wait_for_state(&node_loop, LoopState::NotRunning).await;
    }

    #[tokio::test]
    async fn launcher_passes_through_not_yet_available() {
        let mut factory = MockWorkloadClientFactory::new();
        factory
            .expect_client_for()
            .withf(|id, endpoint| id == "abc12" && endpoint == "https://api.abc12.k8s.example.com")
            .returning(|_, _| Availability::NotYetAvailable("certs pending".to_string()));

        let launcher = NodeLoopLauncher::new(Arc::new(factory), Arc::new(MockPodConditionClient::new()));
        let cluster = crate::crd::fixtures::cluster("abc12", &["m1"], &[]);
        assert!(matches!(
            launcher.launch(&cluster).await,
            Availability::NotYetAvailable(_)
        ));
    }
}
