//! Node Pod controller
//!
//! Live Pods get the drain finalizer and an up-to-date Endpoints entry.
//! Deleting Pods first leave the Endpoints, then go through the drain
//! handshake; the finalizer is released only when the drain says so.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use super::finalizer::{has_finalizer, tolerate_not_found, with_finalizer, without_finalizer};
use super::Context;
use crate::key::POD_DRAIN_FINALIZER;
use crate::Error;

/// Reconcile a node Pod
#[instrument(skip(pod, ctx), fields(pod = %pod.name_any(), namespace = %pod.namespace().unwrap_or_default()))]
pub async fn reconcile_pod(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let resync = ctx.config.resync_interval;

    if pod.metadata.deletion_timestamp.is_none() {
        if let Some(finalizers) = with_finalizer(pod.as_ref(), POD_DRAIN_FINALIZER) {
            debug!("adding drain finalizer");
            ctx.finalizers
                .set_pod_finalizers(&namespace, &name, finalizers)
                .await?;
        }
        let outcome = ctx.endpoints.on_pod_event(&pod).await?;
        return Ok(outcome.into_action(resync));
    }

    if !has_finalizer(pod.as_ref(), POD_DRAIN_FINALIZER) {
        return Ok(Action::await_change());
    }

    let outcome = ctx.endpoints.on_pod_deleted(&pod).await?;
    if !outcome.should_continue() {
        return Ok(outcome.into_action(resync));
    }

    let outcome = ctx.drain.reconcile(&namespace, &name).await?;
    if outcome.keeps_finalizer() {
        debug!(?outcome, "drain not finished");
        return Ok(outcome.into_action(resync));
    }

    if let Some(finalizers) = without_finalizer(pod.as_ref(), POD_DRAIN_FINALIZER) {
        tolerate_not_found(
            ctx.finalizers
                .set_pod_finalizers(&namespace, &name, finalizers)
                .await,
        )?;
        info!("drain finalizer released");
    }
    Ok(Action::await_change())
}

/// Error policy for the Pod controller
pub fn error_policy_pod(pod: Arc<Pod>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        pod = %pod.name_any(),
        namespace = %pod.namespace().unwrap_or_default(),
        "pod reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::Mocks;
    use crate::crd::fixtures::cluster;
    use crate::crd::{
        Condition, ConditionStatus, DrainerConfig, DrainerConfigStatus, CONDITION_DRAINED,
    };
    use crate::endpoints::fixtures::{endpoints, service};
    use crate::endpoints::CONFLICT_REQUEUE;
    use crate::error::api_error;
    use crate::key::fixtures::{pod, with_annotation, with_condition, with_running_container};
    use crate::key::{
        ANNOTATION_IP, ANNOTATION_SERVICE, CONDITION_POD_READY, CONDITION_WORKLOAD_NODE_READY,
        WORKER_SERVICE,
    };
    use crate::outcome::KEEP_FINALIZER_REQUEUE;

    fn node_pod() -> Pod {
        let p = with_annotation(pod("abc12", "worker-1"), ANNOTATION_IP, "10.0.0.5");
        with_running_container(with_annotation(p, ANNOTATION_SERVICE, WORKER_SERVICE))
    }

    fn with_drain_finalizer(mut p: Pod) -> Pod {
        p.metadata.finalizers = Some(vec![POD_DRAIN_FINALIZER.to_string()]);
        p
    }

    fn deleting(mut p: Pod) -> Pod {
        p.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        p
    }

    fn drained_config() -> DrainerConfig {
        let mut config = DrainerConfig::for_node(
            "abc12",
            "worker-1",
            "abc12",
            "https://api.abc12.k8s.example.com",
        );
        config.status = Some(DrainerConfigStatus {
            conditions: vec![Condition::new(
                CONDITION_DRAINED,
                ConditionStatus::True,
                "Drained",
                "node drained",
            )],
        });
        config
    }

    #[tokio::test]
    async fn live_pod_gets_finalizer_and_endpoints() {
        let mut mocks = Mocks::default();
        mocks
            .finalizers
            .expect_set_pod_finalizers()
            .withf(|ns, name, f| {
                ns == "abc12" && name == "worker-1" && f == &vec![POD_DRAIN_FINALIZER.to_string()]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        mocks.endpoints.expect_get_endpoints().returning(|_, _| Ok(None));
        mocks
            .endpoints
            .expect_get_service()
            .returning(|ns, name| Ok(Some(service(ns, name))));
        mocks
            .endpoints
            .expect_create_endpoints()
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = mocks.into_context();
        let action = reconcile_pod(Arc::new(node_pod()), ctx.clone())
            .await
            .expect("reconcile");
        assert_eq!(action, Action::requeue(ctx.config.resync_interval));
    }

    #[tokio::test]
    async fn endpoints_conflict_requeues_quickly() {
        let mut mocks = Mocks::default();
        mocks
            .endpoints
            .expect_get_endpoints()
            .returning(|ns, name| Ok(Some(endpoints(ns, name, &[], &["10.0.0.5"]))));
        mocks
            .endpoints
            .expect_replace_endpoints()
            .returning(|_, _| Err(api_error(409, "Conflict")));

        let ready = with_condition(node_pod(), CONDITION_POD_READY, "True");
        let p = with_drain_finalizer(with_condition(ready, CONDITION_WORKLOAD_NODE_READY, "True"));
        let ctx = mocks.into_context();
        assert_eq!(
            reconcile_pod(Arc::new(p), ctx).await.expect("reconcile"),
            Action::requeue(CONFLICT_REQUEUE)
        );
    }

    /// Story: a deleting worker Pod leaves the Endpoints, then waits for drain
    ///
    /// The first pass removes 10.0.0.5 from the worker Endpoints and creates a
    /// DrainerConfig; the finalizer stays. Once the drainer reports Drained the
    /// Pod is annotated, force-deleted, and the finalizer released.
    #[tokio::test]
    async fn story_deleting_pod_is_drained_before_release() {
        let p = deleting(with_drain_finalizer(node_pod()));

        let first = {
            let mut mocks = Mocks::default();
            mocks.endpoints.expect_get_endpoints().returning(|ns, name| {
                Ok(Some(endpoints(ns, name, &["10.0.0.5", "10.0.0.6"], &[])))
            });
            mocks
                .endpoints
                .expect_replace_endpoints()
                .times(1)
                .returning(|_, _| Ok(()));
            let live = p.clone();
            mocks
                .drain
                .expect_get_pod()
                .returning(move |_, _| Ok(Some(live.clone())));
            mocks
                .drain
                .expect_get_cluster()
                .returning(|name| Ok(Some(cluster(name, &[], &["worker-1"]))));
            mocks.drain.expect_get_drainer_config().returning(|_, _| Ok(None));
            mocks
                .drain
                .expect_create_drainer_config()
                .times(1)
                .returning(|_| Ok(()));
            mocks.finalizers.expect_set_pod_finalizers().never();
            mocks.into_context()
        };
        assert_eq!(
            reconcile_pod(Arc::new(p.clone()), first).await.expect("first pass"),
            Action::requeue(KEEP_FINALIZER_REQUEUE)
        );

        let second = {
            let mut mocks = Mocks::default();
            // address already gone from the Endpoints
            mocks
                .endpoints
                .expect_get_endpoints()
                .returning(|ns, name| Ok(Some(endpoints(ns, name, &["10.0.0.6"], &[]))));
            let live = p.clone();
            mocks
                .drain
                .expect_get_pod()
                .returning(move |_, _| Ok(Some(live.clone())));
            mocks
                .drain
                .expect_get_cluster()
                .returning(|name| Ok(Some(cluster(name, &[], &["worker-1"]))));
            mocks
                .drain
                .expect_get_drainer_config()
                .returning(|_, _| Ok(Some(drained_config())));
            mocks
                .drain
                .expect_delete_drainer_config()
                .times(1)
                .returning(|_, _| Ok(()));
            mocks.drain.expect_replace_pod().times(1).returning(|_| Ok(()));
            mocks
                .drain
                .expect_delete_pod_now()
                .times(1)
                .returning(|_, _| Ok(()));
            mocks
                .finalizers
                .expect_set_pod_finalizers()
                .withf(|_, _, f| f.is_empty())
                .times(1)
                .returning(|_, _, _| Ok(()));
            mocks.into_context()
        };
        assert_eq!(
            reconcile_pod(Arc::new(p), second).await.expect("second pass"),
            Action::await_change()
        );
    }

    #[tokio::test]
    async fn deleting_pod_without_finalizer_is_left_alone() {
        let mut mocks = Mocks::default();
        mocks.endpoints.expect_get_endpoints().never();
        mocks.drain.expect_get_pod().never();

        let ctx = mocks.into_context();
        assert_eq!(
            reconcile_pod(Arc::new(deleting(node_pod())), ctx)
                .await
                .expect("reconcile"),
            Action::await_change()
        );
    }

    #[tokio::test]
    async fn endpoints_conflict_on_delete_keeps_the_finalizer() {
        let mut mocks = Mocks::default();
        mocks
            .endpoints
            .expect_get_endpoints()
            .returning(|ns, name| Ok(Some(endpoints(ns, name, &["10.0.0.5", "10.0.0.6"], &[]))));
        mocks
            .endpoints
            .expect_replace_endpoints()
            .returning(|_, _| Err(api_error(409, "Conflict")));
        mocks.drain.expect_get_pod().never();
        mocks.finalizers.expect_set_pod_finalizers().never();

        let ctx = mocks.into_context();
        assert_eq!(
            reconcile_pod(Arc::new(deleting(with_drain_finalizer(node_pod()))), ctx)
                .await
                .expect("reconcile"),
            Action::requeue(CONFLICT_REQUEUE)
        );
    }

    #[tokio::test]
    async fn deleting_pod_of_deleted_cluster_releases_finalizer() {
        let mut mocks = Mocks::default();
        mocks.endpoints.expect_get_endpoints().returning(|_, _| Ok(None));
        let live = deleting(with_drain_finalizer(node_pod()));
        mocks
            .drain
            .expect_get_pod()
            .returning(move |_, _| Ok(Some(live.clone())));
        mocks.drain.expect_get_cluster().returning(|_| Ok(None));
        mocks
            .finalizers
            .expect_set_pod_finalizers()
            .times(1)
            .returning(|_, _, _| Err(api_error(404, "NotFound")));

        let ctx = mocks.into_context();
        assert_eq!(
            reconcile_pod(Arc::new(deleting(with_drain_finalizer(node_pod()))), ctx)
                .await
                .expect("reconcile"),
            Action::await_change()
        );
    }
}
