//! KvmCluster controller
//!
//! Keeps per-cluster state in step with each KvmCluster: the node index map,
//! the workload node loop and the periodic stale-address sweep. Deletion stops
//! the node loop before the finalizer is released.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::finalizer::{tolerate_not_found, with_finalizer, without_finalizer};
use super::Context;
use crate::crd::KvmCluster;
use crate::key::CLUSTER_FINALIZER;
use crate::nodeindex::ensure_node_indexes;
use crate::workload::Availability;
use crate::Error;

/// Reconcile a KvmCluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<KvmCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = cluster.name_any();
    let resync = ctx.config.resync_interval;

    if cluster.is_deleted() {
        return finalize(&cluster, &ctx).await;
    }

    if let Err(e) = cluster.spec.validate() {
        warn!(error = %e, "invalid cluster spec, waiting for a change");
        return Ok(Action::await_change());
    }

    if let Some(finalizers) = with_finalizer(cluster.as_ref(), CLUSTER_FINALIZER) {
        debug!("adding node controller finalizer");
        ctx.finalizers.set_cluster_finalizers(&name, finalizers).await?;
    }

    let indexes = ensure_node_indexes(ctx.node_indexes.as_ref(), &cluster).await?;
    debug!(nodes = indexes.len(), "node indexes in place");

    let outcome = ctx.supervisor.ensure_created(&cluster).await?;
    if !outcome.should_continue() {
        debug!(?outcome, "node loop not running yet");
        return Ok(outcome.into_action(resync));
    }

    match ctx.node_listers.lister_for(&cluster).await {
        Availability::Ready(lister) => {
            let report = ctx
                .sweeper
                .sweep(&cluster.cluster_namespace(), lister.as_ref())
                .await?;
            debug!(skipped = report.skipped, removed = report.removed, "endpoint sweep done");
        }
        Availability::NotYetAvailable(reason) => {
            debug!(%reason, "workload api not reachable, skipping endpoint sweep");
        }
        Availability::Failed(e) => return Err(e),
    }

    Ok(Action::requeue(resync))
}

async fn finalize(cluster: &KvmCluster, ctx: &Context) -> Result<Action, Error> {
    ctx.supervisor.ensure_deleted(&cluster.controller_key()).await;

    if let Some(finalizers) = without_finalizer(cluster, CLUSTER_FINALIZER) {
        tolerate_not_found(
            ctx.finalizers
                .set_cluster_finalizers(&cluster.name_any(), finalizers)
                .await,
        )?;
        info!("node controller released");
    }

    Ok(Action::await_change())
}

/// Error policy for the KvmCluster controller
pub fn error_policy(cluster: Arc<KvmCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}
