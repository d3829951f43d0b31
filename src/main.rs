//! KVM operator - node lifecycle and network identity for KVM-hosted clusters

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use kvm_operator::config::{
    OperatorConfig, DEFAULT_BOOT_TIMEOUT, DEFAULT_RESYNC_INTERVAL, DEFAULT_WORKLOAD_CONNECT_TIMEOUT,
};
use kvm_operator::controller::{error_policy, error_policy_pod, reconcile, reconcile_pod, Context};
use kvm_operator::crd::{DrainerConfig, KvmCluster};
use kvm_operator::key::{FIELD_MANAGER, LABEL_CLUSTER};
use kvm_operator::telemetry::{init_telemetry, LogFormat};

/// KVM operator - keeps node Pods, workload Nodes and Endpoints consistent
#[derive(Parser, Debug)]
#[command(name = "kvm-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log line format
    #[arg(long, value_enum, env = "KVM_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    /// Seconds between cluster resyncs
    #[arg(long, env = "KVM_RESYNC_INTERVAL_SECS", default_value_t = DEFAULT_RESYNC_INTERVAL.as_secs())]
    resync_interval_secs: u64,

    /// Seconds a new node loop may take to boot
    #[arg(long, env = "KVM_BOOT_TIMEOUT_SECS", default_value_t = DEFAULT_BOOT_TIMEOUT.as_secs())]
    boot_timeout_secs: u64,

    /// Seconds allowed for connecting to a workload API
    #[arg(
        long,
        env = "KVM_WORKLOAD_CONNECT_TIMEOUT_SECS",
        default_value_t = DEFAULT_WORKLOAD_CONNECT_TIMEOUT.as_secs()
    )]
    workload_connect_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Workload clients and the management client share one TLS provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        for crd in [KvmCluster::crd(), DrainerConfig::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(cli.log_format)?;

    let config = OperatorConfig::from_secs(
        cli.resync_interval_secs,
        cli.boot_timeout_secs,
        cli.workload_connect_timeout_secs,
    )?;

    run_controllers(config).await
}

/// Install or update the CRDs this operator owns
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for (name, crd) in [
        (KvmCluster::crd_name(), KvmCluster::crd()),
        (DrainerConfig::crd_name(), DrainerConfig::crd()),
    ] {
        tracing::info!(crd = name, "installing CRD");
        crds.patch(name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;
    }

    Ok(())
}

async fn run_controllers(config: OperatorConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    tracing::info!(
        resync_secs = config.resync_interval.as_secs(),
        boot_timeout_secs = config.boot_timeout.as_secs(),
        "starting kvm-operator"
    );

    let ctx = Arc::new(Context::builder(client.clone()).config(config).build());

    let clusters: Api<KvmCluster> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);

    let cluster_controller = Controller::new(clusters, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Cluster reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Cluster reconciliation error");
                }
            }
        });

    let pod_controller = Controller::new(pods, WatcherConfig::default().labels(LABEL_CLUSTER))
        .shutdown_on_signal()
        .run(reconcile_pod, error_policy_pod, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Pod reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Pod reconciliation error");
                }
            }
        });

    tokio::select! {
        _ = cluster_controller => {
            tracing::info!("Cluster controller completed");
        }
        _ = pod_controller => {
            tracing::info!("Pod controller completed");
        }
    }

    ctx.supervisor.shutdown_all().await;
    tracing::info!("kvm-operator stopped");

    Ok(())
}
