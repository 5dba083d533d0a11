//! Pruner - cluster-node deprovisioning controller

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::watcher::{watcher, Config as WatcherConfig, Event};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pruner::api::KubeApiClient;
use pruner::clock::SystemClock;
use pruner::cloud::CloudProvider;
use pruner::crd::Provisioner;
use pruner::deprovisioning::{DeprovisioningController, PassOutcome};
use pruner::events::KubeEventPublisher;
use pruner::state::ClusterState;

/// Pruner - deletes and replaces expired, empty, and cost-suboptimal
/// cluster nodes
#[derive(Parser, Debug)]
#[command(name = "pruner", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Seconds between deprovisioning passes
    #[arg(long, default_value = "10")]
    trigger_interval_secs: u64,

    /// Seconds to wait between computing a command and executing it
    #[arg(long, default_value = "30")]
    validation_delay_secs: u64,

    /// Path to a JSON instance-type catalog used for pricing decisions
    /// when no cloud integration is configured
    #[arg(long)]
    catalog_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Provisioner::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller(cli).await
}

/// Keep the cluster-state cache in sync with the API server.
fn spawn_watchers(client: Client, state: Arc<ClusterState>) {
    let nodes: Api<Node> = Api::all(client.clone());
    let node_state = state.clone();
    tokio::spawn(async move {
        let mut stream = std::pin::pin!(watcher(nodes, WatcherConfig::default()));
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(node) | Event::InitApply(node)) => node_state.upsert_node(node),
                Ok(Event::Delete(node)) => node_state.delete_node(&node.name_any()),
                Ok(Event::Init | Event::InitDone) => {}
                Err(e) => tracing::warn!(error = %e, "Node watch error"),
            }
        }
    });

    let pods: Api<Pod> = Api::all(client.clone());
    let pod_state = state.clone();
    tokio::spawn(async move {
        let mut stream = std::pin::pin!(watcher(pods, WatcherConfig::default()));
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(pod) | Event::InitApply(pod)) => pod_state.upsert_pod(pod),
                Ok(Event::Delete(pod)) => {
                    pod_state.delete_pod(&pod.namespace().unwrap_or_default(), &pod.name_any())
                }
                Ok(Event::Init | Event::InitDone) => {}
                Err(e) => tracing::warn!(error = %e, "Pod watch error"),
            }
        }
    });

    let provisioners: Api<Provisioner> = Api::all(client);
    tokio::spawn(async move {
        let mut stream = std::pin::pin!(watcher(provisioners, WatcherConfig::default()));
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(p) | Event::InitApply(p)) => state.upsert_provisioner(p),
                Ok(Event::Delete(p)) => state.delete_provisioner(&p.name_any()),
                Ok(Event::Init | Event::InitDone) => {}
                Err(e) => tracing::warn!(error = %e, "Provisioner watch error"),
            }
        }
    });
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Pruner controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let state = Arc::new(ClusterState::new());
    spawn_watchers(client.clone(), state.clone());

    // Without a real cloud integration, decisions are priced against a
    // static catalog and replacement launches fail safely (rollback);
    // delete-only deprovisioning still works end to end.
    let catalog = match &cli.catalog_file {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read catalog {}: {}", path.display(), e))?;
            serde_json::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("Failed to parse catalog {}: {}", path.display(), e))?
        }
        None => Vec::new(),
    };
    let cloud: Arc<dyn CloudProvider> = Arc::new(pruner::cloud::StaticCloudProvider::new(catalog));
    let scheduler = Arc::new(pruner::simulation::FirstFitScheduler);

    let controller = DeprovisioningController::new(
        Arc::new(SystemClock),
        state,
        cloud,
        scheduler,
        Arc::new(KubeApiClient::new(client.clone())),
        Arc::new(KubeEventPublisher::new(client, "pruner")),
    )
    .with_validation_delay(Duration::from_secs(cli.validation_delay_secs));

    let interval = Duration::from_secs(cli.trigger_interval_secs);
    tracing::info!(
        interval_secs = cli.trigger_interval_secs,
        "Starting deprovisioning trigger loop"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Pruner controller shutting down");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }
        match controller.process_cluster().await {
            Ok(PassOutcome::NothingToDo) => tracing::debug!("Pass complete: nothing to do"),
            Ok(PassOutcome::Invalidated) => {
                tracing::info!("Pass complete: command invalidated during stabilization")
            }
            Ok(PassOutcome::Executed {
                reason,
                removed,
                launched,
            }) => {
                tracing::info!(reason, nodes = ?removed, launched, "Pass complete: command executed")
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "Pass failed; retrying on next trigger")
            }
            Err(e) => tracing::error!(error = %e, "Pass failed with non-retryable error"),
        }
    }
}
