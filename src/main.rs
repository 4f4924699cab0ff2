use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rudder::controller::Controller;
use rudder::k8s::get_pod_details;
use rudder::proxy::AdminEndpoint;
use rudder::storage::SecretStorage;
use rudder::store::Options;

/// Kubernetes ingress controller for the embedded rudder proxy.
#[derive(Parser, Debug)]
#[command(name = "rudder", version, about)]
struct Args {
    /// Namespace to watch ingress resources in (empty = all namespaces).
    #[arg(long, default_value = "")]
    namespace: String,

    /// IngressClass this controller claims.
    #[arg(long, default_value = "rudder")]
    class_name: String,

    /// Reject ingresses that carry no class at all.
    #[arg(long)]
    class_name_required: bool,

    /// `[namespace/]name` of the ConfigMap holding global options.
    #[arg(long, default_value = "")]
    config_map: String,

    /// Stable identity for this instance's certificate-store leases.
    /// Generated when unset.
    #[arg(long, default_value = "")]
    lease_id: String,

    /// Enable debug logs.
    #[arg(long)]
    verbose: bool,

    /// Comma-separated plugin names controlling assembly order.
    #[arg(long, default_value = "")]
    plugins_order: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.namespace.is_empty() {
        warn!("--namespace is unset, watching ingress resources in all namespaces");
    }

    let client = Client::try_default()
        .await
        .context("could not establish a connection to the Kubernetes API server")?;

    let pod = get_pod_details(&client)
        .await
        .context("unexpected error obtaining pod information")?;

    // The ConfigMap may live in another namespace than the pod.
    let (config_namespace, config_map_name) = match args.config_map.split_once('/') {
        Some((namespace, name)) => (namespace.to_string(), name.to_string()),
        None => (pod.namespace.clone(), args.config_map.clone()),
    };

    let lease_id = if args.lease_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        args.lease_id.clone()
    };

    let options = Options {
        watch_namespace: args.namespace,
        config_map_name,
        class_name: args.class_name,
        class_name_required: args.class_name_required,
        verbose: args.verbose,
        lease_id: lease_id.clone(),
        plugins_order: args
            .plugins_order
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    };

    // The certificate store is handed to the proxy runtime; the controller
    // keeps it only to release held locks at shutdown.
    let storage = SecretStorage::new(client.clone(), &pod.namespace, &lease_id);
    let proxy = Box::new(AdminEndpoint::default());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown().await;
            cancel.cancel();
        });
    }

    info!(pod = pod.name, namespace = pod.namespace, "starting the ingress controller");
    let mut controller = Controller::new(
        client,
        options,
        &config_namespace,
        pod,
        proxy,
        storage,
        cancel,
    );
    controller.run().await;

    info!("ingress controller exited");
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn wait_for_shutdown() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = signal::ctrl_c() => info!("received SIGINT, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("received interrupt, shutting down");
    }
}
