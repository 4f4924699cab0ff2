use futures::StreamExt;
use k8s_openapi::api::networking::v1::{Ingress, IngressLoadBalancerIngress};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::k8s::{
    get_addresses, load_balancer_ingress_equal, object_key, sort_load_balancer_ingress,
    to_load_balancer_ingress, update_ingress_status,
};
use crate::store::Store;

/// Maximum concurrent status writes.
const STATUS_POOL_SIZE: usize = 10;

/// Publishes this controller's addresses into every controlled Ingress's
/// `status.loadBalancer.ingress`.
pub async fn sync_status(store: &Store, client: &Client, cancel: &CancellationToken) -> Result<()> {
    let addrs = get_addresses(&store.current_pod, client).await?;
    let status = to_load_balancer_ingress(&addrs);

    let ingresses = store.ingresses();
    debug!(count = ingresses.len(), "syncing ingress source addresses");
    update_ingress_statuses(client, &status, &ingresses, cancel).await;
    Ok(())
}

/// True when the ingress's current status differs from the desired one.
/// Both sides are compared sorted, so repeated syncs are no-ops.
pub fn needs_status_update(ingress: &Ingress, desired: &[IngressLoadBalancerIngress]) -> bool {
    let mut current = ingress
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.clone())
        .unwrap_or_default();
    sort_load_balancer_ingress(&mut current);
    !load_balancer_ingress_equal(&current, desired)
}

/// Writes `status` to every ingress that differs, with bounded concurrency.
/// Per-ingress failures are logged and never abort the batch.
pub async fn update_ingress_statuses(
    client: &Client,
    status: &[IngressLoadBalancerIngress],
    ingresses: &[&Ingress],
    cancel: &CancellationToken,
) {
    let pending: Vec<&Ingress> = ingresses
        .iter()
        .copied()
        .filter(|ing| {
            if needs_status_update(ing, status) {
                true
            } else {
                debug!(
                    ingress = object_key(&ing.metadata),
                    "skipping status update (no change)"
                );
                false
            }
        })
        .collect();

    futures::stream::iter(pending)
        .for_each_concurrent(STATUS_POOL_SIZE, |ingress| async move {
            if cancel.is_cancelled() {
                return;
            }
            let key = object_key(&ingress.metadata);
            match update_ingress_status(client, ingress, status).await {
                Ok(updated) => {
                    debug!(
                        ingress = key,
                        status = ?updated
                            .status
                            .as_ref()
                            .and_then(|s| s.load_balancer.as_ref()),
                        "ingress status updated"
                    );
                }
                Err(e) => {
                    warn!(ingress = key, error = %e, "error updating ingress status");
                }
            }
        })
        .await;
}
