//! Small helpers over the cluster API: pod discovery, address resolution for
//! the status syncer, class filtering, and the Ingress status writeback.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::env;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::{
    Ingress, IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;

use crate::error::{Error, Result};
use crate::store::{Options, PodInfo};

/// Label EndpointSlices carry to point back at their Service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Legacy class annotation, honored alongside `spec.ingressClassName`.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// `namespace/name` key for an object. Objects without a namespace use the
/// empty string so the key stays well-formed.
pub fn object_key(meta: &ObjectMeta) -> String {
    format!(
        "{}/{}",
        meta.namespace.as_deref().unwrap_or(""),
        meta.name.as_deref().unwrap_or("")
    )
}

/// `namespace/serviceName` for an EndpointSlice, from its back-pointer label.
pub fn service_name_of_slice(slice: &EndpointSlice) -> Option<String> {
    let service = slice.metadata.labels.as_ref()?.get(SERVICE_NAME_LABEL)?;
    Some(format!(
        "{}/{}",
        slice.metadata.namespace.as_deref().unwrap_or(""),
        service
    ))
}

/// Whether this ingress is ours to manage.
///
/// The class tag is either `spec.ingressClassName` or the legacy annotation.
/// An untagged ingress is controlled only when no class is required.
pub fn is_controlled_ingress(options: &Options, ingress: &Ingress) -> bool {
    let spec_class = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.ingress_class_name.as_deref());
    let annotation_class = ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(INGRESS_CLASS_ANNOTATION))
        .map(|s| s.as_str());

    match spec_class.or(annotation_class) {
        Some(class) => class == options.class_name,
        None => !options.class_name_required,
    }
}

/// Reads this controller's own pod, identified by `POD_NAME`/`POD_NAMESPACE`.
pub async fn get_pod_details(client: &Client) -> Result<PodInfo> {
    let name = env::var("POD_NAME")
        .map_err(|_| Error::Bootstrap("POD_NAME environment variable is not set".to_string()))?;
    let namespace = env::var("POD_NAMESPACE").map_err(|_| {
        Error::Bootstrap("POD_NAMESPACE environment variable is not set".to_string())
    })?;

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let pod = pods.get(&name).await?;

    Ok(PodInfo {
        name,
        namespace,
        labels: pod.metadata.labels.unwrap_or_default(),
    })
}

/// True when every entry of `selector` appears in `labels` with the same
/// value. An empty selector selects nothing.
pub fn is_subset(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    if selector.is_empty() {
        return false;
    }
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// The externally reachable endpoint of a Service, by type.
pub fn address_from_service(service: &Service) -> Option<String> {
    let spec = service.spec.as_ref()?;
    match spec.type_.as_deref() {
        Some("ClusterIP") | None => spec
            .cluster_ip
            .clone()
            .filter(|ip| ip != "None" && !ip.is_empty()),
        Some("ExternalName") => spec.external_name.clone().filter(|n| !n.is_empty()),
        Some("LoadBalancer") => {
            let ingress = service
                .status
                .as_ref()
                .and_then(|s| s.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref())
                .and_then(|entries| entries.first())?;
            ingress
                .hostname
                .clone()
                .filter(|h| !h.is_empty())
                .or_else(|| ingress.ip.clone().filter(|ip| !ip.is_empty()))
        }
        // NodePort services expose no address we can publish.
        _ => None,
    }
}

/// Lists the addresses of every Service in the pod's namespace that selects
/// this pod.
pub async fn get_addresses(pod: &PodInfo, client: &Client) -> Result<Vec<String>> {
    let services: Api<Service> = Api::namespaced(client.clone(), &pod.namespace);
    let list = services.list(&ListParams::default()).await?;

    let mut addrs = Vec::new();
    for service in &list.items {
        let selects = service
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.as_ref())
            .is_some_and(|selector| is_subset(selector, &pod.labels));
        if selects {
            if let Some(addr) = address_from_service(service) {
                addrs.push(addr);
            }
        }
    }
    Ok(addrs)
}

/// Converts raw endpoints to status entries: IP literals become `ip`,
/// anything else becomes `hostname`. The result is sorted.
pub fn to_load_balancer_ingress(endpoints: &[String]) -> Vec<IngressLoadBalancerIngress> {
    let mut entries: Vec<IngressLoadBalancerIngress> = endpoints
        .iter()
        .map(|ep| {
            if ep.parse::<IpAddr>().is_ok() {
                IngressLoadBalancerIngress {
                    ip: Some(ep.clone()),
                    ..Default::default()
                }
            } else {
                IngressLoadBalancerIngress {
                    hostname: Some(ep.clone()),
                    ..Default::default()
                }
            }
        })
        .collect();
    sort_load_balancer_ingress(&mut entries);
    entries
}

/// Orders status entries by hostname, then IP.
pub fn sort_load_balancer_ingress(entries: &mut [IngressLoadBalancerIngress]) {
    entries.sort_by(compare_load_balancer_ingress);
}

fn compare_load_balancer_ingress(
    a: &IngressLoadBalancerIngress,
    b: &IngressLoadBalancerIngress,
) -> Ordering {
    let host = a
        .hostname
        .as_deref()
        .unwrap_or("")
        .cmp(b.hostname.as_deref().unwrap_or(""));
    if host != Ordering::Equal {
        return host;
    }
    a.ip.as_deref()
        .unwrap_or("")
        .cmp(b.ip.as_deref().unwrap_or(""))
}

/// Element-wise equality of two (sorted) status lists.
pub fn load_balancer_ingress_equal(
    lhs: &[IngressLoadBalancerIngress],
    rhs: &[IngressLoadBalancerIngress],
) -> bool {
    lhs.len() == rhs.len()
        && lhs
            .iter()
            .zip(rhs)
            .all(|(a, b)| a.hostname == b.hostname && a.ip == b.ip)
}

/// Overwrites `status.loadBalancer.ingress` on the named Ingress.
///
/// Reads the current object first so the write carries a fresh
/// resourceVersion.
pub async fn update_ingress_status(
    client: &Client,
    ingress: &Ingress,
    status: &[IngressLoadBalancerIngress],
) -> Result<Ingress> {
    let namespace = ingress.metadata.namespace.as_deref().unwrap_or("default");
    let name = ingress
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::semantic(namespace, "", "ingress without a name"))?;

    let api: Api<Ingress> = Api::namespaced(client.clone(), namespace);
    let mut current = api.get(name).await?;
    current.status = Some(IngressStatus {
        load_balancer: Some(IngressLoadBalancerStatus {
            ingress: Some(status.to_vec()),
        }),
    });

    let data = serde_json::to_vec(&current)?;
    let updated = api
        .replace_status(name, &PostParams::default(), data)
        .await?;
    Ok(updated)
}
