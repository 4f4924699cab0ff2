use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use tracing::info;

use super::queue::Keyed;
use super::Controller;
use crate::error::Result;
use crate::k8s::object_key;
use crate::store::parse_config_map;

/// A typed resource event, as classified by the watcher-side filters.
#[derive(Debug, Clone)]
pub enum ResourceEvent<T> {
    Added(T),
    Updated(T),
    Deleted(T),
}

impl<T> ResourceEvent<T> {
    pub fn resource(&self) -> &T {
        match self {
            ResourceEvent::Added(r) | ResourceEvent::Updated(r) | ResourceEvent::Deleted(r) => r,
        }
    }
}

/// One unit of work on the reconciler's queue.
#[derive(Debug, Clone)]
pub enum Action {
    LoadConfigMap(ResourceEvent<ConfigMap>),
    IngressChanged(ResourceEvent<Ingress>),
    ServiceChanged(ResourceEvent<Service>),
    EndpointSliceChanged(ResourceEvent<EndpointSlice>),
    SecretChanged(ResourceEvent<Secret>),
    SyncStatus,
}

impl Keyed for Action {
    fn key(&self) -> String {
        match self {
            Action::LoadConfigMap(e) => format!("configmap/{}", object_key(&e.resource().metadata)),
            Action::IngressChanged(e) => format!("ingress/{}", object_key(&e.resource().metadata)),
            Action::ServiceChanged(e) => format!("service/{}", object_key(&e.resource().metadata)),
            Action::EndpointSliceChanged(e) => {
                format!("endpointslice/{}", object_key(&e.resource().metadata))
            }
            Action::SecretChanged(e) => format!("secret/{}", object_key(&e.resource().metadata)),
            Action::SyncStatus => "sync-status".to_string(),
        }
    }
}

impl Action {
    /// Applies this event to the controller state. Runs on the consumer task
    /// only; this is the single place the store is mutated.
    pub async fn handle(&self, controller: &mut Controller) -> Result<()> {
        match self {
            Action::LoadConfigMap(event) => {
                let key = object_key(&event.resource().metadata);
                match event {
                    ResourceEvent::Added(cm) | ResourceEvent::Updated(cm) => {
                        info!(configmap = key, "ConfigMap loaded");
                        controller.store.config_map = parse_config_map(cm)?;
                    }
                    ResourceEvent::Deleted(_) => {
                        info!(configmap = key, "ConfigMap deleted, back to defaults");
                        controller.store.config_map = Default::default();
                    }
                }
            }
            Action::IngressChanged(event) => {
                let key = object_key(&event.resource().metadata);
                match event {
                    ResourceEvent::Added(ing) => {
                        info!(ingress = key, "Ingress created");
                        controller.store.upsert_ingress(ing.clone());
                    }
                    ResourceEvent::Updated(ing) => {
                        info!(ingress = key, "Ingress updated");
                        controller.store.upsert_ingress(ing.clone());
                    }
                    ResourceEvent::Deleted(ing) => {
                        info!(ingress = key, "Ingress deleted");
                        controller.store.remove_ingress(ing);
                    }
                }
            }
            Action::ServiceChanged(event) => match event {
                ResourceEvent::Added(svc) | ResourceEvent::Updated(svc) => {
                    controller.store.upsert_service(svc.clone());
                }
                ResourceEvent::Deleted(svc) => {
                    controller.store.remove_service(svc);
                }
            },
            Action::EndpointSliceChanged(event) => match event {
                ResourceEvent::Added(slice) | ResourceEvent::Updated(slice) => {
                    controller.store.upsert_endpoint_slice(slice.clone());
                }
                ResourceEvent::Deleted(slice) => {
                    controller.store.remove_endpoint_slice(slice);
                }
            },
            Action::SecretChanged(event) => match event {
                ResourceEvent::Added(secret) | ResourceEvent::Updated(secret) => {
                    controller.store.upsert_secret(secret.clone());
                }
                ResourceEvent::Deleted(secret) => {
                    controller.store.remove_secret(secret);
                }
            },
            Action::SyncStatus => {
                controller.sync_status().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn named(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn keys_are_stable_per_resource() {
        let ing = Ingress {
            metadata: named("web"),
            ..Default::default()
        };
        let added = Action::IngressChanged(ResourceEvent::Added(ing.clone()));
        let deleted = Action::IngressChanged(ResourceEvent::Deleted(ing));
        // Add and delete of the same object collapse onto one queue slot.
        assert_eq!(added.key(), deleted.key());
        assert_eq!(added.key(), "ingress/default/web");
        assert_eq!(Action::SyncStatus.key(), "sync-status");
    }
}
