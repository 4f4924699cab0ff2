//! In-memory caches of the cluster resources the assembler reads.
//!
//! The store is mutated only from the reconciler's consumer task; watcher
//! callbacks enqueue actions, they never write. Every accessor is a snapshot
//! read and iteration order is deterministic so that two assemblies over the
//! same contents serialize to identical bytes.

mod configmap;
mod options;
mod pod;

pub use configmap::{parse_config_map, parse_duration, ConfigMapOptions};
pub use options::Options;
pub use pod::PodInfo;

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use kube::Client;

use crate::k8s::{is_controlled_ingress, object_key, service_name_of_slice};

/// Resources used to generate the proxy config, indexed by `namespace/name`.
pub struct Store {
    pub options: Options,
    /// Parsed global options. Defaults apply while no ConfigMap is present.
    pub config_map: ConfigMapOptions,
    /// Namespace the options ConfigMap lives in.
    pub config_namespace: String,
    pub current_pod: PodInfo,
    /// Cluster client for reads that need full objects (TLS secret bytes).
    /// Absent in tests.
    pub client: Option<Client>,

    ingresses: BTreeMap<String, Ingress>,
    // Secondary index: the keys of ingresses controlled by our class.
    controlled: BTreeSet<String>,
    services: BTreeMap<String, Service>,
    endpoint_slices: BTreeMap<String, EndpointSlice>,
    // Secondary index: `namespace/serviceName` -> slice keys.
    slices_by_service: BTreeMap<String, BTreeSet<String>>,
    // Metadata only; data is stripped before a Secret reaches the queue.
    secrets: BTreeMap<String, Secret>,
}

impl Store {
    pub fn new(
        options: Options,
        config_namespace: &str,
        current_pod: PodInfo,
        client: Option<Client>,
    ) -> Self {
        Store {
            options,
            config_map: ConfigMapOptions::default(),
            config_namespace: config_namespace.to_string(),
            current_pod,
            client,
            ingresses: BTreeMap::new(),
            controlled: BTreeSet::new(),
            services: BTreeMap::new(),
            endpoint_slices: BTreeMap::new(),
            slices_by_service: BTreeMap::new(),
            secrets: BTreeMap::new(),
        }
    }

    /// Ingresses controlled by our IngressClass, in key order.
    pub fn ingresses(&self) -> Vec<&Ingress> {
        self.controlled
            .iter()
            .filter_map(|key| self.ingresses.get(key))
            .collect()
    }

    /// Current state of a service. `key` is `namespace/name`.
    pub fn service(&self, key: &str) -> Option<&Service> {
        self.services.get(key)
    }

    /// All endpoint slices backing a service. `key` is `namespace/name`.
    pub fn endpoint_slices_by_service(&self, key: &str) -> Vec<&EndpointSlice> {
        self.slices_by_service
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|slice_key| self.endpoint_slices.get(slice_key))
            .collect()
    }

    /// Secret metadata (no data). `key` is `namespace/name`.
    pub fn secret_meta(&self, key: &str) -> Option<&Secret> {
        self.secrets.get(key)
    }

    /// True when at least one controlled ingress carries a TLS block.
    pub fn has_managed_tls(&self) -> bool {
        self.ingresses().iter().any(|ing| {
            ing.spec
                .as_ref()
                .and_then(|spec| spec.tls.as_ref())
                .is_some_and(|tls| !tls.is_empty())
        })
    }

    pub fn upsert_ingress(&mut self, ing: Ingress) {
        let key = object_key(&ing.metadata);
        if is_controlled_ingress(&self.options, &ing) {
            self.controlled.insert(key.clone());
        } else {
            self.controlled.remove(&key);
        }
        self.ingresses.insert(key, ing);
    }

    pub fn remove_ingress(&mut self, ing: &Ingress) {
        let key = object_key(&ing.metadata);
        self.controlled.remove(&key);
        self.ingresses.remove(&key);
    }

    pub fn upsert_service(&mut self, svc: Service) {
        self.services.insert(object_key(&svc.metadata), svc);
    }

    pub fn remove_service(&mut self, svc: &Service) {
        self.services.remove(&object_key(&svc.metadata));
    }

    pub fn upsert_endpoint_slice(&mut self, slice: EndpointSlice) {
        let key = object_key(&slice.metadata);
        // The service-name label can change across updates; drop the old
        // index entry before adding the new one.
        if let Some(previous) = self.endpoint_slices.get(&key) {
            if let Some(old_service) = service_name_of_slice(previous) {
                if let Some(keys) = self.slices_by_service.get_mut(&old_service) {
                    keys.remove(&key);
                }
            }
        }
        if let Some(service) = service_name_of_slice(&slice) {
            self.slices_by_service
                .entry(service)
                .or_default()
                .insert(key.clone());
        }
        self.endpoint_slices.insert(key, slice);
    }

    pub fn remove_endpoint_slice(&mut self, slice: &EndpointSlice) {
        let key = object_key(&slice.metadata);
        if let Some(service) = service_name_of_slice(slice) {
            if let Some(keys) = self.slices_by_service.get_mut(&service) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.slices_by_service.remove(&service);
                }
            }
        }
        self.endpoint_slices.remove(&key);
    }

    pub fn upsert_secret(&mut self, secret: Secret) {
        debug_assert!(secret.data.is_none(), "secrets must be stripped on ingest");
        self.secrets.insert(object_key(&secret.metadata), secret);
    }

    pub fn remove_secret(&mut self, secret: &Secret) {
        self.secrets.remove(&object_key(&secret.metadata));
    }
}
