//! rudder - a Kubernetes ingress controller for an embedded reverse proxy.
//!
//! Watches Ingresses, Services, EndpointSlices, Secrets and a global-options
//! ConfigMap, continuously assembles a proxy config document from them, and
//! keeps the proxy, its certificates on cluster storage, and the Ingress
//! status addresses in sync.

pub mod controller;
pub mod converter;
pub mod error;
pub mod k8s;
pub mod plugins;
pub mod proxy;
pub mod storage;
pub mod store;
