//! Global plugins: each one mutates the whole config document.

mod configmap;
mod default_backend;
mod healthz;
mod ingress_sort;
mod metrics;
mod secrets_store;
mod tls;

pub use configmap::ConfigMapPlugin;
pub use default_backend::DefaultBackendPlugin;
pub use healthz::HealthzPlugin;
pub use ingress_sort::{sort_routes, IngressSortPlugin};
pub use metrics::MetricsPlugin;
pub use secrets_store::SecretsStorePlugin;
pub use tls::TlsPlugin;
