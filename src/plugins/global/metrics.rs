use async_trait::async_trait;
use serde_json::json;

use crate::converter::{Config, GlobalPlugin, ModuleMap, Route};
use crate::error::Result;
use crate::store::Store;

/// Exposes the proxy's `/metrics` handler on the metrics server when enabled
/// through the ConfigMap.
pub struct MetricsPlugin;

#[async_trait]
impl GlobalPlugin for MetricsPlugin {
    async fn global_handler(&mut self, config: &mut Config, store: &Store) -> Result<()> {
        if !store.config_map.metrics {
            return Ok(());
        }

        let mut matcher = ModuleMap::new();
        matcher.insert("path".to_string(), json!(["/metrics"]));

        config.metrics_server_mut().routes.push(Route {
            matcher_sets: vec![matcher],
            handlers: vec![json!({ "handler": "metrics" })],
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Options, PodInfo, Store};

    #[tokio::test]
    async fn disabled_by_default() {
        let store = Store::new(Options::default(), "", PodInfo::default(), None);
        let mut config = Config::new();
        MetricsPlugin
            .global_handler(&mut config, &store)
            .await
            .unwrap();
        assert!(config.apps.http.servers.metrics.routes.is_empty());
    }

    #[tokio::test]
    async fn enabled_through_the_config_map() {
        let mut store = Store::new(Options::default(), "", PodInfo::default(), None);
        store.config_map.metrics = true;

        let mut config = Config::new();
        MetricsPlugin
            .global_handler(&mut config, &store)
            .await
            .unwrap();

        let routes = &config.apps.http.servers.metrics.routes;
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].handlers[0], json!({ "handler": "metrics" }));
    }
}
