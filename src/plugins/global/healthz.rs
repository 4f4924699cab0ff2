use async_trait::async_trait;
use serde_json::json;

use crate::converter::{Config, GlobalPlugin, ModuleMap, Route};
use crate::error::Result;
use crate::store::Store;

/// Adds a `/healthz` → 200 route to the metrics server.
pub struct HealthzPlugin;

#[async_trait]
impl GlobalPlugin for HealthzPlugin {
    async fn global_handler(&mut self, config: &mut Config, _store: &Store) -> Result<()> {
        let mut matcher = ModuleMap::new();
        matcher.insert("path".to_string(), json!(["/healthz"]));

        config.metrics_server_mut().routes.push(Route {
            matcher_sets: vec![matcher],
            handlers: vec![json!({ "handler": "static_response", "status_code": "200" })],
        });
        Ok(())
    }
}
