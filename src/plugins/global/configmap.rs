use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::converter::{
    config::{Automation, AutomationPolicy, OnDemand, RateLimit},
    Config, GlobalPlugin, Nanos,
};
use crate::error::Result;
use crate::store::Store;

/// Applies the global options from the controller ConfigMap: log level, ACME
/// issuer, on-demand TLS policy, OCSP interval and PROXY-protocol wrappers.
pub struct ConfigMapPlugin;

#[async_trait]
impl GlobalPlugin for ConfigMapPlugin {
    async fn global_handler(&mut self, config: &mut Config, store: &Store) -> Result<()> {
        let options = &store.config_map;

        if options.debug {
            let mut logs = BTreeMap::new();
            logs.insert("default".to_string(), json!({ "level": "DEBUG" }));
            config.logging.logs = Some(logs);
        }

        if !options.acme_ca.is_empty() || !options.email.is_empty() {
            let mut issuer = serde_json::Map::new();
            issuer.insert("module".to_string(), json!("acme"));
            if !options.acme_ca.is_empty() {
                issuer.insert("ca".to_string(), json!(options.acme_ca));
            }
            if !options.email.is_empty() {
                issuer.insert("email".to_string(), json!(options.email));
            }
            if !options.acme_eab_key_id.is_empty() && !options.acme_eab_mac_key.is_empty() {
                issuer.insert(
                    "external_account".to_string(),
                    json!({
                        "key_id": options.acme_eab_key_id,
                        "mac_key": options.acme_eab_mac_key,
                    }),
                );
            }

            let on_demand = options.on_demand_tls.then(|| OnDemand {
                rate_limit: Some(RateLimit {
                    interval: options.on_demand_rate_limit_interval.map(Nanos),
                    burst: options.on_demand_rate_limit_burst.unwrap_or_default(),
                }),
                ask: options.on_demand_ask.clone(),
            });

            config.tls_app_mut().automation = Some(Automation {
                on_demand,
                ocsp_check_interval: options.ocsp_check_interval.map(Nanos),
                policies: vec![AutomationPolicy {
                    issuers: vec![Value::Object(issuer)],
                    on_demand: options.on_demand_tls,
                }],
            });
        }

        if options.proxy_protocol {
            // The PROXY-protocol wrapper must run before the tls wrapper.
            config.http_server_mut().listener_wrappers = Some(vec![
                json!({ "wrapper": "proxy_protocol" }),
                json!({ "wrapper": "tls" }),
            ]);
        }

        Ok(())
    }
}
