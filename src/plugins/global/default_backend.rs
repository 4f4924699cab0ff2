use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::converter::{
    config::{OnDemand, RateLimit},
    Config, GlobalPlugin, Nanos, Route,
};
use crate::error::Result;
use crate::plugins::ingress::annotations::{
    get_annotation, get_annotation_bool, get_annotation_u32, has_annotation, BACKEND_PROTOCOL,
    INSECURE_SKIP_VERIFY, ON_DEMAND_TLS, ON_DEMAND_TLS_ASK, ON_DEMAND_TLS_RATE_LIMIT_BURST,
    ON_DEMAND_TLS_RATE_LIMIT_INTERVAL,
};
use crate::store::{parse_duration, Store};

/// Appends a catch-all reverse-proxy route for the ingress that declares a
/// `defaultBackend`, and lets that ingress override the on-demand-TLS policy
/// through annotations. Runs after everything else, including the sorter.
pub struct DefaultBackendPlugin;

#[async_trait]
impl GlobalPlugin for DefaultBackendPlugin {
    async fn global_handler(&mut self, config: &mut Config, store: &Store) -> Result<()> {
        let Some(ingress) = store.ingresses().into_iter().find(|ing| {
            ing.spec
                .as_ref()
                .is_some_and(|spec| spec.default_backend.is_some())
        }) else {
            return Ok(());
        };

        let namespace = ingress.metadata.namespace.as_deref().unwrap_or("default");
        let backend = ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.default_backend.as_ref());
        let Some(service) = backend.and_then(|b| b.service.as_ref()) else {
            warn!(namespace, "defaultBackend without a service reference, ignoring");
            return Ok(());
        };
        let Some(port) = service.port.as_ref().and_then(|p| p.number) else {
            warn!(
                namespace,
                service = service.name,
                "defaultBackend with a named port is not supported, ignoring"
            );
            return Ok(());
        };

        // The catch-all goes through cluster DNS rather than endpoints; it
        // exists to answer anything no ingress rule matched.
        let dial = format!("{}.{}.svc.cluster.local:{}", service.name, namespace, port);

        let mut transport = json!({ "protocol": "http" });
        let backend_protocol = get_annotation(ingress, BACKEND_PROTOCOL)
            .map(|p| p.to_ascii_lowercase())
            .unwrap_or_default();
        if backend_protocol == "https" {
            transport["tls"] = json!({
                "insecure_skip_verify": get_annotation_bool(ingress, INSECURE_SKIP_VERIFY, true),
            });
        }

        config.http_server_mut().routes.push(Route {
            matcher_sets: Vec::new(),
            handlers: vec![json!({
                "handler": "reverse_proxy",
                "transport": transport,
                "upstreams": [{ "dial": dial }],
            })],
        });

        // On-demand TLS overrides only apply when automation is configured.
        let Some(automation) = config.tls_app_mut().automation.as_mut() else {
            return Ok(());
        };

        let mut overridden = false;
        let mut on_demand = automation.on_demand.clone().unwrap_or_else(|| OnDemand {
            rate_limit: Some(RateLimit::default()),
            ask: String::new(),
        });

        if let Some(ask) = get_annotation(ingress, ON_DEMAND_TLS_ASK) {
            on_demand.ask = ask.to_string();
            overridden = true;
        }

        if let Some(raw) = get_annotation(ingress, ON_DEMAND_TLS_RATE_LIMIT_INTERVAL) {
            if let Ok(interval) = parse_duration(ON_DEMAND_TLS_RATE_LIMIT_INTERVAL, raw) {
                on_demand
                    .rate_limit
                    .get_or_insert_with(RateLimit::default)
                    .interval = Some(Nanos(interval));
                overridden = true;
            }
        }

        let burst = get_annotation_u32(ingress, ON_DEMAND_TLS_RATE_LIMIT_BURST, 0);
        if burst != 0 {
            on_demand
                .rate_limit
                .get_or_insert_with(RateLimit::default)
                .burst = burst;
            overridden = true;
        }

        if has_annotation(ingress, ON_DEMAND_TLS) {
            if let Some(policy) = automation.policies.first_mut() {
                policy.on_demand = get_annotation_bool(ingress, ON_DEMAND_TLS, policy.on_demand);
            }
        }

        if overridden {
            automation.on_demand = Some(on_demand);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::config::{Automation, AutomationPolicy};
    use crate::plugins::ingress::annotations::ANNOTATION_PREFIX;
    use crate::store::{Options, PodInfo};
    use k8s_openapi::api::networking::v1::{
        Ingress, IngressBackend, IngressServiceBackend, IngressSpec, ServiceBackendPort,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn default_backend_ingress(annotations: &[(&str, &str)]) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("fallback".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (format!("{ANNOTATION_PREFIX}/{k}"), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                default_backend: Some(IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: "fallback-svc".to_string(),
                        port: Some(ServiceBackendPort {
                            number: Some(8080),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn store_with(ing: Ingress) -> Store {
        let mut store = Store::new(Options::default(), "", PodInfo::default(), None);
        store.upsert_ingress(ing);
        store
    }

    #[tokio::test]
    async fn no_default_backend_no_route() {
        let store = Store::new(Options::default(), "", PodInfo::default(), None);
        let mut config = Config::new();
        DefaultBackendPlugin
            .global_handler(&mut config, &store)
            .await
            .unwrap();
        assert!(config.apps.http.servers.ingress.routes.is_empty());
    }

    #[tokio::test]
    async fn appends_a_catch_all_route_last() {
        let store = store_with(default_backend_ingress(&[]));
        let mut config = Config::new();
        config.http_server_mut().routes.push(Route::default());

        DefaultBackendPlugin
            .global_handler(&mut config, &store)
            .await
            .unwrap();

        let routes = &config.apps.http.servers.ingress.routes;
        assert_eq!(routes.len(), 2);
        let catch_all = &routes[1];
        assert!(catch_all.matcher_sets.is_empty());
        assert_eq!(
            catch_all.handlers[0]["upstreams"],
            json!([{ "dial": "fallback-svc.default.svc.cluster.local:8080" }])
        );
    }

    #[tokio::test]
    async fn annotations_override_on_demand_tls() {
        let store = store_with(default_backend_ingress(&[
            (ON_DEMAND_TLS, "true"),
            (ON_DEMAND_TLS_ASK, "https://ask.example"),
            (ON_DEMAND_TLS_RATE_LIMIT_INTERVAL, "30s"),
            (ON_DEMAND_TLS_RATE_LIMIT_BURST, "3"),
        ]));

        let mut config = Config::new();
        config.tls_app_mut().automation = Some(Automation {
            policies: vec![AutomationPolicy::default()],
            ..Default::default()
        });

        DefaultBackendPlugin
            .global_handler(&mut config, &store)
            .await
            .unwrap();

        let automation = config.apps.tls.automation.as_ref().unwrap();
        assert!(automation.policies[0].on_demand);
        let on_demand = automation.on_demand.as_ref().unwrap();
        assert_eq!(on_demand.ask, "https://ask.example");
        let rate_limit = on_demand.rate_limit.as_ref().unwrap();
        assert_eq!(
            rate_limit.interval,
            Some(Nanos(std::time::Duration::from_secs(30)))
        );
        assert_eq!(rate_limit.burst, 3);
    }

    #[tokio::test]
    async fn overrides_need_existing_automation() {
        let store = store_with(default_backend_ingress(&[(
            ON_DEMAND_TLS_ASK,
            "https://ask.example",
        )]));
        let mut config = Config::new();
        DefaultBackendPlugin
            .global_handler(&mut config, &store)
            .await
            .unwrap();
        assert!(config.apps.tls.automation.is_none());
    }
}
