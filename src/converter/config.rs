//! Serde model of the proxy configuration document.
//!
//! The document mirrors the embedded server's native JSON config: a storage
//! reference, a TLS app and an HTTP app with two fixed servers. Handlers and
//! matchers are open-ended module objects, kept as `serde_json` values whose
//! maps are sorted by key, so serializing the same config twice yields
//! identical bytes.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::ser::Serializer;
use serde::Serialize;
use serde_json::Value;

/// Name of the public server carrying ingress routes.
pub const HTTP_SERVER: &str = "ingress_server";
/// Name of the server carrying /healthz and /metrics.
pub const METRICS_SERVER: &str = "metrics_server";

/// A set of named matcher modules, e.g. `{"host": ["a.example"]}`.
pub type ModuleMap = serde_json::Map<String, Value>;

/// Durations are wired to the proxy as integer nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nanos(pub Duration);

impl Serialize for Nanos {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0.as_nanos() as u64)
    }
}

/// The full config document submitted to the proxy's load entry point.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub storage: Storage,
    pub apps: Apps,
    pub logging: Logging,
}

/// Reference to the certificate storage backend the proxy runtime should use.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Storage {
    pub module: String,
    pub namespace: String,
    #[serde(rename = "leaseId")]
    pub lease_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Apps {
    pub http: HttpApp,
    pub tls: TlsApp,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpApp {
    pub servers: Servers,
}

/// The two servers are fixed by the base template, so they are struct fields
/// rather than a map; plugins address them directly.
#[derive(Debug, Clone, Serialize)]
pub struct Servers {
    #[serde(rename = "ingress_server")]
    pub ingress: Server,
    #[serde(rename = "metrics_server")]
    pub metrics: Server,
}

#[derive(Debug, Clone, Serialize)]
pub struct Server {
    pub listen: Vec<String>,
    pub routes: Vec<Route>,
    pub automatic_https: AutoHttps,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_connection_policies: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listener_wrappers: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoHttps {
    #[serde(skip_serializing_if = "is_false")]
    pub disable: bool,
    pub skip: Vec<String>,
    pub skip_certificates: Vec<String>,
}

/// One route: matcher sets plus an ordered handler chain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Route {
    #[serde(rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub matcher_sets: Vec<ModuleMap>,
    #[serde(rename = "handle")]
    pub handlers: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TlsApp {
    pub certificates: ModuleMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automation: Option<Automation>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Automation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_demand: Option<OnDemand>,
    #[serde(rename = "ocsp_interval", skip_serializing_if = "Option::is_none")]
    pub ocsp_check_interval: Option<Nanos>,
    pub policies: Vec<AutomationPolicy>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutomationPolicy {
    pub issuers: Vec<Value>,
    #[serde(skip_serializing_if = "is_false")]
    pub on_demand: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OnDemand {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ask: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<Nanos>,
    #[serde(skip_serializing_if = "is_zero")]
    pub burst: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Logging {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<BTreeMap<String, Value>>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl Config {
    /// The fixed skeleton plugins start from: an empty storage reference, a
    /// TLS app with an empty certificate map, the public server on :80/:443
    /// with auto-HTTPS enabled and a default TLS connection policy, and the
    /// metrics server on :9765 with auto-HTTPS disabled.
    pub fn new() -> Self {
        Config {
            storage: Storage::default(),
            apps: Apps {
                http: HttpApp {
                    servers: Servers {
                        ingress: Server {
                            // One listener set for both ports so listener
                            // wrappers (PROXY protocol) cover them equally.
                            listen: vec![":80".to_string(), ":443".to_string()],
                            routes: Vec::new(),
                            automatic_https: AutoHttps::default(),
                            tls_connection_policies: Some(vec![Value::Object(ModuleMap::new())]),
                            listener_wrappers: None,
                        },
                        metrics: Server {
                            listen: vec![":9765".to_string()],
                            routes: Vec::new(),
                            automatic_https: AutoHttps {
                                disable: true,
                                ..Default::default()
                            },
                            tls_connection_policies: None,
                            listener_wrappers: None,
                        },
                    },
                },
                tls: TlsApp {
                    certificates: ModuleMap::new(),
                    automation: None,
                },
            },
            logging: Logging::default(),
        }
    }

    pub fn http_server_mut(&mut self) -> &mut Server {
        &mut self.apps.http.servers.ingress
    }

    pub fn metrics_server_mut(&mut self) -> &mut Server {
        &mut self.apps.http.servers.metrics
    }

    pub fn tls_app_mut(&mut self) -> &mut TlsApp {
        &mut self.apps.tls
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_template_shape() {
        let config = Config::new();
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(
            json["apps"]["http"]["servers"]["ingress_server"]["listen"],
            serde_json::json!([":80", ":443"])
        );
        assert_eq!(
            json["apps"]["http"]["servers"]["metrics_server"]["listen"],
            serde_json::json!([":9765"])
        );
        assert_eq!(
            json["apps"]["http"]["servers"]["metrics_server"]["automatic_https"]["disable"],
            serde_json::json!(true)
        );
        // Auto-HTTPS stays enabled on the public server.
        assert!(json["apps"]["http"]["servers"]["ingress_server"]["automatic_https"]
            .get("disable")
            .is_none());
        assert_eq!(
            json["apps"]["tls"]["certificates"],
            serde_json::json!({})
        );
        assert_eq!(json["storage"]["module"], serde_json::json!(""));
    }

    #[test]
    fn serialization_is_deterministic() {
        let config = Config::new();
        let first = serde_json::to_vec(&config).unwrap();
        let second = serde_json::to_vec(&config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn durations_serialize_as_nanoseconds() {
        let nanos = serde_json::to_value(Nanos(Duration::from_secs(2))).unwrap();
        assert_eq!(nanos, serde_json::json!(2_000_000_000u64));
    }
}
