//! Annotation keys this controller understands, all under a fixed prefix.

use k8s_openapi::api::networking::v1::Ingress;

pub const ANNOTATION_PREFIX: &str = "rudder.ingress.kubernetes.io";

pub const REWRITE_TO: &str = "rewrite-to";
pub const REWRITE_STRIP_PREFIX: &str = "rewrite-strip-prefix";
pub const DISABLE_SSL_REDIRECT: &str = "disable-ssl-redirect";
pub const BACKEND_PROTOCOL: &str = "backend-protocol";
pub const INSECURE_SKIP_VERIFY: &str = "insecure-skip-verify";
pub const TRUSTED_PROXIES: &str = "trusted-proxies";
pub const PERMANENT_REDIRECT: &str = "permanent-redirect";
pub const PERMANENT_REDIRECT_CODE: &str = "permanent-redirect-code";
pub const TEMPORAL_REDIRECT: &str = "temporal-redirect";
pub const ON_DEMAND_TLS: &str = "on-demand-tls";
pub const ON_DEMAND_TLS_ASK: &str = "on-demand-tls-ask";
pub const ON_DEMAND_TLS_RATE_LIMIT_INTERVAL: &str = "on-demand-tls-rate-limit-interval";
pub const ON_DEMAND_TLS_RATE_LIMIT_BURST: &str = "on-demand-tls-rate-limit-burst";

pub fn get_annotation<'a>(ingress: &'a Ingress, name: &str) -> Option<&'a str> {
    ingress
        .metadata
        .annotations
        .as_ref()?
        .get(&format!("{ANNOTATION_PREFIX}/{name}"))
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
}

pub fn has_annotation(ingress: &Ingress, name: &str) -> bool {
    get_annotation(ingress, name).is_some()
}

pub fn get_annotation_bool(ingress: &Ingress, name: &str, default: bool) -> bool {
    match get_annotation(ingress, name) {
        Some(value) => value == "true",
        None => default,
    }
}

pub fn get_annotation_u32(ingress: &Ingress, name: &str, default: u32) -> u32 {
    get_annotation(ingress, name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
