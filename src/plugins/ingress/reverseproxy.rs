use std::net::IpAddr;

use serde_json::{json, Value};

use crate::controller::Diagnostics;
use crate::converter::{Route, RouteContext, RoutePlugin};
use crate::error::{Error, Result};
use crate::k8s::object_key;
use crate::plugins::ingress::annotations::{
    get_annotation, get_annotation_bool, BACKEND_PROTOCOL, INSECURE_SKIP_VERIFY, TRUSTED_PROXIES,
};

/// Resolves the path's backend to a set of upstreams and appends the
/// reverse-proxy handler. Runs last in the route pipeline.
pub struct ReverseProxyPlugin {
    diags: Diagnostics,
}

impl ReverseProxyPlugin {
    pub fn new() -> Self {
        ReverseProxyPlugin {
            diags: Diagnostics::new(),
        }
    }
}

impl RoutePlugin for ReverseProxyPlugin {
    fn route_handler(&mut self, ctx: &RouteContext<'_>, mut route: Route) -> Result<Route> {
        let ing_key = object_key(&ctx.ingress.metadata);
        let namespace = ctx.ingress.metadata.namespace.as_deref().unwrap_or("");

        let Some(service_ref) = ctx.path.backend.service.as_ref() else {
            self.diags.warn_once(format!(
                "Ingress {ing_key} uses a non-service backend, which is not supported, and will be ignored"
            ));
            return Ok(route);
        };

        let service_key = format!("{}/{}", namespace, service_ref.name);
        let Some(service) = ctx.store.service(&service_key) else {
            self.diags.warn_once(format!(
                "Ingress {ing_key} references unknown service {} and will be ignored",
                service_ref.name
            ));
            return Ok(route);
        };

        let port_number = service_ref.port.as_ref().and_then(|p| p.number);
        let port_name = service_ref.port.as_ref().and_then(|p| p.name.as_deref());
        let spec = service.spec.as_ref();

        let mut upstreams: Vec<Value> = Vec::new();
        if spec.and_then(|s| s.type_.as_deref()) == Some("ExternalName") {
            // A single upstream dialing the external hostname.
            let Some(number) = port_number else {
                self.diags.warn_once(format!(
                    "Ingress {ing_key} references service {} with type=ExternalName and a named port, which is not supported, and will be ignored",
                    service_ref.name
                ));
                return Ok(route);
            };
            let Some(external_name) = spec.and_then(|s| s.external_name.as_deref()) else {
                self.diags.warn_once(format!(
                    "Ingress {ing_key} references service {} with type=ExternalName and no external name, and will be ignored",
                    service_ref.name
                ));
                return Ok(route);
            };
            upstreams.push(json!({ "dial": format_dial_addr(external_name, number) }));
        } else {
            // Resolve the referenced service port to its target port.
            let mut target_port = None;
            for port in spec.and_then(|s| s.ports.as_ref()).into_iter().flatten() {
                let by_number = port_number.is_some_and(|n| n == port.port);
                let by_name =
                    port_name.is_some_and(|n| port.name.as_deref() == Some(n));
                if by_number || by_name {
                    match port.target_port.as_ref() {
                        Some(
                            k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(n),
                        ) => target_port = Some(*n),
                        // Named target ports would need pod inspection.
                        Some(
                            k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(_),
                        ) => {
                            self.diags.warn_once(format!(
                                "Ingress {ing_key} references service {} with a named target port, which is not supported, and will be ignored",
                                service_ref.name
                            ));
                            return Ok(route);
                        }
                        // targetPort defaults to the service port itself.
                        None => target_port = Some(port.port),
                    }
                    break;
                }
            }
            let Some(target_port) = target_port else {
                self.diags.warn_once(format!(
                    "Ingress {ing_key} references an unknown port on service {}, and will be ignored",
                    service_ref.name
                ));
                return Ok(route);
            };

            // One upstream per ready endpoint address, across all slices.
            for slice in ctx.store.endpoint_slices_by_service(&service_key) {
                for endpoint in &slice.endpoints {
                    let ready = endpoint
                        .conditions
                        .as_ref()
                        .and_then(|c| c.ready)
                        .unwrap_or(true);
                    if !ready {
                        continue;
                    }
                    for addr in &endpoint.addresses {
                        upstreams.push(json!({ "dial": format_dial_addr(addr, target_port) }));
                    }
                }
            }
        }

        let backend_protocol = get_annotation(ctx.ingress, BACKEND_PROTOCOL)
            .map(|p| p.to_ascii_lowercase())
            .unwrap_or_default();
        let mut transport = json!({ "protocol": "http" });
        if backend_protocol == "https" {
            transport["tls"] = json!({
                "insecure_skip_verify": get_annotation_bool(ctx.ingress, INSECURE_SKIP_VERIFY, true),
            });
        }

        let mut handler = json!({
            "handler": "reverse_proxy",
            "transport": transport,
            "upstreams": upstreams,
        });
        if let Some(raw) = get_annotation(ctx.ingress, TRUSTED_PROXIES) {
            handler["trusted_proxies"] = json!(parse_trusted_proxies(raw)?);
        }

        route.handlers.push(handler);
        Ok(route)
    }

    fn finalize(&mut self) {
        self.diags.gc();
    }
}

/// `host:port`, with brackets around IPv6 hosts.
fn format_dial_addr(host: &str, port: i32) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Parses a comma-separated list of IPs and CIDR ranges. A bare IP is
/// widened to its /32 (or /128) network; any invalid entry fails the list.
fn parse_trusted_proxies(raw: &str) -> Result<Vec<String>> {
    let mut parsed = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if let Some((addr, len)) = entry.split_once('/') {
            let ip: IpAddr = addr
                .parse()
                .map_err(|_| Error::parse(TRUSTED_PROXIES, entry, "failed to parse IP"))?;
            let bits = if ip.is_ipv4() { 32 } else { 128 };
            let len: u8 = len
                .parse()
                .ok()
                .filter(|l| *l <= bits)
                .ok_or_else(|| Error::parse(TRUSTED_PROXIES, entry, "failed to parse IP"))?;
            parsed.push(format!("{ip}/{len}"));
        } else {
            let ip: IpAddr = entry
                .parse()
                .map_err(|_| Error::parse(TRUSTED_PROXIES, entry, "failed to parse IP"))?;
            let bits = if ip.is_ipv4() { 32 } else { 128 };
            parsed.push(format!("{ip}/{bits}"));
        }
    }
    Ok(parsed)
}
