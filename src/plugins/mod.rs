//! Built-in assembler plugins and their registration.

pub mod global;
pub mod ingress;

use crate::converter::{PluginEntry, PluginKind};

/// The full built-in plugin set, registered explicitly at controller
/// construction. The assembler orders these by the explicit
/// `--plugins-order` names, then priority, then name.
pub fn default_plugins() -> Vec<PluginEntry> {
    vec![
        PluginEntry::global("secrets_store", 0, global::SecretsStorePlugin),
        PluginEntry::global("configmap", 0, global::ConfigMapPlugin),
        // The route generator: one route per controlled (ingress, rule, path).
        PluginEntry {
            name: "ingress",
            priority: 0,
            kind: PluginKind::RouteBuilder,
        },
        // Must run after routes exist.
        PluginEntry::global("ingress_sort", -2, global::IngressSortPlugin),
        PluginEntry::global("healthz", -20, global::HealthzPlugin),
        PluginEntry::global("metrics", 0, global::MetricsPlugin),
        PluginEntry::global("tls", 0, global::TlsPlugin::new()),
        // The catch-all goes after everything, including the sorter.
        PluginEntry::global("default_backend", -50, global::DefaultBackendPlugin),
        PluginEntry::route("ingress.matcher", 0, ingress::MatcherPlugin),
        PluginEntry::route("ingress.redirect", 10, ingress::RedirectPlugin),
        PluginEntry::route("ingress.rewrite", 10, ingress::RewritePlugin),
        PluginEntry::route("ingress.reverseproxy", -10, ingress::ReverseProxyPlugin::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::Converter;

    #[test]
    fn default_registration_order() {
        let converter = Converter::new(default_plugins(), &[]);
        assert_eq!(
            converter.plugin_names(),
            vec![
                "ingress.redirect",
                "ingress.rewrite",
                "configmap",
                "ingress",
                "ingress.matcher",
                "metrics",
                "secrets_store",
                "tls",
                "ingress_sort",
                "ingress.reverseproxy",
                "healthz",
                "default_backend",
            ]
        );
    }

    #[test]
    fn explicit_order_takes_precedence() {
        let converter = Converter::new(
            default_plugins(),
            &["tls".to_string(), "configmap".to_string()],
        );
        let names = converter.plugin_names();
        assert_eq!(names[0], "tls");
        assert_eq!(names[1], "configmap");
    }
}
