//! The configuration assembler: an ordered pipeline of plugins that turn the
//! current resource snapshot into a complete proxy config document.

pub mod config;

pub use config::{Config, ModuleMap, Nanos, Route, HTTP_SERVER, METRICS_SERVER};

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::{HTTPIngressPath, Ingress, IngressRule};

use crate::error::Result;
use crate::store::Store;

/// Everything a route-stage plugin sees while one route is under
/// construction.
pub struct RouteContext<'a> {
    pub store: &'a Store,
    pub ingress: &'a Ingress,
    pub rule: &'a IngressRule,
    pub path: &'a HTTPIngressPath,
}

/// A plugin that mutates the whole config document.
///
/// Handlers are async because some of them (the TLS plugin) do cluster and
/// file I/O; assembly itself stays single-threaded on the consumer task.
#[async_trait]
pub trait GlobalPlugin: Send {
    async fn global_handler(&mut self, config: &mut Config, store: &Store) -> Result<()>;

    /// Per-run cleanup, invoked after every assembly, error or not.
    fn finalize(&mut self) {}
}

/// A plugin that transforms a single in-construction route.
pub trait RoutePlugin: Send {
    fn route_handler(&mut self, ctx: &RouteContext<'_>, route: Route) -> Result<Route>;

    fn finalize(&mut self) {}
}

pub enum PluginKind {
    Global(Box<dyn GlobalPlugin>),
    Route(Box<dyn RoutePlugin>),
    /// The route generator: expands every controlled ingress rule and path
    /// into a route by running the route-stage plugins in registry order.
    RouteBuilder,
}

/// A named plugin registered with the assembler.
pub struct PluginEntry {
    pub name: &'static str,
    /// Higher runs earlier when the explicit order does not decide.
    pub priority: i32,
    pub kind: PluginKind,
}

impl PluginEntry {
    pub fn global(name: &'static str, priority: i32, plugin: impl GlobalPlugin + 'static) -> Self {
        PluginEntry {
            name,
            priority,
            kind: PluginKind::Global(Box::new(plugin)),
        }
    }

    pub fn route(name: &'static str, priority: i32, plugin: impl RoutePlugin + 'static) -> Self {
        PluginEntry {
            name,
            priority,
            kind: PluginKind::Route(Box::new(plugin)),
        }
    }

    fn finalize(&mut self) {
        match &mut self.kind {
            PluginKind::Global(p) => p.finalize(),
            PluginKind::Route(p) => p.finalize(),
            PluginKind::RouteBuilder => {}
        }
    }
}

/// Orders plugins for one assembly: names listed in `order` first, in the
/// given sequence; the rest by descending priority, ties by ascending name.
/// The sort is stable.
pub fn sort_plugins(plugins: &mut [PluginEntry], order: &[String]) {
    let position = |name: &str| order.iter().position(|o| o == name);
    plugins.sort_by(|a, b| match (position(a.name), position(b.name)) {
        (Some(i), Some(j)) => i.cmp(&j),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => b.priority.cmp(&a.priority).then_with(|| a.name.cmp(b.name)),
    });
}

/// Runs the plugin pipeline over a store snapshot.
///
/// Plugins are instantiated once, at construction, and keep their state
/// across invocations (the TLS plugin caches which secret versions are on
/// disk; the reverse-proxy plugin de-dupes warnings).
pub struct Converter {
    plugins: Vec<PluginEntry>,
}

impl Converter {
    pub fn new(mut plugins: Vec<PluginEntry>, order: &[String]) -> Self {
        sort_plugins(&mut plugins, order);
        Converter { plugins }
    }

    /// Produces a fresh config document from the store.
    pub async fn convert(&mut self, store: &Store) -> Result<Config> {
        let mut config = Config::new();
        let result = run_pipeline(&mut self.plugins, &mut config, store).await;
        for entry in &mut self.plugins {
            entry.finalize();
        }
        result.map(|()| config)
    }

    #[cfg(test)]
    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name).collect()
    }
}

async fn run_pipeline(
    plugins: &mut Vec<PluginEntry>,
    config: &mut Config,
    store: &Store,
) -> Result<()> {
    for i in 0..plugins.len() {
        if matches!(plugins[i].kind, PluginKind::RouteBuilder) {
            build_ingress_routes(plugins, config, store)?;
            continue;
        }
        if let PluginKind::Global(plugin) = &mut plugins[i].kind {
            plugin.global_handler(config, store).await?;
        }
    }
    Ok(())
}

/// One route per (controlled ingress, rule, path), built by the route-stage
/// plugins in registry order.
fn build_ingress_routes(
    plugins: &mut [PluginEntry],
    config: &mut Config,
    store: &Store,
) -> Result<()> {
    let mut routes = Vec::new();

    for ingress in store.ingresses() {
        let Some(spec) = ingress.spec.as_ref() else {
            continue;
        };
        for rule in spec.rules.iter().flatten() {
            let Some(http) = rule.http.as_ref() else {
                continue;
            };
            for path in &http.paths {
                let ctx = RouteContext {
                    store,
                    ingress,
                    rule,
                    path,
                };
                let mut route = Route::default();
                for entry in plugins.iter_mut() {
                    if let PluginKind::Route(plugin) = &mut entry.kind {
                        route = plugin.route_handler(&ctx, route)?;
                    }
                }
                routes.push(route);
            }
        }
    }

    config.http_server_mut().routes = routes;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    #[async_trait]
    impl GlobalPlugin for Noop {
        async fn global_handler(&mut self, _: &mut Config, _: &Store) -> Result<()> {
            Ok(())
        }
    }

    fn entries(specs: &[(&'static str, i32)]) -> Vec<PluginEntry> {
        specs
            .iter()
            .map(|(name, priority)| PluginEntry::global(name, *priority, Noop))
            .collect()
    }

    fn names(plugins: &[PluginEntry]) -> Vec<&'static str> {
        plugins.iter().map(|p| p.name).collect()
    }

    #[test]
    fn defaults_to_alpha_sort() {
        let mut plugins = entries(&[("b", 0), ("c", 0), ("a", 0)]);
        sort_plugins(&mut plugins, &[]);
        assert_eq!(names(&plugins), vec!["a", "b", "c"]);
    }

    #[test]
    fn priority_runs_before_alpha() {
        let mut plugins = entries(&[("b", 0), ("a", 20), ("c", 10)]);
        sort_plugins(&mut plugins, &[]);
        assert_eq!(names(&plugins), vec!["a", "c", "b"]);
    }

    #[test]
    fn falls_back_to_alpha_without_priority() {
        let mut plugins = entries(&[("b", 0), ("a", 0), ("c", 20)]);
        sort_plugins(&mut plugins, &[]);
        assert_eq!(names(&plugins), vec!["c", "a", "b"]);
    }

    #[test]
    fn explicit_order_comes_first() {
        let mut plugins = entries(&[("b", 0), ("a", 0), ("c", 0)]);
        sort_plugins(&mut plugins, &["c".to_string()]);
        assert_eq!(names(&plugins), vec!["c", "a", "b"]);
    }

    #[test]
    fn explicit_order_overrides_priority() {
        let mut plugins = entries(&[("b", 10), ("a", 0), ("c", 0)]);
        sort_plugins(&mut plugins, &["c".to_string()]);
        assert_eq!(names(&plugins), vec!["c", "b", "a"]);
    }

    #[test]
    fn sort_is_stable_for_equal_keys() {
        let mut plugins = entries(&[("same", 5), ("other", 5), ("same", 5)]);
        sort_plugins(&mut plugins, &[]);
        assert_eq!(names(&plugins), vec!["other", "same", "same"]);
    }
}
