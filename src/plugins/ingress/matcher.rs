use serde_json::json;

use crate::converter::{ModuleMap, Route, RouteContext, RoutePlugin};
use crate::error::Result;
use crate::plugins::ingress::annotations::{get_annotation, DISABLE_SSL_REDIRECT};

/// Builds the matcher set for a route: protocol, host and path.
pub struct MatcherPlugin;

impl RoutePlugin for MatcherPlugin {
    fn route_handler(&mut self, ctx: &RouteContext<'_>, mut route: Route) -> Result<Route> {
        let mut matcher = ModuleMap::new();

        if get_annotation(ctx.ingress, DISABLE_SSL_REDIRECT) != Some("true") {
            matcher.insert("protocol".to_string(), json!("https"));
        }

        if let Some(host) = ctx.rule.host.as_deref().filter(|h| !h.is_empty()) {
            matcher.insert("host".to_string(), json!([host]));
        }

        if let Some(path) = ctx.path.path.as_deref().filter(|p| !p.is_empty()) {
            let mut path = path.to_string();
            // Prefix paths match everything below them.
            if ctx.path.path_type == "Prefix" {
                path.push('*');
            }
            matcher.insert("path".to_string(), json!([path]));
        }

        route.matcher_sets.push(matcher);
        Ok(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::ingress::test_support::{route_context, RouteContextFixture};

    #[test]
    fn prefix_path_gets_a_wildcard() {
        let fixture = RouteContextFixture::new()
            .host("a.example")
            .path("/app", "Prefix");
        let route = route_context(&fixture, |ctx| {
            MatcherPlugin.route_handler(ctx, Route::default())
        })
        .unwrap();

        let matcher = &route.matcher_sets[0];
        assert_eq!(matcher["protocol"], json!("https"));
        assert_eq!(matcher["host"], json!(["a.example"]));
        assert_eq!(matcher["path"], json!(["/app*"]));
    }

    #[test]
    fn exact_path_is_untouched() {
        let fixture = RouteContextFixture::new().path("/app", "Exact");
        let route = route_context(&fixture, |ctx| {
            MatcherPlugin.route_handler(ctx, Route::default())
        })
        .unwrap();
        assert_eq!(route.matcher_sets[0]["path"], json!(["/app"]));
        assert!(!route.matcher_sets[0].contains_key("host"));
    }

    #[test]
    fn ssl_redirect_can_be_disabled() {
        let fixture = RouteContextFixture::new()
            .path("/", "Prefix")
            .annotation(DISABLE_SSL_REDIRECT, "true");
        let route = route_context(&fixture, |ctx| {
            MatcherPlugin.route_handler(ctx, Route::default())
        })
        .unwrap();
        assert!(!route.matcher_sets[0].contains_key("protocol"));
    }
}
