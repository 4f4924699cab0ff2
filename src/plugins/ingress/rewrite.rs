use serde_json::json;

use crate::converter::{Route, RouteContext, RoutePlugin};
use crate::error::Result;
use crate::plugins::ingress::annotations::{get_annotation, REWRITE_STRIP_PREFIX, REWRITE_TO};

/// Turns rewrite annotations into rewrite handlers.
pub struct RewritePlugin;

impl RoutePlugin for RewritePlugin {
    fn route_handler(&mut self, ctx: &RouteContext<'_>, mut route: Route) -> Result<Route> {
        if let Some(uri) = get_annotation(ctx.ingress, REWRITE_TO) {
            route
                .handlers
                .push(json!({ "handler": "rewrite", "uri": uri }));
        }

        if let Some(prefix) = get_annotation(ctx.ingress, REWRITE_STRIP_PREFIX) {
            route
                .handlers
                .push(json!({ "handler": "rewrite", "strip_path_prefix": prefix }));
        }

        Ok(route)
    }
}
