use std::cmp::Ordering;

use async_trait::async_trait;

use crate::converter::{Config, GlobalPlugin, Route};
use crate::error::Result;
use crate::store::Store;

/// Re-orders the public server's routes to reduce matching conflicts.
///
/// The comparator keys on each route's first path string from its first
/// matcher set: exact paths outrank prefix paths (trailing `*`), longer paths
/// outrank shorter ones within the same class, and empty paths go last. This
/// is an approximation, not a longest-match engine; routes with multiple
/// matchers keep their relative order.
pub struct IngressSortPlugin;

#[async_trait]
impl GlobalPlugin for IngressSortPlugin {
    async fn global_handler(&mut self, config: &mut Config, store: &Store) -> Result<()> {
        if !store.config_map.experimental_smart_sort {
            return Ok(());
        }
        sort_routes(&mut config.http_server_mut().routes);
        Ok(())
    }
}

fn first_path(route: &Route) -> &str {
    route
        .matcher_sets
        .first()
        .and_then(|m| m.get("path"))
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn path_class(path: &str) -> u8 {
    if path.is_empty() {
        2
    } else if path.ends_with('*') {
        1
    } else {
        0
    }
}

/// Stable sort: exact before prefix before empty; longer first within a class.
pub fn sort_routes(routes: &mut [Route]) {
    routes.sort_by(|a, b| {
        let (a_path, b_path) = (first_path(a), first_path(b));
        match path_class(a_path).cmp(&path_class(b_path)) {
            Ordering::Equal => b_path.len().cmp(&a_path.len()),
            other => other,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::ModuleMap;
    use serde_json::json;

    fn route(id: usize, path: &str) -> Route {
        let mut matcher = ModuleMap::new();
        matcher.insert("id".to_string(), json!(id));
        if !path.is_empty() {
            matcher.insert("path".to_string(), json!([path]));
        }
        Route {
            matcher_sets: vec![matcher],
            handlers: Vec::new(),
        }
    }

    fn ids(routes: &[Route]) -> Vec<u64> {
        routes
            .iter()
            .map(|r| r.matcher_sets[0]["id"].as_u64().unwrap())
            .collect()
    }

    fn sorted(paths: &[&str]) -> Vec<u64> {
        let mut routes: Vec<Route> = paths
            .iter()
            .enumerate()
            .map(|(id, path)| route(id, path))
            .collect();
        sort_routes(&mut routes);
        ids(&routes)
    }

    #[test]
    fn multiple_exact_paths() {
        assert_eq!(sorted(&["/path/a", "/path/", "/other"]), vec![0, 1, 2]);
    }

    #[test]
    fn multiple_prefix_paths() {
        assert_eq!(
            sorted(&["/path/*", "/path/auth/*", "/other/*", "/login/*"]),
            vec![1, 2, 3, 0]
        );
    }

    #[test]
    fn mixed_exact_and_prefixed() {
        assert_eq!(
            sorted(&["/path/*", "/path/auth/", "/path/v2/*", "/path/new"]),
            vec![1, 3, 2, 0]
        );
    }

    #[test]
    fn mixed_exact_prefix_and_empty() {
        assert_eq!(
            sorted(&["/path/*", "", "/path/v2/*", "/path/new", ""]),
            vec![3, 2, 0, 1, 4]
        );
    }

    #[test]
    fn ties_keep_input_order() {
        assert_eq!(sorted(&["/aa/*", "/bb/*"]), vec![0, 1]);
        assert_eq!(sorted(&["/bb/*", "/aa/*"]), vec![0, 1]);
    }
}
