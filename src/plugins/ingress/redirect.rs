use serde_json::json;

use crate::converter::{Route, RouteContext, RoutePlugin};
use crate::error::{Error, Result};
use crate::plugins::ingress::annotations::{
    get_annotation, PERMANENT_REDIRECT, PERMANENT_REDIRECT_CODE, TEMPORAL_REDIRECT,
};

/// Turns redirect annotations into a static_response handler.
pub struct RedirectPlugin;

impl RoutePlugin for RedirectPlugin {
    fn route_handler(&mut self, ctx: &RouteContext<'_>, mut route: Route) -> Result<Route> {
        let permanent = get_annotation(ctx.ingress, PERMANENT_REDIRECT);
        let temporary = get_annotation(ctx.ingress, TEMPORAL_REDIRECT);

        if permanent.is_some() && temporary.is_some() {
            return Err(Error::Conflict(
                "cannot use permanent-redirect annotation with temporal-redirect".to_string(),
            ));
        }

        let (code, location) = match (permanent, temporary) {
            (Some(location), None) => {
                let mut code = "301".to_string();
                if let Some(raw) = get_annotation(ctx.ingress, PERMANENT_REDIRECT_CODE) {
                    let parsed: u16 = raw.parse().map_err(|_| {
                        Error::parse(
                            PERMANENT_REDIRECT_CODE,
                            raw,
                            "not a supported redirection code type or not a valid integer",
                        )
                    })?;
                    if !(300..400).contains(&parsed) && parsed != 401 {
                        return Err(Error::parse(
                            PERMANENT_REDIRECT_CODE,
                            raw,
                            "redirection code not in the 3xx range or 401",
                        ));
                    }
                    code = raw.to_string();
                }
                (code, location)
            }
            (None, Some(location)) => ("302".to_string(), location),
            _ => return Ok(route),
        };

        route.handlers.push(json!({
            "handler": "static_response",
            "status_code": code,
            "headers": { "Location": [location] },
        }));
        Ok(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::ingress::test_support::{route_context, RouteContextFixture};

    fn redirect(fixture: &RouteContextFixture) -> Result<Route> {
        route_context(fixture, |ctx| {
            RedirectPlugin.route_handler(ctx, Route::default())
        })
    }

    #[test]
    fn permanent_defaults_to_301() {
        let fixture = RouteContextFixture::new().annotation(PERMANENT_REDIRECT, "http://example.com");
        let route = redirect(&fixture).unwrap();
        assert_eq!(
            route.handlers[0],
            json!({
                "handler": "static_response",
                "status_code": "301",
                "headers": { "Location": ["http://example.com"] },
            })
        );
    }

    #[test]
    fn explicit_code_is_honored() {
        let fixture = RouteContextFixture::new()
            .annotation(PERMANENT_REDIRECT, "http://example.com")
            .annotation(PERMANENT_REDIRECT_CODE, "308");
        let route = redirect(&fixture).unwrap();
        assert_eq!(route.handlers[0]["status_code"], json!("308"));
    }

    #[test]
    fn code_401_is_allowed() {
        let fixture = RouteContextFixture::new()
            .annotation(PERMANENT_REDIRECT, "http://example.com")
            .annotation(PERMANENT_REDIRECT_CODE, "401");
        assert!(redirect(&fixture).is_ok());
    }

    #[test]
    fn code_outside_3xx_is_rejected() {
        let fixture = RouteContextFixture::new()
            .annotation(PERMANENT_REDIRECT, "http://example.com")
            .annotation(PERMANENT_REDIRECT_CODE, "200");
        assert!(redirect(&fixture).is_err());
    }

    #[test]
    fn non_integer_code_is_rejected() {
        let fixture = RouteContextFixture::new()
            .annotation(PERMANENT_REDIRECT, "http://example.com")
            .annotation(PERMANENT_REDIRECT_CODE, "permanent");
        assert!(redirect(&fixture).is_err());
    }

    #[test]
    fn temporal_implies_302() {
        let fixture = RouteContextFixture::new().annotation(TEMPORAL_REDIRECT, "http://example.com");
        let route = redirect(&fixture).unwrap();
        assert_eq!(route.handlers[0]["status_code"], json!("302"));
    }

    #[test]
    fn conflicting_annotations_error() {
        let fixture = RouteContextFixture::new()
            .annotation(PERMANENT_REDIRECT, "http://x")
            .annotation(TEMPORAL_REDIRECT, "http://y");
        let err = redirect(&fixture).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot use permanent-redirect annotation with temporal-redirect"
        );
    }
}
