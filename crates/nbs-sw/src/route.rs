//! Routing table.
//!
//! An ordered list of `(predicate, route)` rules evaluated top to bottom;
//! the first matching rule decides the [`Route`] before any cache or
//! network I/O happens.

use http::Method;
use nbs_net::{Origin, Request};
use serde::Serialize;
use url::Url;

/// Why a request is not intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassthroughReason {
    NonGet,
    CrossOrigin,
    Unmatched,
}

/// Routing decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Hand the request back untouched.
    Passthrough(PassthroughReason),
    /// Stale-while-revalidate on the pages partition.
    Page,
    /// Cache-first on the assets partition.
    Asset,
    /// Network first, assets partition as fallback.
    NetworkFirst,
}

/// Condition a rule matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePredicate {
    /// Any method other than GET.
    NonGet,
    /// Full-page load.
    Navigation,
    /// URL outside the app origin.
    CrossOrigin,
    /// Same-origin path starting with one of the prefixes.
    PathPrefix(Vec<String>),
    /// Always matches.
    Any,
}

impl RoutePredicate {
    fn matches(&self, request: &Request, origin: &Origin) -> bool {
        match self {
            RoutePredicate::NonGet => request.method != Method::GET,
            RoutePredicate::Navigation => request.is_navigation(),
            RoutePredicate::CrossOrigin => !origin.contains(&request.url),
            RoutePredicate::PathPrefix(prefixes) => {
                origin.contains(&request.url)
                    && prefixes
                        .iter()
                        .any(|prefix| request.url.path().starts_with(prefix.as_str()))
            }
            RoutePredicate::Any => true,
        }
    }
}

/// One row of the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub predicate: RoutePredicate,
    pub route: Route,
}

impl RouteRule {
    pub fn new(predicate: RoutePredicate, route: Route) -> Self {
        Self { predicate, route }
    }
}

/// Ordered routing table bound to the app origin.
#[derive(Debug, Clone)]
pub struct Router {
    origin: Origin,
    rules: Vec<RouteRule>,
}

impl Router {
    /// A router with an explicit rule list.
    pub fn new(origin: &Url, rules: Vec<RouteRule>) -> Self {
        Self {
            origin: Origin::from_url(origin),
            rules,
        }
    }

    /// The standard table for the app.
    pub fn standard<I, S>(origin: &Url, asset_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefixes = asset_prefixes.into_iter().map(Into::into).collect();
        Self::new(
            origin,
            vec![
                RouteRule::new(
                    RoutePredicate::NonGet,
                    Route::Passthrough(PassthroughReason::NonGet),
                ),
                RouteRule::new(RoutePredicate::Navigation, Route::Page),
                RouteRule::new(
                    RoutePredicate::CrossOrigin,
                    Route::Passthrough(PassthroughReason::CrossOrigin),
                ),
                RouteRule::new(RoutePredicate::PathPrefix(prefixes), Route::Asset),
                RouteRule::new(RoutePredicate::Any, Route::NetworkFirst),
            ],
        )
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// First matching rule's route.
    pub fn route(&self, request: &Request) -> Route {
        self.rules
            .iter()
            .find(|rule| rule.predicate.matches(request, &self.origin))
            .map(|rule| rule.route)
            .unwrap_or(Route::Passthrough(PassthroughReason::Unmatched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbs_net::RequestMode;

    fn router() -> Router {
        Router::standard(
            &Url::parse("http://localhost:8080").unwrap(),
            ["/_next/", "/icons/"],
        )
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_non_get_passes_through_first() {
        let router = router();
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
            let request = Request::new(method, url("http://localhost:8080/_next/app.js"))
                .mode(RequestMode::Navigate);
            assert_eq!(
                router.route(&request),
                Route::Passthrough(PassthroughReason::NonGet)
            );
        }
    }

    #[test]
    fn test_navigation_uses_page_even_cross_origin() {
        let router = router();
        assert_eq!(
            router.route(&Request::navigate(url("http://localhost:8080/stats"))),
            Route::Page
        );
        assert_eq!(
            router.route(&Request::navigate(url("https://example.com/"))),
            Route::Page
        );
    }

    #[test]
    fn test_cross_origin_passes_through() {
        let router = router();
        assert_eq!(
            router.route(&Request::get(url("https://cdn.example.com/_next/font.woff2"))),
            Route::Passthrough(PassthroughReason::CrossOrigin)
        );
        assert_eq!(
            router.route(&Request::get(url("http://localhost:9090/icons/a.svg"))),
            Route::Passthrough(PassthroughReason::CrossOrigin)
        );
    }

    #[test]
    fn test_asset_prefixes() {
        let router = router();
        assert_eq!(
            router.route(&Request::get(url("http://localhost:8080/_next/static/app.js"))),
            Route::Asset
        );
        assert_eq!(
            router.route(&Request::get(url("http://localhost:8080/icons/nbs-icon.svg"))),
            Route::Asset
        );
        assert_eq!(
            router.route(&Request::get(url("http://localhost:8080/iconsets/a.svg"))),
            Route::NetworkFirst
        );
    }

    #[test]
    fn test_everything_else_is_network_first() {
        let router = router();
        assert_eq!(
            router.route(&Request::get(url("http://localhost:8080/data.json"))),
            Route::NetworkFirst
        );
        assert_eq!(
            router.route(&Request::get(url("http://localhost:8080/manifest.webmanifest"))),
            Route::NetworkFirst
        );
    }

    #[test]
    fn test_empty_table_is_unmatched() {
        let router = Router::new(&url("http://localhost:8080"), Vec::new());
        assert_eq!(
            router.route(&Request::get(url("http://localhost:8080/"))),
            Route::Passthrough(PassthroughReason::Unmatched)
        );
    }

    #[test]
    fn test_rule_order_matters() {
        let router = Router::new(
            &url("http://localhost:8080"),
            vec![
                RouteRule::new(RoutePredicate::Any, Route::NetworkFirst),
                RouteRule::new(RoutePredicate::Navigation, Route::Page),
            ],
        );
        assert_eq!(
            router.route(&Request::navigate(url("http://localhost:8080/"))),
            Route::NetworkFirst
        );
    }
}
