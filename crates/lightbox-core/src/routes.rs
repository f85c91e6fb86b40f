//! Route table of the HTTP control server.
//!
//! Routes are matched in table order; the first entry whose method matches
//! and whose pattern occurs anywhere in the request path wins. The last GET
//! entry has an empty pattern and catches everything else.

use crate::request::Method;

/// Handler selected for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// `settings?type=inf|change|revert`
    Settings,
    /// `images?type=inf|data|del`
    Images,
    /// `event_pos?increment=<int>`
    EventPosition,
    /// `refresh_weather`
    RefreshWeather,
    /// Precompressed web UI.
    StaticAsset,
}

/// `(method, path substring, route)`, in precedence order.
pub const ROUTES: &[(Method, &str, Route)] = &[
    (Method::Get, "settings", Route::Settings),
    (Method::Get, "images", Route::Images),
    (Method::Get, "event_pos", Route::EventPosition),
    (Method::Get, "refresh_weather", Route::RefreshWeather),
    (Method::Get, "", Route::StaticAsset),
];

/// Resolve a request to its route.
pub fn resolve_route(method: Method, path: &str) -> Option<Route> {
    ROUTES
        .iter()
        .find(|(route_method, pattern, _)| *route_method == method && path.contains(pattern))
        .map(|(_, _, route)| *route)
}
