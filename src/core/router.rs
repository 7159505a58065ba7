use std::collections::BTreeMap;

use http::Method;

use crate::core::flatten::{FlattenedRoute, PathCapture};

/// Parameter key under which the first wildcard capture is stored.
/// Further wildcards use `*2`, `*3`, ...
pub const WILDCARD_PARAM: &str = "*";

#[derive(Debug, Clone)]
pub struct RouteMatch<'a> {
    /// Position of `route` in the list it was matched against.
    pub index: usize,
    pub route: &'a FlattenedRoute,
    pub params: BTreeMap<String, String>,
}

/// Find the first route, in the given order, accepting `method` and `path`.
///
/// Routes must already be priority sorted; there is no backtracking.
pub fn match_route<'a>(
    path: &str,
    method: &Method,
    routes: &'a [FlattenedRoute],
) -> Option<RouteMatch<'a>> {
    routes.iter().enumerate().find_map(|(index, route)| {
        if !route.allows_method(method) {
            return None;
        }
        let caps = route.matcher.regex().captures(path)?;
        Some(RouteMatch {
            index,
            route,
            params: extract_params(route, &caps),
        })
    })
}

fn extract_params(route: &FlattenedRoute, caps: &regex::Captures<'_>) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let mut wildcards = 0;
    for (i, capture) in route.captures.iter().enumerate() {
        let Some(raw) = caps.get(i + 1).map(|m| m.as_str()) else {
            continue;
        };
        let value = urlencoding::decode(raw)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| raw.to_string());
        match capture {
            PathCapture::Named(name) => {
                params.insert(name.clone(), value);
            }
            PathCapture::Wildcard => {
                wildcards += 1;
                let key = if wildcards == 1 {
                    WILDCARD_PARAM.to_string()
                } else {
                    format!("{WILDCARD_PARAM}{wildcards}")
                };
                params.insert(key, value);
            }
        }
    }
    params
}
