//! Destination URL construction for the upstream call.
use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use crate::{
    core::{
        context::RequestContext,
        error::PipelineError,
        flatten::{FlattenedGateway, FlattenedRoute},
        mutation::template,
        router::WILDCARD_PARAM,
    },
    utils::headers::encode_query,
};

static PATH_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":([A-Za-z0-9_]+)").expect("path param regex is valid"));

/// Resolve the route destination into an absolute upstream URL.
///
/// `:name` segments take path parameters, `*` takes the wildcard capture and
/// `${...}` placeholders are rendered against the request context. Relative
/// destinations are appended to the gateway base URL; an empty destination
/// forwards the inbound path. `query` replaces the inbound query and
/// overrides same-named parameters declared in the destination.
pub fn build_destination(
    gateway: &FlattenedGateway,
    route: &FlattenedRoute,
    ctx: &RequestContext,
    query: &BTreeMap<String, String>,
) -> Result<Url, PipelineError> {
    let invalid = |reason: String| PipelineError::InvalidDestination {
        destination: route.destination.clone(),
        reason,
    };

    let raw = route.destination.trim();
    let resolved = if raw.is_empty() {
        ctx.path.clone()
    } else {
        let with_params = PATH_PARAM.replace_all(raw, |caps: &Captures<'_>| {
            match ctx.params.get(&caps[1]) {
                Some(value) => urlencoding::encode(value).into_owned(),
                None => caps[0].to_string(),
            }
        });
        let with_wildcard = match ctx.params.get(WILDCARD_PARAM) {
            Some(rest) if with_params.contains('*') => with_params.replacen('*', rest, 1),
            _ => with_params.into_owned(),
        };
        if template::has_placeholders(&with_wildcard) {
            let scope = ctx.template_scope(ctx.body_json(), None);
            template::render(&with_wildcard, &scope).into_owned()
        } else {
            with_wildcard
        }
    };

    let mut url = if resolved.starts_with("http://") || resolved.starts_with("https://") {
        Url::parse(&resolved).map_err(|e| invalid(e.to_string()))?
    } else {
        let mut base = Url::parse(&gateway.base_url)
            .map_err(|e| invalid(format!("gateway base_url: {e}")))?;
        let (path, declared_query) = match resolved.split_once('?') {
            Some((path, q)) => (path, Some(q)),
            None => (resolved.as_str(), None),
        };
        let joined = format!(
            "{}/{}",
            base.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        base.set_path(&joined);
        base.set_query(declared_query);
        base
    };

    let mut merged: BTreeMap<String, String> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    merged.extend(query.iter().map(|(k, v)| (k.clone(), v.clone())));
    if merged.is_empty() {
        url.set_query(None);
    } else {
        url.set_query(Some(&encode_query(&merged)));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        context::tests::sample_context,
        flatten::tests::{flat_route, snapshot_with_routes},
    };

    fn destination(dest: &str, base: &str, ctx: &RequestContext, query: &[(&str, &str)]) -> String {
        let mut gateway = snapshot_with_routes(vec![]);
        gateway.base_url = base.to_string();
        let route = FlattenedRoute {
            destination: dest.to_string(),
            ..flat_route("r", "/users/:id", &["*"], 0)
        };
        let query = query
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        build_destination(&gateway, &route, ctx, &query)
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_empty_destination_forwards_path() {
        let ctx = sample_context();
        assert_eq!(
            destination("", "https://api.acme.test/v2/", &ctx, &[("page", "2")]),
            "https://api.acme.test/v2/users/42?page=2"
        );
    }

    #[test]
    fn test_relative_destination_with_params_and_template() {
        let ctx = sample_context();
        assert_eq!(
            destination(
                "/accounts/:id/${variables.tenant}",
                "https://api.acme.test",
                &ctx,
                &[]
            ),
            "https://api.acme.test/accounts/42/acme"
        );
    }

    #[test]
    fn test_absolute_destination_merges_query() {
        let ctx = sample_context();
        assert_eq!(
            destination(
                "http://legacy.internal:8080/u/:id?format=json&page=1",
                "https://ignored.test",
                &ctx,
                &[("page", "2")]
            ),
            "http://legacy.internal:8080/u/42?format=json&page=2"
        );
    }

    #[test]
    fn test_wildcard_destination() {
        let mut ctx = sample_context();
        ctx.params = BTreeMap::from([(WILDCARD_PARAM.to_string(), "v1/foo".to_string())]);
        assert_eq!(
            destination("/backend/*", "https://api.acme.test", &ctx, &[]),
            "https://api.acme.test/backend/v1/foo"
        );
    }

    #[test]
    fn test_bad_base_url_is_an_error() {
        let ctx = sample_context();
        let mut gateway = snapshot_with_routes(vec![]);
        gateway.base_url = "not a url".into();
        let route = flat_route("r", "/", &["*"], 0);
        assert!(matches!(
            build_destination(&gateway, &route, &ctx, &BTreeMap::new()),
            Err(PipelineError::InvalidDestination { .. })
        ));
    }
}
