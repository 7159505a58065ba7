//! Tenant resolution from the inbound Host header.
use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$").expect("label regex is valid")
});

/// True for a lowercase DNS label usable as a tenant subdomain.
pub fn is_valid_subdomain(label: &str) -> bool {
    DNS_LABEL.is_match(label)
}

/// Lowercased first label of a Host value, port stripped.
pub fn first_label(host: &str) -> Option<String> {
    let host = host.trim();
    let without_port = match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    };
    let label = without_port.split('.').next()?.to_ascii_lowercase();
    (!label.is_empty()).then_some(label)
}

/// Picks the tenant subdomain for a request.
#[derive(Debug, Clone)]
pub struct TenantResolver {
    /// Query parameter that names the tenant explicitly; only set outside production.
    override_param: Option<String>,
}

impl TenantResolver {
    pub fn new(override_param: Option<String>) -> Self {
        Self { override_param }
    }

    pub fn override_param(&self) -> Option<&str> {
        self.override_param.as_deref()
    }

    /// Resolve the tenant label, or `None` when it is absent or malformed.
    pub fn resolve(&self, host: Option<&str>, query: &BTreeMap<String, String>) -> Option<String> {
        let explicit = self
            .override_param
            .as_ref()
            .and_then(|param| query.get(param))
            .map(|value| value.trim().to_ascii_lowercase());

        let label = match explicit {
            Some(value) => value,
            None => first_label(host?)?,
        };
        is_valid_subdomain(&label).then_some(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_label() {
        assert_eq!(first_label("Acme.gw.example.com"), Some("acme".into()));
        assert_eq!(first_label("test.localhost:8080"), Some("test".into()));
        assert_eq!(first_label(""), None);
    }

    #[test]
    fn test_resolve_from_host() {
        let resolver = TenantResolver::new(None);
        let query = BTreeMap::from([("_gateway".to_string(), "other".to_string())]);
        assert_eq!(
            resolver.resolve(Some("acme.example.com"), &query),
            Some("acme".into())
        );
        assert_eq!(resolver.resolve(Some("bad_label.example.com"), &query), None);
        assert_eq!(resolver.resolve(None, &query), None);
    }

    #[test]
    fn test_override_param_wins_when_enabled() {
        let resolver = TenantResolver::new(Some("_gateway".into()));
        let query = BTreeMap::from([("_gateway".to_string(), "Beta".to_string())]);
        assert_eq!(
            resolver.resolve(Some("localhost:8080"), &query),
            Some("beta".into())
        );
        assert_eq!(
            resolver.resolve(Some("localhost:8080"), &BTreeMap::new()),
            Some("localhost".into())
        );
    }
}
