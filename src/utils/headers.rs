//! Header and query-string helpers shared by the pipeline and the HTTP adapters.
use std::collections::BTreeMap;

use http::{HeaderMap, header};
use serde_json::{Map, Value};

/// Replacement for sensitive header values in contexts, logs and templates.
pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-auth-token",
];

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether a (lowercase) header name carries credentials.
pub fn is_sensitive(name: &str) -> bool {
    SENSITIVE_HEADERS.contains(&name) || name.contains("api-key") || name.contains("apikey")
}

/// Lowercase name to value map with credentials redacted.
///
/// Repeated headers are joined with `", "`; values that are not valid UTF-8
/// are decoded lossily.
pub fn sanitize_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let key = name.as_str();
        let value = if is_sensitive(key) {
            REDACTED.to_string()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        out.entry(key.to_string())
            .and_modify(|existing| {
                if existing != REDACTED {
                    existing.push_str(", ");
                    existing.push_str(&value);
                }
            })
            .or_insert(value);
    }
    out
}

/// Sanitized headers as a JSON object, for template scopes and log records.
pub fn header_map_to_json(headers: &HeaderMap) -> Value {
    Value::Object(
        sanitize_headers(headers)
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect::<Map<_, _>>(),
    )
}

/// Remove connection-scoped headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Decode a raw query string into a flat map; later duplicates win.
pub fn parse_query(raw: Option<&str>) -> BTreeMap<String, String> {
    raw.map(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .into_owned()
            .collect()
    })
    .unwrap_or_default()
}

/// Encode a flat map back into a query string (without the leading `?`).
pub fn encode_query(query: &BTreeMap<String, String>) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(query.iter())
        .finish()
}
