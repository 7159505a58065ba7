//! Per-request context consumed by every pipeline stage.
use std::{collections::BTreeMap, net::SocketAddr, time::Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method};
use serde::Serialize;
use serde_json::{Value, json};

use crate::{core::flatten::FlattenedGateway, utils::headers::sanitize_headers};

/// An inbound request after tenant resolution, detached from the transport.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub request_id: String,
    pub method: Method,
    pub path: String,
    /// Decoded query, with the tenant override parameter already removed.
    pub query: BTreeMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub received: Instant,
}

impl InboundRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            method,
            path: path.into(),
            query: BTreeMap::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            received: Instant::now(),
        }
    }
}

/// Approximate client location, as reported by an edge proxy.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Geo {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

impl Geo {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let first = |names: &[&str]| {
            names.iter().find_map(|name| {
                headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| urlencoding::decode(v).map_or_else(|_| v.to_string(), |d| d.into_owned()))
            })
        };
        Self {
            country: first(&["cf-ipcountry", "x-vercel-ip-country", "x-geo-country"]),
            region: first(&["x-vercel-ip-country-region", "x-geo-region"]),
            city: first(&["x-vercel-ip-city", "x-geo-city"]),
        }
    }
}

/// Facts about the client connection that are not part of the request itself.
#[derive(Debug, Clone, Default)]
pub struct EnvInfo {
    pub ip: Option<String>,
    pub geo: Geo,
}

impl EnvInfo {
    /// Client address from forwarding headers, falling back to the socket peer.
    pub fn from_request(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string());

        Self {
            ip: forwarded
                .or(real_ip)
                .or_else(|| peer.map(|p| p.ip().to_string())),
            geo: Geo::from_headers(headers),
        }
    }
}

/// Immutable view of one request, shared by routing, mutation, caching and logging.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub gateway_id: String,
    pub method: Method,
    pub path: String,
    pub query: BTreeMap<String, String>,
    /// Lowercase names, credentials redacted.
    pub headers: BTreeMap<String, String>,
    /// Text body; only captured for methods that carry one.
    pub body: Option<String>,
    pub ip: Option<String>,
    pub geo: Geo,
    pub params: BTreeMap<String, String>,
    pub variables: BTreeMap<String, String>,
    pub started_at: Instant,
    pub received_at: DateTime<Utc>,
}

impl RequestContext {
    /// The body parsed as JSON, falling back to its text, or null when absent.
    pub fn body_json(&self) -> Value {
        match &self.body {
            None => Value::Null,
            Some(text) if text.is_empty() => Value::Null,
            Some(text) => {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
            }
        }
    }

    /// Method, path and client facts exposed to templates and scripts.
    pub fn request_metadata(&self) -> Value {
        json!({
            "id": self.request_id,
            "method": self.method.as_str(),
            "path": self.path,
            "query": self.query,
            "headers": self.headers,
            "ip": self.ip,
        })
    }

    /// Object that `${...}` placeholders and expression conditions resolve against.
    pub fn template_scope(&self, body: Value, response: Option<Value>) -> Value {
        let mut scope = json!({
            "body": body,
            "params": self.params,
            "query": self.query,
            "headers": self.headers,
            "variables": self.variables,
            "request": self.request_metadata(),
            "geo": self.geo,
        });
        if let (Some(response), Value::Object(map)) = (response, &mut scope) {
            map.insert("response".to_string(), response);
        }
        scope
    }
}

/// Assembles a [`RequestContext`] without touching the network or storage.
pub struct ContextBuilder;

impl ContextBuilder {
    pub fn build(
        request: &InboundRequest,
        snapshot: &FlattenedGateway,
        env: EnvInfo,
        params: BTreeMap<String, String>,
    ) -> RequestContext {
        let body = if method_carries_body(&request.method) {
            Some(String::from_utf8_lossy(&request.body).into_owned())
        } else {
            None
        };

        RequestContext {
            request_id: request.request_id.clone(),
            gateway_id: snapshot.id.clone(),
            method: request.method.clone(),
            path: request.path.clone(),
            query: request.query.clone(),
            headers: sanitize_headers(&request.headers),
            body,
            ip: env.ip,
            geo: env.geo,
            params,
            variables: snapshot.variables.clone(),
            started_at: request.received,
            received_at: Utc::now(),
        }
    }
}

fn method_carries_body(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use http::HeaderValue;

    use super::*;
    use crate::{core::flatten::tests::snapshot_with_routes, utils::headers::REDACTED};

    /// A POST to `/users/42` on the `acme` tenant.
    pub fn sample_context() -> RequestContext {
        let mut request = InboundRequest::new(Method::POST, "/users/42");
        request.query.insert("page".into(), "2".into());
        request
            .headers
            .insert("x-debug", HeaderValue::from_static("1"));
        request
            .headers
            .insert("user-agent", HeaderValue::from_static("curl/8.4.0"));
        request
            .headers
            .insert("authorization", HeaderValue::from_static("Bearer abc"));
        request.body = Bytes::from_static(br#"{"name":"John","gone":null}"#);

        let snapshot = snapshot_with_routes(vec![]);
        let env = EnvInfo {
            ip: Some("203.0.113.9".into()),
            geo: Geo {
                country: Some("DE".into()),
                ..Geo::default()
            },
        };
        ContextBuilder::build(
            &request,
            &snapshot,
            env,
            BTreeMap::from([("id".to_string(), "42".to_string())]),
        )
    }

    #[test]
    fn test_build_sanitizes_and_captures_body() {
        let ctx = sample_context();
        assert_eq!(ctx.headers["authorization"], REDACTED);
        assert_eq!(ctx.headers["x-debug"], "1");
        assert_eq!(ctx.body_json(), json!({"name": "John", "gone": null}));
        assert_eq!(ctx.variables["tenant"], "acme");
        assert_eq!(ctx.gateway_id, "gw-acme");
    }

    #[test]
    fn test_get_request_has_no_body() {
        let mut request = InboundRequest::new(Method::GET, "/");
        request.body = Bytes::from_static(b"ignored");
        let ctx = ContextBuilder::build(
            &request,
            &snapshot_with_routes(vec![]),
            EnvInfo::default(),
            BTreeMap::new(),
        );
        assert!(ctx.body.is_none());
        assert_eq!(ctx.body_json(), Value::Null);
    }

    #[test]
    fn test_template_scope_shape() {
        let ctx = sample_context();
        let scope = ctx.template_scope(ctx.body_json(), Some(json!({"status": 200})));
        assert_eq!(scope["params"]["id"], "42");
        assert_eq!(scope["request"]["method"], "POST");
        assert_eq!(scope["geo"]["country"], "DE");
        assert_eq!(scope["response"]["status"], 200);
        assert_eq!(scope["headers"]["authorization"], REDACTED);
    }

    #[test]
    fn test_env_info_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("198.51.100.1, 10.0.0.1"),
        );
        headers.insert("x-vercel-ip-city", HeaderValue::from_static("San%20Jose"));
        let peer: SocketAddr = "10.0.0.2:5000".parse().unwrap();

        let env = EnvInfo::from_request(&headers, Some(peer));
        assert_eq!(env.ip.as_deref(), Some("198.51.100.1"));
        assert_eq!(env.geo.city.as_deref(), Some("San Jose"));

        let env = EnvInfo::from_request(&HeaderMap::new(), Some(peer));
        assert_eq!(env.ip.as_deref(), Some("10.0.0.2"));
    }
}
