//! Response cache backed by the key-value store.
//!
//! Entries live under `cache:route:{routeId}:{hash}` where the hash covers
//! the request dimensions selected by the route's vary-by policy. Concurrent
//! writers of one key simply race; the last write wins.
use std::{sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::{
    core::{
        context::RequestContext, entities::CachePolicy, flatten::FlattenedRoute,
        mutation::ResponseParts,
    },
    ports::kv_store::{KeyValueStore, KvError},
    utils::headers::REDACTED,
};

pub const CACHE_STATUS_HEADER: &str = "x-cache";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] KvError),

    #[error("Cache entry encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Cache entry is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    pub cached_at: DateTime<Utc>,
    /// Seconds
    pub ttl: u64,
    pub route_id: String,
}

/// Stored form of a cached response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    #[serde(default)]
    pub body_encoding: BodyEncoding,
    pub metadata: CacheMetadata,
}

/// Headers that describe one particular transfer and are never replayed.
const UNCACHED_HEADERS: &[&str] = &["set-cookie", "content-length", "age", CACHE_STATUS_HEADER];

impl CacheEntry {
    pub fn from_response(response: &ResponseParts, route_id: &str, ttl: u64) -> Self {
        let headers = response
            .headers
            .iter()
            .filter(|(name, _)| !UNCACHED_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let (body, body_encoding) = match std::str::from_utf8(&response.body) {
            Ok(text) => (text.to_string(), BodyEncoding::Utf8),
            Err(_) => (BASE64.encode(&response.body), BodyEncoding::Base64),
        };
        Self {
            status: response.status.as_u16(),
            status_text: response.status_text().to_string(),
            headers,
            body,
            body_encoding,
            metadata: CacheMetadata {
                cached_at: Utc::now(),
                ttl,
                route_id: route_id.to_string(),
            },
        }
    }

    /// Rebuild the response, stamped with `X-Cache: HIT` and an `Age` header.
    pub fn into_response(self, now: DateTime<Utc>) -> Result<ResponseParts, CacheError> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|_| CacheError::Corrupt(format!("status {}", self.status)))?;
        let body = match self.body_encoding {
            BodyEncoding::Utf8 => Bytes::from(self.body),
            BodyEncoding::Base64 => Bytes::from(
                BASE64
                    .decode(self.body.as_bytes())
                    .map_err(|e| CacheError::Corrupt(e.to_string()))?,
            ),
        };

        let mut headers = HeaderMap::with_capacity(self.headers.len() + 2);
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        let age = (now - self.metadata.cached_at).num_seconds().max(0);
        headers.insert(header::AGE, HeaderValue::from(age));
        headers.insert(
            HeaderName::from_static(CACHE_STATUS_HEADER),
            HeaderValue::from_static("HIT"),
        );

        Ok(ResponseParts::new(status, headers, body))
    }
}

fn sha1_hex(data: &[u8]) -> String {
    format!("{:x}", Sha1::digest(data))
}

/// Prefix shared by every cache entry of a route.
pub fn route_prefix(route_id: &str) -> String {
    format!("cache:route:{route_id}:")
}

/// Derive the cache key for a request from the dimensions selected by `policy`.
///
/// Unlisted headers and query parameters never influence the key, and
/// redacted header values are skipped.
pub fn generate_key(route: &FlattenedRoute, policy: &CachePolicy, ctx: &RequestContext) -> String {
    let vary = &policy.vary_by;
    let mut parts: Vec<String> = Vec::new();

    if vary.path {
        parts.push(format!("path={}", ctx.path));
    }
    if vary.method {
        parts.push(format!("method={}", ctx.method.as_str()));
    }

    let mut query_names: Vec<&String> = vary.query.iter().collect();
    query_names.sort();
    query_names.dedup();
    for name in query_names {
        if let Some(value) = ctx.query.get(name) {
            parts.push(format!("query:{name}={value}"));
        }
    }

    let mut header_names: Vec<String> = vary.headers.iter().map(|h| h.to_ascii_lowercase()).collect();
    header_names.sort();
    header_names.dedup();
    for name in header_names {
        if let Some(value) = ctx.headers.get(&name) {
            if value != REDACTED {
                parts.push(format!("header:{name}={value}"));
            }
        }
    }

    if vary.body {
        let body = ctx.body.as_deref().unwrap_or_default();
        parts.push(format!("body={}", sha1_hex(body.as_bytes())));
    }

    format!("{}{}", route_prefix(&route.id), sha1_hex(parts.join("|").as_bytes()))
}

/// Whether a (post-mutation) response may be stored under `policy`.
pub fn should_cache(response: &ResponseParts, policy: &CachePolicy) -> bool {
    if !policy.enabled {
        return false;
    }

    let status = response.status.as_u16();
    let allowed = match &policy.status_codes {
        Some(codes) => codes.contains(&status),
        None => response.status.is_success(),
    };
    if !allowed {
        return false;
    }

    if let Some(max) = policy.max_size_bytes {
        let declared = response
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.unwrap_or(response.body.len()) > max || response.body.len() > max {
            return false;
        }
    }

    let no_store = response
        .headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| {
            v.split(',')
                .any(|d| matches!(d.trim().to_ascii_lowercase().as_str(), "no-store" | "private"))
        });
    !no_store
}

/// Response cache operations over a [`KeyValueStore`].
#[derive(Clone)]
pub struct ResponseCache {
    kv: Arc<dyn KeyValueStore>,
}

impl ResponseCache {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Cached response for `key`, already stamped as a hit.
    pub async fn get(&self, key: &str) -> Result<Option<ResponseParts>, CacheError> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(None);
        };
        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                // Unreadable entries are removed so the next request repopulates them.
                let _ = self.kv.delete(key).await;
                return Err(CacheError::Corrupt(e.to_string()));
            }
        };
        entry.into_response(Utc::now()).map(Some)
    }

    pub async fn set(
        &self,
        key: &str,
        response: &ResponseParts,
        route_id: &str,
        policy: &CachePolicy,
    ) -> Result<(), CacheError> {
        let entry = CacheEntry::from_response(response, route_id, policy.ttl_secs);
        let encoded = serde_json::to_string(&entry)?;
        self.kv
            .set(key, encoded, Duration::from_secs(policy.ttl_secs))
            .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.kv.delete(key).await?)
    }

    /// Delete every entry of one route. Returns the number removed.
    pub async fn invalidate_route(&self, route_id: &str) -> Result<usize, CacheError> {
        let keys = self.kv.list_keys(&route_prefix(route_id)).await?;
        let mut removed = 0;
        for key in keys {
            if self.kv.delete(&key).await? {
                removed += 1;
            }
        }
        tracing::debug!(route_id, removed, "Invalidated route cache");
        Ok(removed)
    }

    /// Delete every entry of the given routes of one gateway.
    pub async fn invalidate_gateway(&self, route_ids: &[String]) -> Result<usize, CacheError> {
        let mut removed = 0;
        for route_id in route_ids {
            removed += self.invalidate_route(route_id).await?;
        }
        Ok(removed)
    }
}
