//! Tenant documents as stored by the administrative side.
//!
//! A [`Gateway`] binds one subdomain to one upstream base URL; each [`Route`]
//! belongs to exactly one gateway. These are the raw documents; the request
//! path never uses them directly but works on the flattened snapshot built by
//! [`crate::core::flatten`].
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{mutation::Mutation, pattern::Pattern};

fn default_true() -> bool {
    true
}

fn default_methods() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_cache_ttl() -> u64 {
    300
}

/// Tenant root entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub id: String,
    pub subdomain: String,
    #[serde(default)]
    pub name: String,
    /// Upstream base URL that relative route destinations are joined to.
    pub base_url: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub variables: HashMap<String, Variable>,
    #[serde(default)]
    pub defaults: GatewayDefaults,
    #[serde(default)]
    pub stats: TrafficStats,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// A named tenant variable. Only `value` reaches the runtime snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variable {
    pub value: String,
    #[serde(default)]
    pub secret: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Variable {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            secret: false,
            description: None,
        }
    }
}

/// Gateway-wide policy applied to every route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayDefaults {
    /// Upstream timeout in milliseconds; the server-wide default applies when unset.
    pub timeout_ms: Option<u64>,
    /// Master switch for response caching on every route of the gateway.
    pub cache_enabled: bool,
    pub log_level: LogLevel,
}

impl Default for GatewayDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            cache_enabled: true,
            log_level: LogLevel::All,
        }
    }
}

/// Which requests produce a persisted execution log record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    None,
    Errors,
    #[default]
    All,
}

/// Aggregate request counters kept on gateways and routes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrafficStats {
    pub total_requests: u64,
    pub error_count: u64,
    pub cache_hits: u64,
    pub total_duration_ms: u64,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl TrafficStats {
    pub fn record(&mut self, sample: &RequestStats) {
        self.total_requests += 1;
        if sample.status >= 400 {
            self.error_count += 1;
        }
        if sample.cache_hit {
            self.cache_hits += 1;
        }
        self.total_duration_ms += sample.duration_ms;
        self.last_request_at = Some(sample.at);
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total_requests as f64
        }
    }
}

/// One finished request, reported to the store for the aggregate counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStats {
    pub gateway_id: String,
    pub route_id: Option<String>,
    pub status: u16,
    pub duration_ms: u64,
    pub cache_hit: bool,
    pub at: DateTime<Utc>,
}

/// One path+method rule within a gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub gateway_id: String,
    #[serde(default)]
    pub name: String,
    /// Path pattern: literal segments, `:name` parameters and `*` wildcards.
    pub path: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    /// Destination URL template; relative values are joined to the gateway base URL.
    #[serde(default)]
    pub destination: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub validation: BTreeMap<String, ParamRule>,
    #[serde(default)]
    pub mutations: RouteMutations,
    #[serde(default)]
    pub cache: Option<CachePolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub stats: TrafficStats,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouteMutations {
    pub pre: Vec<Mutation>,
    pub post: Vec<Mutation>,
}

/// Validation applied to one captured path parameter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ParamRule {
    pub pattern: Option<Pattern>,
    pub kind: Option<ParamKind>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Integer,
    Uuid,
    Alpha,
    Alphanumeric,
}

impl ParamKind {
    pub fn accepts(self, value: &str) -> bool {
        match self {
            ParamKind::Integer => {
                let digits = value.strip_prefix('-').unwrap_or(value);
                !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
            }
            ParamKind::Uuid => uuid::Uuid::parse_str(value).is_ok(),
            ParamKind::Alpha => !value.is_empty() && value.chars().all(char::is_alphabetic),
            ParamKind::Alphanumeric => {
                !value.is_empty() && value.chars().all(char::is_alphanumeric)
            }
        }
    }
}

impl ParamRule {
    /// Check a captured value, returning a human readable reason on failure.
    pub fn check(&self, value: &str) -> Result<(), String> {
        if let Some(kind) = self.kind {
            if !kind.accepts(value) {
                return Err(format!("expected {kind:?} value").to_lowercase());
            }
        }
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(value) {
                return Err(format!("does not match '{}'", pattern.as_str()));
            }
        }
        Ok(())
    }
}

/// Per-route response caching policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachePolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub vary_by: VaryBy,
    /// Only responses with one of these statuses are stored; when unset, only 2xx responses are.
    #[serde(default)]
    pub status_codes: Option<Vec<u16>>,
    #[serde(default)]
    pub max_size_bytes: Option<usize>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl(),
            vary_by: VaryBy::default(),
            status_codes: None,
            max_size_bytes: None,
        }
    }
}

/// Request dimensions that participate in the cache key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VaryBy {
    pub path: bool,
    pub method: bool,
    pub query: Vec<String>,
    pub headers: Vec<String>,
    pub body: bool,
}

impl Default for VaryBy {
    fn default() -> Self {
        Self {
            path: true,
            method: true,
            query: Vec::new(),
            headers: Vec::new(),
            body: false,
        }
    }
}

/// The full administrative document set, as published by a seed provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSeed {
    pub gateways: Vec<Gateway>,
    pub routes: Vec<Route>,
}
