//! Runtime snapshots of a gateway and its routes.
//!
//! [`flatten`] merges a gateway document with its active routes into one
//! immutable [`FlattenedGateway`]: variables reduced to a plain map, every
//! path pattern compiled, routes sorted by priority. [`ConfigLoader`] caches
//! the snapshot in the key-value store under `gateway:config:{subdomain}`.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use http::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    core::{
        entities::{CachePolicy, Gateway, GatewayDefaults, ParamRule, Route},
        mutation::{BodyTransform, ConditionSource, Mutation, MutationOp, ScriptSandbox},
        pattern::Pattern,
    },
    ports::{
        document_store::{DocumentStore, StoreError},
        kv_store::KeyValueStore,
    },
};

/// What a capturing group of a compiled path pattern holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathCapture {
    Named(String),
    Wildcard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlattenedRoute {
    pub id: String,
    pub name: String,
    /// Original, uncompiled path pattern.
    pub path: String,
    /// Uppercase method names, or `*`.
    pub methods: Vec<String>,
    pub priority: i32,
    pub destination: String,
    pub matcher: Pattern,
    /// One entry per capturing group of `matcher`, in order.
    pub captures: Vec<PathCapture>,
    #[serde(default)]
    pub validation: BTreeMap<String, ParamRule>,
    #[serde(default)]
    pub pre_mutations: Vec<Mutation>,
    #[serde(default)]
    pub post_mutations: Vec<Mutation>,
    /// Effective cache policy; `None` when disabled on the route or the gateway.
    #[serde(default)]
    pub cache: Option<CachePolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl FlattenedRoute {
    pub fn allows_method(&self, method: &Method) -> bool {
        self.methods
            .iter()
            .any(|m| m == "*" || m.eq_ignore_ascii_case(method.as_str()))
    }

    /// Whether any mutation runs a script (and so may block for its deadline).
    pub fn has_scripts(&self) -> bool {
        self.pre_mutations
            .iter()
            .chain(&self.post_mutations)
            .any(|m| matches!(m.op, MutationOp::Body(BodyTransform::Function { .. })))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlattenedGateway {
    pub id: String,
    pub subdomain: String,
    pub name: String,
    pub base_url: String,
    pub active: bool,
    pub variables: BTreeMap<String, String>,
    pub defaults: GatewayDefaults,
    /// Sorted by descending priority, ties by ascending route id.
    pub routes: Vec<FlattenedRoute>,
    pub version: String,
    pub flattened_at: DateTime<Utc>,
}

/// Compile a route path pattern into an anchored matcher.
///
/// `:name` becomes `([^/]+)`, `*` becomes `(.*)`, everything else is matched
/// literally. A trailing slash is optional unless the pattern ends in `/` or `*`.
pub fn compile_path_pattern(path: &str) -> Result<(Pattern, Vec<PathCapture>), regex::Error> {
    let mut regex = String::with_capacity(path.len() + 16);
    let mut captures = Vec::new();
    let mut literal = String::new();
    let mut chars = path.chars().peekable();

    regex.push('^');
    while let Some(c) = chars.next() {
        match c {
            ':' if chars.peek().is_some_and(|n| is_param_char(*n)) => {
                regex.push_str(&regex::escape(&literal));
                literal.clear();
                let mut name = String::new();
                while let Some(n) = chars.peek().copied().filter(|n| is_param_char(*n)) {
                    name.push(n);
                    chars.next();
                }
                regex.push_str("([^/]+)");
                captures.push(PathCapture::Named(name));
            }
            '*' => {
                regex.push_str(&regex::escape(&literal));
                literal.clear();
                regex.push_str("(.*)");
                captures.push(PathCapture::Wildcard);
            }
            other => literal.push(other),
        }
    }
    regex.push_str(&regex::escape(&literal));
    if !(path.ends_with('/') || path.ends_with('*')) {
        regex.push_str("/?");
    }
    regex.push('$');

    Ok((Pattern::new(&regex)?, captures))
}

fn is_param_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Check everything in a route that can only fail at request time otherwise.
/// Validate a mutation list and compile its `matches` conditions.
fn compile_mutations(
    mutations: &[Mutation],
    sandbox: &ScriptSandbox,
) -> Result<Vec<Mutation>, String> {
    let mut compiled = mutations.to_vec();
    for (index, mutation) in compiled.iter_mut().enumerate() {
        if let MutationOp::Body(transform) = &mutation.op {
            match transform {
                BodyTransform::Function { code, .. } => {
                    sandbox
                        .validate(code)
                        .map_err(|e| format!("mutation {index}: {e}"))?;
                }
                BodyTransform::JsonPath { path, .. } if !path.trim_start().starts_with('$') => {
                    return Err(format!("mutation {index}: JSONPath '{path}' must start with '$'"));
                }
                _ => {}
            }
        }
        if let Some(condition) = &mut mutation.condition {
            condition
                .compile()
                .map_err(|e| format!("mutation {index}: {e}"))?;
            if let ConditionSource::Expression { expression } = &condition.source {
                if expression.trim().is_empty() {
                    return Err(format!("mutation {index}: empty expression"));
                }
            }
        }
    }
    Ok(compiled)
}

fn flatten_route(
    route: &Route,
    defaults: &GatewayDefaults,
    sandbox: &ScriptSandbox,
) -> Result<FlattenedRoute, String> {
    let (matcher, captures) =
        compile_path_pattern(&route.path).map_err(|e| format!("invalid path pattern: {e}"))?;
    let pre_mutations = compile_mutations(&route.mutations.pre, sandbox)?;
    let post_mutations = compile_mutations(&route.mutations.post, sandbox)?;

    let cache = route
        .cache
        .clone()
        .filter(|policy| defaults.cache_enabled && policy.enabled);

    Ok(FlattenedRoute {
        id: route.id.clone(),
        name: if route.name.is_empty() {
            route.path.clone()
        } else {
            route.name.clone()
        },
        path: route.path.clone(),
        methods: route
            .methods
            .iter()
            .map(|m| m.trim().to_ascii_uppercase())
            .collect(),
        priority: route.priority,
        destination: route.destination.clone(),
        matcher,
        captures,
        validation: route.validation.clone(),
        pre_mutations,
        post_mutations,
        cache,
        timeout_ms: route.timeout_ms,
    })
}

/// Merge a gateway and its routes into a runtime snapshot.
///
/// Inactive routes and routes of other gateways are ignored. A route whose
/// pattern, script or condition regex does not compile is dropped with a warning.
pub fn flatten(gateway: &Gateway, routes: &[Route], sandbox: &ScriptSandbox) -> FlattenedGateway {
    let mut flattened: Vec<FlattenedRoute> = routes
        .iter()
        .filter(|r| r.active && r.gateway_id == gateway.id)
        .filter_map(|route| match flatten_route(route, &gateway.defaults, sandbox) {
            Ok(flat) => Some(flat),
            Err(reason) => {
                tracing::warn!(
                    gateway_id = %gateway.id,
                    route_id = %route.id,
                    "Dropping route from snapshot: {}",
                    reason
                );
                None
            }
        })
        .collect();

    flattened.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

    let latest = routes
        .iter()
        .filter(|r| r.gateway_id == gateway.id)
        .map(|r| r.updated_at)
        .fold(gateway.updated_at, |acc, t| acc.max(t));

    FlattenedGateway {
        id: gateway.id.clone(),
        subdomain: gateway.subdomain.clone(),
        name: gateway.name.clone(),
        base_url: gateway.base_url.clone(),
        active: gateway.active,
        variables: gateway
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect(),
        defaults: gateway.defaults.clone(),
        version: format!("{}.{}", latest.timestamp_millis(), flattened.len()),
        routes: flattened,
        flattened_at: Utc::now(),
    }
}

/// Key of a cached snapshot in the key-value store.
pub fn config_key(subdomain: &str) -> String {
    format!("gateway:config:{subdomain}")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration unavailable: {0}")]
    Unavailable(#[from] StoreError),
}

/// Read-through loader for gateway snapshots.
pub struct ConfigLoader {
    store: Arc<dyn DocumentStore>,
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
    sandbox: ScriptSandbox,
}

impl ConfigLoader {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        kv: Arc<dyn KeyValueStore>,
        ttl: Duration,
        sandbox: ScriptSandbox,
    ) -> Self {
        Self {
            store,
            kv,
            ttl,
            sandbox,
        }
    }

    /// Snapshot for `subdomain`, or `None` when the gateway is missing or inactive.
    pub async fn load(&self, subdomain: &str) -> Result<Option<Arc<FlattenedGateway>>, ConfigError> {
        let key = config_key(subdomain);

        match self.kv.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str::<FlattenedGateway>(&cached) {
                Ok(snapshot) if snapshot.active => {
                    tracing::trace!(subdomain, version = %snapshot.version, "Config cache hit");
                    return Ok(Some(Arc::new(snapshot)));
                }
                Ok(_) => return Ok(None),
                Err(e) => {
                    tracing::warn!(subdomain, "Discarding undecodable cached snapshot: {}", e);
                }
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(subdomain, "Config cache read failed: {}", e),
        }

        let Some(gateway) = self.store.find_gateway_by_subdomain(subdomain).await? else {
            return Ok(None);
        };
        if !gateway.active {
            tracing::debug!(subdomain, gateway_id = %gateway.id, "Gateway is inactive");
            return Ok(None);
        }
        let routes = self.store.list_active_routes(&gateway.id).await?;
        let snapshot = flatten(&gateway, &routes, &self.sandbox);

        match serde_json::to_string(&snapshot) {
            Ok(encoded) => {
                if let Err(e) = self.kv.set(&key, encoded, self.ttl).await {
                    tracing::warn!(subdomain, "Config cache write failed: {}", e);
                }
            }
            Err(e) => tracing::warn!(subdomain, "Snapshot encoding failed: {}", e),
        }

        tracing::debug!(
            subdomain,
            gateway_id = %snapshot.id,
            routes = snapshot.routes.len(),
            version = %snapshot.version,
            "Flattened gateway configuration"
        );
        Ok(Some(Arc::new(snapshot)))
    }

    /// Drop the cached snapshot so the next request rebuilds it.
    pub async fn invalidate(&self, subdomain: &str) {
        match self.kv.delete(&config_key(subdomain)).await {
            Ok(existed) => tracing::debug!(subdomain, existed, "Invalidated config snapshot"),
            Err(e) => tracing::warn!(subdomain, "Config invalidation failed: {}", e),
        }
    }

    /// Invalidate and rebuild the snapshot immediately.
    pub async fn refresh(
        &self,
        subdomain: &str,
    ) -> Result<Option<Arc<FlattenedGateway>>, ConfigError> {
        self.invalidate(subdomain).await;
        self.load(subdomain).await
    }
}
