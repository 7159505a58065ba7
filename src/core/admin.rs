//! Publishing a new administrative document set.
//!
//! Every write goes to the store first; then the cached snapshot of each
//! affected gateway is deleted and the response caches of changed routes are
//! cleared, so the next request rebuilds from the new documents.
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use serde::Serialize;
use serde_json::Value;

use crate::{
    core::{
        cache::ResponseCache,
        entities::{Gateway, Route, StoreSeed},
        flatten::ConfigLoader,
    },
    ports::document_store::{AdminStore, StoreError},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub gateways: usize,
    pub routes: usize,
    pub invalidated_snapshots: usize,
    pub invalidated_cache_entries: usize,
}

pub struct AdminSync {
    store: Arc<dyn AdminStore>,
    loader: Arc<ConfigLoader>,
    cache: ResponseCache,
}

/// Document content without counters and bookkeeping timestamps.
fn fingerprint<T: Serialize>(doc: &T) -> Value {
    let mut value = serde_json::to_value(doc).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        for field in ["stats", "created_at", "updated_at"] {
            map.remove(field);
        }
    }
    value
}

fn changed<T: Serialize>(old: Option<&T>, new: Option<&T>) -> bool {
    match (old, new) {
        (Some(a), Some(b)) => fingerprint(a) != fingerprint(b),
        (None, None) => false,
        _ => true,
    }
}

/// Subdomains whose snapshot and routes whose cached responses are stale
/// after replacing `previous` with `next`.
fn stale_entries(previous: &StoreSeed, next: &StoreSeed) -> (Vec<String>, Vec<String>) {
    let new_gateways: HashMap<&str, &Gateway> =
        next.gateways.iter().map(|g| (g.id.as_str(), g)).collect();
    let new_routes: HashMap<&str, &Route> =
        next.routes.iter().map(|r| (r.id.as_str(), r)).collect();
    let old_gateways: HashMap<&str, &Gateway> =
        previous.gateways.iter().map(|g| (g.id.as_str(), g)).collect();
    let old_routes: HashMap<&str, &Route> =
        previous.routes.iter().map(|r| (r.id.as_str(), r)).collect();

    let mut dirty_gateways: BTreeSet<&str> = BTreeSet::new();
    for id in old_gateways.keys().chain(new_gateways.keys()) {
        if changed(old_gateways.get(id), new_gateways.get(id)) {
            dirty_gateways.insert(*id);
        }
    }

    let mut stale_routes: BTreeSet<&str> = BTreeSet::new();
    for id in old_routes.keys().chain(new_routes.keys()) {
        let old = old_routes.get(id);
        let new = new_routes.get(id);
        if changed(old, new) {
            for route in old.into_iter().chain(new) {
                dirty_gateways.insert(route.gateway_id.as_str());
            }
            stale_routes.insert(*id);
        }
    }
    for route in old_routes.values() {
        if dirty_gateways.contains(route.gateway_id.as_str()) {
            stale_routes.insert(route.id.as_str());
        }
    }

    let mut subdomains: BTreeSet<&str> = BTreeSet::new();
    for id in &dirty_gateways {
        for gateway in [old_gateways.get(id), new_gateways.get(id)].into_iter().flatten() {
            subdomains.insert(gateway.subdomain.as_str());
        }
    }

    (
        subdomains.into_iter().map(str::to_string).collect(),
        stale_routes.into_iter().map(str::to_string).collect(),
    )
}

impl AdminSync {
    pub fn new(store: Arc<dyn AdminStore>, loader: Arc<ConfigLoader>, cache: ResponseCache) -> Self {
        Self {
            store,
            loader,
            cache,
        }
    }

    /// Store `seed` and invalidate everything derived from documents it changes.
    pub async fn apply(&self, seed: StoreSeed) -> Result<SyncReport, StoreError> {
        let mut report = SyncReport {
            gateways: seed.gateways.len(),
            routes: seed.routes.len(),
            ..SyncReport::default()
        };

        let previous = self.store.replace_all(seed.clone()).await?;
        let (subdomains, stale_routes) = stale_entries(&previous, &seed);

        for subdomain in &subdomains {
            self.loader.invalidate(subdomain).await;
            report.invalidated_snapshots += 1;
        }

        match self.cache.invalidate_gateway(&stale_routes).await {
            Ok(removed) => report.invalidated_cache_entries = removed,
            Err(e) => tracing::warn!("Response cache invalidation failed: {}", e),
        }

        tracing::info!(
            gateways = report.gateways,
            routes = report.routes,
            invalidated_snapshots = report.invalidated_snapshots,
            invalidated_cache_entries = report.invalidated_cache_entries,
            "Applied administrative document set"
        );
        Ok(report)
    }
}
