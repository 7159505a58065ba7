use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scc::HashMap;
use tokio::sync::Mutex;

use crate::{
    core::{
        entities::{Gateway, RequestStats, Route, StoreSeed},
        execution_log::LogRecord,
    },
    ports::document_store::{AdminStore, DocumentStore, StoreError, StoreResult},
};

/// In-process document store.
///
/// Gateways and routes are keyed by id; a secondary index maps subdomains to
/// gateway ids. Execution logs carry their own expiry and are removed by
/// [`MemoryDocumentStore::purge_expired_logs`].
pub struct MemoryDocumentStore {
    gateways: HashMap<String, Gateway>,
    subdomains: HashMap<String, String>,
    routes: HashMap<String, Route>,
    logs: HashMap<String, LogRecord>,
    available: AtomicBool,
    // Serializes administrative writes against each other.
    write_lock: Mutex<()>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            gateways: HashMap::new(),
            subdomains: HashMap::new(),
            routes: HashMap::new(),
            logs: HashMap::new(),
            available: AtomicBool::new(true),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn from_seed(seed: StoreSeed) -> Self {
        let store = Self::new();
        store.load(seed).await;
        store
    }

    /// Simulate an outage: every operation fails with `Unavailable` while off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("document store is offline".into()))
        }
    }

    async fn load(&self, seed: StoreSeed) {
        for gateway in seed.gateways {
            let _ = self
                .subdomains
                .upsert_async(gateway.subdomain.to_lowercase(), gateway.id.clone())
                .await;
            let _ = self.gateways.upsert_async(gateway.id.clone(), gateway).await;
        }
        for route in seed.routes {
            let _ = self.routes.upsert_async(route.id.clone(), route).await;
        }
    }

    async fn snapshot(&self) -> StoreSeed {
        let mut seed = StoreSeed::default();
        self.gateways
            .retain_async(|_, gateway| {
                seed.gateways.push(gateway.clone());
                true
            })
            .await;
        self.routes
            .retain_async(|_, route| {
                seed.routes.push(route.clone());
                true
            })
            .await;
        seed.gateways.sort_by(|a, b| a.id.cmp(&b.id));
        seed.routes.sort_by(|a, b| a.id.cmp(&b.id));
        seed
    }

    pub async fn gateway(&self, id: &str) -> Option<Gateway> {
        self.gateways.read_async(id, |_, g| g.clone()).await
    }

    pub async fn route(&self, id: &str) -> Option<Route> {
        self.routes.read_async(id, |_, r| r.clone()).await
    }

    /// Every stored log record, oldest first.
    pub async fn logs(&self) -> Vec<LogRecord> {
        let mut records = Vec::new();
        self.logs
            .retain_async(|_, record| {
                records.push(record.clone());
                true
            })
            .await;
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Delete log records whose expiry has passed. Returns the number removed.
    pub async fn purge_expired_logs(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.logs
            .retain_async(|_, record| {
                let keep = record.expires_at > now;
                if !keep {
                    removed += 1;
                }
                keep
            })
            .await;
        if removed > 0 {
            tracing::debug!(removed, "Purged expired execution logs");
        }
        removed
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find_gateway_by_subdomain(&self, subdomain: &str) -> StoreResult<Option<Gateway>> {
        self.check_available()?;
        let key = subdomain.to_lowercase();
        let Some(id) = self.subdomains.read_async(&key, |_, id| id.clone()).await else {
            return Ok(None);
        };
        Ok(self.gateway(&id).await)
    }

    async fn list_active_routes(&self, gateway_id: &str) -> StoreResult<Vec<Route>> {
        self.check_available()?;
        let mut routes = Vec::new();
        self.routes
            .retain_async(|_, route| {
                if route.active && route.gateway_id == gateway_id {
                    routes.push(route.clone());
                }
                true
            })
            .await;
        routes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(routes)
    }

    async fn insert_log(&self, record: LogRecord) -> StoreResult<()> {
        self.check_available()?;
        let _ = self.logs.upsert_async(record.id.clone(), record).await;
        Ok(())
    }

    async fn record_request(&self, stats: RequestStats) -> StoreResult<()> {
        self.check_available()?;
        self.gateways
            .update_async(&stats.gateway_id, |_, gateway| gateway.stats.record(&stats))
            .await;
        if let Some(route_id) = &stats.route_id {
            self.routes
                .update_async(route_id, |_, route| route.stats.record(&stats))
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl AdminStore for MemoryDocumentStore {
    async fn replace_all(&self, seed: StoreSeed) -> StoreResult<StoreSeed> {
        self.check_available()?;
        let _guard = self.write_lock.lock().await;
        let previous = self.snapshot().await;

        // Counters survive republishing the same documents.
        let mut seed = seed;
        for gateway in &mut seed.gateways {
            if let Some(old) = previous.gateways.iter().find(|g| g.id == gateway.id) {
                gateway.stats = old.stats.clone();
            }
        }
        for route in &mut seed.routes {
            if let Some(old) = previous.routes.iter().find(|r| r.id == route.id) {
                route.stats = old.stats.clone();
            }
        }

        self.gateways.retain_async(|_, _| false).await;
        self.subdomains.retain_async(|_, _| false).await;
        self.routes.retain_async(|_, _| false).await;
        self.load(seed).await;

        Ok(previous)
    }
}
