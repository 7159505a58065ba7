use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use scc::HashMap;
use tokio::task::JoinHandle;

use crate::ports::kv_store::{KeyValueStore, KvError, KvResult};

/// Longest lifetime an entry can get; larger TTLs are clamped.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process TTL key-value store.
///
/// Expired entries read as absent immediately and are physically removed
/// either on access or by the periodic sweeper.
pub struct MemoryKvStore {
    entries: HashMap<String, Entry>,
    available: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every operation fails while off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    fn check_available(&self) -> KvResult<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(KvError::Unavailable("key-value store is offline".into()))
        }
    }

    /// Remove every expired entry. Returns the number removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries
            .retain_async(|_, entry| {
                let live = entry.is_live(now);
                if !live {
                    removed += 1;
                }
                live
            })
            .await;
        removed
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run [`MemoryKvStore::sweep_expired`] every `interval` until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.sweep_expired().await;
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired key-value entries");
                }
            }
        })
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        match self.entries.read_async(key, |_, entry| entry.clone()).await {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value)),
            Some(_) => {
                let _ = self
                    .entries
                    .remove_if_async(key, |entry| !entry.is_live(now))
                    .await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> KvResult<()> {
        self.check_available()?;
        let now = Instant::now();
        let expires_at = now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now);
        let entry = Entry { value, expires_at };
        let _ = self.entries.upsert_async(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .entries
            .remove_async(key)
            .await
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn list_keys(&self, prefix: &str) -> KvResult<Vec<String>> {
        self.check_available()?;
        let now = Instant::now();
        let mut keys = Vec::new();
        self.entries
            .retain_async(|key, entry| {
                let live = entry.is_live(now);
                if live && key.starts_with(prefix) {
                    keys.push(key.clone());
                }
                live
            })
            .await;
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::sleep;

    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let kv = MemoryKvStore::new();
        kv.set("a", "1".into(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("1"));

        kv.set("a", "2".into(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("2"));

        assert!(kv.delete("a").await.unwrap());
        assert!(!kv.delete("a").await.unwrap());
        assert!(kv.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_huge_ttl_is_clamped() {
        let kv = MemoryKvStore::new();
        kv.set("forever", "x".into(), Duration::from_secs(u64::MAX))
            .await
            .unwrap();
        assert_eq!(kv.get("forever").await.unwrap().as_deref(), Some("x"));
        assert_eq!(kv.sweep_expired().await, 0);
    }

    #[tokio::test]
    async fn test_expired_entries_read_as_absent() {
        let kv = MemoryKvStore::new();
        kv.set("short", "x".into(), Duration::from_millis(20))
            .await
            .unwrap();
        kv.set("long", "y".into(), Duration::from_secs(60))
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;

        assert!(kv.get("short").await.unwrap().is_none());
        assert_eq!(kv.get("long").await.unwrap().as_deref(), Some("y"));
        assert_eq!(kv.len(), 1);
    }

    #[tokio::test]
    async fn test_list_keys_by_prefix() {
        let kv = MemoryKvStore::new();
        let ttl = Duration::from_secs(60);
        kv.set("cache:route:r1:b", "1".into(), ttl).await.unwrap();
        kv.set("cache:route:r1:a", "1".into(), ttl).await.unwrap();
        kv.set("cache:route:r10:a", "1".into(), ttl).await.unwrap();
        kv.set("gateway:config:acme", "1".into(), ttl).await.unwrap();

        assert_eq!(
            kv.list_keys("cache:route:r1:").await.unwrap(),
            vec!["cache:route:r1:a", "cache:route:r1:b"]
        );
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let kv = MemoryKvStore::new();
        kv.set("a", "1".into(), Duration::from_millis(10)).await.unwrap();
        kv.set("b", "1".into(), Duration::from_millis(10)).await.unwrap();
        kv.set("c", "1".into(), Duration::from_secs(60)).await.unwrap();
        sleep(Duration::from_millis(30)).await;

        assert_eq!(kv.sweep_expired().await, 2);
        assert_eq!(kv.len(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_removes_entries_in_background() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set("a", "1".into(), Duration::from_millis(5)).await.unwrap();
        let handle = kv.spawn_sweeper(Duration::from_millis(10));
        sleep(Duration::from_millis(60)).await;
        handle.abort();
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let kv = MemoryKvStore::new();
        kv.set_available(false);
        assert!(kv.get("a").await.is_err());
        assert!(kv.set("a", "1".into(), Duration::from_secs(1)).await.is_err());
    }
}
