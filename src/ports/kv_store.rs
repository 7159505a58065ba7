use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a key-value store.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum KvError {
    #[error("Key-value store unavailable: {0}")]
    Unavailable(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// KeyValueStore is the port for the fast TTL-bounded store backing the
/// configuration snapshot cache and the response cache.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Fetch a live value; expired entries read as absent.
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Store a value that expires after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> KvResult<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> KvResult<bool>;

    /// Every live key starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> KvResult<Vec<String>>;
}
