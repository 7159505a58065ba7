use async_trait::async_trait;
use thiserror::Error;

use crate::core::{
    entities::{Gateway, RequestStats, Route, StoreSeed},
    execution_log::LogRecord,
};

/// Errors raised by a document store.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be reached or refused the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A document could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for document store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// DocumentStore is the port for the administrative database holding gateways,
/// routes and execution logs.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Look up a gateway by its subdomain, active or not.
    async fn find_gateway_by_subdomain(&self, subdomain: &str) -> StoreResult<Option<Gateway>>;

    /// All active routes of a gateway, in the store's natural order.
    async fn list_active_routes(&self, gateway_id: &str) -> StoreResult<Vec<Route>>;

    /// Persist one execution log record.
    async fn insert_log(&self, record: LogRecord) -> StoreResult<()>;

    /// Fold one finished request into the gateway and route counters.
    async fn record_request(&self, stats: RequestStats) -> StoreResult<()>;
}

/// Administrative write access used to publish a new document set.
#[async_trait]
pub trait AdminStore: DocumentStore {
    /// Replace every gateway and route, returning the previous documents.
    async fn replace_all(&self, seed: StoreSeed) -> StoreResult<StoreSeed>;
}
