use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::core::entities::StoreSeed;

/// Source of the administrative document set (gateways and routes).
#[async_trait]
pub trait SeedProvider: Send + Sync {
    /// Load the current document set.
    async fn load_seed(&self) -> Result<StoreSeed>;

    /// Return a channel that signals when the document set has changed.
    /// The receiver should trigger a reload by calling `load_seed`.
    fn watch(&self) -> mpsc::Receiver<()>;
}
