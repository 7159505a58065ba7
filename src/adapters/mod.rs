pub mod http_client;
pub mod http_handler;
pub mod memory_kv;
pub mod memory_store;
pub mod middleware;
pub mod seed_providers;

/// Re-export commonly used types from adapters
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use memory_kv::MemoryKvStore;
pub use memory_store::MemoryDocumentStore;
pub use middleware::*;
pub use seed_providers::{FileSeedProvider, HttpSeedProvider};
