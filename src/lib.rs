//! Portico - a multi-tenant, subdomain-routed HTTP gateway.
//!
//! Each tenant binds a subdomain to an upstream base URL and declares routes
//! that may rewrite requests and responses, cache responses, and record an
//! execution log per request. The crate follows a **hexagonal architecture**:
//! the request pipeline lives in `core`, depends only on the traits in
//! `ports`, and is wired to concrete stores and HTTP plumbing in `adapters`.
//!
//! # Features
//! - Tenant resolution from the first label of the Host header
//! - Versioned, flattened gateway snapshots cached in a TTL key-value store
//! - Priority-ordered path routing with `:name` parameters and `*` wildcards
//! - Conditional header / query / body / status mutations with `${...}` templating
//! - Sandboxed tenant body transforms with operation and time limits
//! - Response caching keyed on the request dimensions each route selects
//! - Execution logs with phase timings, sanitized headers and capped bodies
//! - Seed documents from a watched file or a polled HTTP endpoint
//! - Structured tracing via `tracing` and graceful shutdown that drains
//!   background work
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use portico::{
//!     HttpClientAdapter, HttpHandler, MemoryDocumentStore, MemoryKvStore, Pipeline,
//!     config::ServerConfig,
//! };
//! use tokio_util::task::TaskTracker;
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = ServerConfig::default();
//! let store = Arc::new(MemoryDocumentStore::new());
//! let kv = Arc::new(MemoryKvStore::new());
//! let client = Arc::new(HttpClientAdapter::new()?);
//! let pipeline = Pipeline::new(&config, store, kv, client, TaskTracker::new());
//! let app = HttpHandler::new(Arc::new(pipeline), &config).router();
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Library modules return domain error types built with `thiserror`; the
//! binary and the seed providers use `eyre::Result<T>` with context attached.
//! Inside the pipeline, cache and log failures are logged and swallowed.
//!
//! # Concurrency & Data Structures
//! Shared maps use `scc::HashMap`. Background work (cache writes, log
//! persistence, counters) is spawned on a `tokio_util::task::TaskTracker`.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{
        FileSeedProvider, HttpClientAdapter, HttpHandler, HttpSeedProvider, MemoryDocumentStore,
        MemoryKvStore,
    },
    core::{AdminSync, Pipeline},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
