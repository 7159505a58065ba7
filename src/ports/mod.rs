//! Ports: the traits the pipeline depends on. Adapters live in `crate::adapters`.
pub mod document_store;
pub mod http_client;
pub mod kv_store;
pub mod seed_provider;
