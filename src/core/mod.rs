pub mod admin;
pub mod cache;
pub mod context;
pub mod destination;
pub mod entities;
pub mod error;
pub mod execution_log;
pub mod flatten;
pub mod mutation;
pub mod pattern;
pub mod pipeline;
pub mod router;
pub mod tenant;

pub use admin::{AdminSync, SyncReport};
pub use pipeline::Pipeline;
