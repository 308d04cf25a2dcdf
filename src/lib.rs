//! Quota Engine - storage quota admission and upload reliability for a
//! file-collection service
//!
//! This library provides the core functionality of the engine: real-time
//! quota admission control, batched asynchronous usage accounting,
//! bounded-parallel retrying uploads, and periodic consistency
//! reconciliation against the blob store.

pub mod admission;
pub mod api;
pub mod config;
pub mod error;
pub mod flusher;
pub mod logging;
pub mod policy;
pub mod rate_limiter;
pub mod reconciler;
pub mod shutdown;
pub mod store;
pub mod types;
pub mod uploader;
pub mod usage_queue;

pub use error::{QuotaError, Result};
