//! MCC Proxy - cache proxy serving multi-key reads under Monotonic Cache Consistency
//!
//! This library provides the versioned cache index, the read/invalidation
//! orchestration against a database and a cache store, the single-writer task
//! queue, obsolescence prediction, and the HTTP API.

pub mod access_tracker;
pub mod cache_connector;
pub mod cache_types;
pub mod config;
pub mod consistent_cache;
pub mod db_connector;
pub mod error;
pub mod features;
pub mod logging;
pub mod metrics;
pub mod predictor;
pub mod proxy;
pub mod server;
pub mod shutdown;
pub mod task_queue;
pub mod time_utils;

pub use error::{ProxyError, Result};
