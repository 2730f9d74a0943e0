//! Database Connector Module
//!
//! Interface to the authoritative database plus an in-memory implementation that
//! assigns commit versions the way a commit-timestamp-tracking database would.

use crate::cache_types::{ItemRecord, Version};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

/// Batch reader over the authoritative database.
///
/// Versions returned by `batch_select` must be on the same nanosecond epoch as
/// invalidation timestamps.
#[async_trait]
pub trait DbConnector: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Rows for the requested keys that exist; absent keys are simply not returned
    async fn batch_select(&self, table: &str, keys: &[String]) -> Result<Vec<ItemRecord>>;
}

type Table = HashMap<String, (String, Version)>;

/// In-memory database; every write batch commits under one new version.
pub struct InMemoryDatabase {
    tables: Mutex<HashMap<String, Table>>,
    last_version: AtomicU64,
    connected: AtomicBool,
    available: AtomicBool,
    select_count: AtomicU64,
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::with_initial_version(0)
    }

    /// Versions issued by this database start right after `version`
    pub fn with_initial_version(version: Version) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            last_version: AtomicU64::new(version),
            connected: AtomicBool::new(false),
            available: AtomicBool::new(true),
            select_count: AtomicU64::new(0),
        }
    }

    /// Commit `rows` into `table` atomically and return the commit version
    pub fn write_batch(&self, table: &str, rows: &[(&str, &str)]) -> Result<Version> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| ProxyError::DatabaseError("Database lock poisoned".to_string()))?;
        let version = self.last_version.fetch_add(1, Ordering::SeqCst) + 1;
        let rows_table = tables.entry(table.to_string()).or_default();
        for (key, value) in rows {
            rows_table.insert(key.to_string(), (value.to_string(), version));
        }
        debug!("Committed {} rows into {} at version {}", rows.len(), table, version);
        Ok(version)
    }

    pub fn write(&self, table: &str, key: &str, value: &str) -> Result<Version> {
        self.write_batch(table, &[(key, value)])
    }

    /// Simulate an outage; every call fails while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of `batch_select` calls served
    pub fn select_count(&self) -> u64 {
        self.select_count.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProxyError::DatabaseError("Database unavailable".to_string()))
        }
    }
}

#[async_trait]
impl DbConnector for InMemoryDatabase {
    async fn connect(&self) -> Result<()> {
        self.check_available()?;
        self.connected.store(true, Ordering::SeqCst);
        info!("Connected to in-memory database");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        info!("Disconnected from in-memory database");
        Ok(())
    }

    async fn batch_select(&self, table: &str, keys: &[String]) -> Result<Vec<ItemRecord>> {
        self.check_available()?;
        self.select_count.fetch_add(1, Ordering::Relaxed);
        let tables = self
            .tables
            .lock()
            .map_err(|_| ProxyError::DatabaseError("Database lock poisoned".to_string()))?;
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .iter()
            .filter_map(|key| {
                rows.get(key)
                    .map(|(value, version)| ItemRecord::new(key.clone(), value.clone(), *version))
            })
            .collect())
    }
}
