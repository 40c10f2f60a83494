// =============================================================================
// Matrixon Sliding Sync Proxy - Abstraction Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Ordered key/value engine seam used by the shared cache and the account
//   registry. Engines only need atomic batch writes and prefix scans; the
//   relational layout behind them is an implementation detail.
//
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;

pub mod memory;

#[cfg(feature = "backend_postgresql")]
pub mod postgresql;

#[async_trait]
pub trait KeyValueDatabaseEngine: Send + Sync {
    /// Opens (creating if needed) the tree with the given name
    ///
    /// # Errors
    ///
    /// Returns a `Database` error if the backing table cannot be created.
    async fn open_tree(&self, name: &'static str) -> Result<Arc<dyn KvTree>>;

    /// Flushes all pending changes to durable storage
    async fn flush(&self) -> Result<()>;

    /// Human readable description of the engine, for startup logs
    fn describe(&self) -> String;
}

#[async_trait]
pub trait KvTree: Send + Sync {
    /// Retrieves a value
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Inserts or replaces a value
    async fn insert(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Inserts every pair or none of them; readers never observe a partial batch
    ///
    /// # Errors
    ///
    /// Returns a `Database` error if the batch could not be committed, in which
    /// case nothing from the batch is visible.
    async fn insert_batch(&self, batch: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()>;

    /// Removes a value
    async fn remove(&self, key: &[u8]) -> Result<()>;

    /// All pairs whose key starts with `prefix`, in key order
    async fn scan_prefix(&self, prefix: Vec<u8>) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Increments a big-endian u64 counter and returns the new value bytes
    async fn increment(&self, key: &[u8]) -> Result<Vec<u8>>;
}

/// Smallest key greater than every key starting with `prefix`
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

/// Next value of a big-endian u64 counter
pub(crate) fn next_counter(old: Option<&[u8]>) -> Result<Vec<u8>> {
    let number = match old {
        Some(bytes) => crate::utils::u64_from_bytes(bytes)?,
        None => 0,
    };

    Ok((number + 1).to_be_bytes().to_vec())
}
