// =============================================================================
// Matrixon Sliding Sync Proxy - In-Memory Engine
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Ordered in-process engine. Used by default and by the test suite; data is
//   lost on restart.
//
// =============================================================================

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use tracing::debug;

use super::{next_counter, KeyValueDatabaseEngine, KvTree};
use crate::{Error, Result};

#[derive(Default)]
pub struct Engine {
    trees: RwLock<HashMap<&'static str, Arc<MemoryTree>>>,
}

impl Engine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl KeyValueDatabaseEngine for Engine {
    async fn open_tree(&self, name: &'static str) -> Result<Arc<dyn KvTree>> {
        let mut trees = self
            .trees
            .write()
            .map_err(|_| Error::bad_database("Memory engine lock poisoned."))?;

        let tree = trees.entry(name).or_insert_with(|| {
            debug!("📊 Opened memory tree {}", name);
            Arc::new(MemoryTree::default())
        });

        Ok(tree.clone())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_owned()
    }
}

#[derive(Default)]
pub struct MemoryTree {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryTree {
    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>> {
        self.map
            .read()
            .map_err(|_| Error::bad_database("Memory tree lock poisoned."))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>> {
        self.map
            .write()
            .map_err(|_| Error::bad_database("Memory tree lock poisoned."))
    }
}

#[async_trait]
impl KvTree for MemoryTree {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.get(key).cloned())
    }

    async fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write()?.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn insert_batch(&self, batch: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        // One write guard for the whole batch
        let mut map = self.write()?;
        for (key, value) in batch {
            map.insert(key, value);
        }
        Ok(())
    }

    async fn remove(&self, key: &[u8]) -> Result<()> {
        self.write()?.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: Vec<u8>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .read()?
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn increment(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut map = self.write()?;
        let new = next_counter(map.get(key).map(Vec::as_slice))?;
        map.insert(key.to_vec(), new.clone());
        Ok(new)
    }
}
