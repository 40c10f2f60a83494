// =============================================================================
// Matrixon Sliding Sync Proxy - Database Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Tree layout of the proxy's durable state. Services talk to it through
//   their `Data` traits, implemented in `key_value`.
//
// =============================================================================

pub mod abstraction;
pub mod key_value;

use std::{sync::Arc, time::Instant};

use tracing::info;

use self::abstraction::{KeyValueDatabaseEngine, KvTree};
use crate::{Config, Error, Result};

pub struct KeyValueDatabase {
    db: Arc<dyn KeyValueDatabaseEngine>,

    // Counters
    pub(crate) global: Arc<dyn KvTree>,

    // Shared cache
    pub(crate) userid_shortaccount: Arc<dyn KvTree>,
    /// ShortAccount + 0xff -> AccountHead, ShortAccount + 0xff + RoomId -> RoomState
    pub(crate) shortaccount_partition: Arc<dyn KvTree>,

    // Accounts
    pub(crate) tokenhash_device: Arc<dyn KvTree>,
    /// UserId + 0xff + DeviceId -> TokenHash
    pub(crate) userdeviceid_tokenhash: Arc<dyn KvTree>,
}

impl KeyValueDatabase {
    /// Opens the backend named in the configuration
    pub async fn load_or_create(config: &Config) -> Result<Arc<Self>> {
        let engine: Arc<dyn KeyValueDatabaseEngine> = match config.backend() {
            "memory" => abstraction::memory::Engine::new(),
            #[cfg(feature = "backend_postgresql")]
            "postgresql" => {
                let url = config
                    .database_url
                    .as_deref()
                    .ok_or_else(|| Error::bad_config("database_url is required for postgresql"))?;
                Arc::new(abstraction::postgresql::Engine::open(url).await?)
            }
            other => {
                return Err(Error::bad_config(format!(
                    "Database backend {other} is not available in this build"
                )))
            }
        };

        Self::open_with(engine).await
    }

    /// Lays the trees out on an already opened engine
    pub async fn open_with(engine: Arc<dyn KeyValueDatabaseEngine>) -> Result<Arc<Self>> {
        let start = Instant::now();

        let db = Self {
            global: engine.open_tree("global").await?,
            userid_shortaccount: engine.open_tree("userid_shortaccount").await?,
            shortaccount_partition: engine.open_tree("shortaccount_partition").await?,
            tokenhash_device: engine.open_tree("tokenhash_device").await?,
            userdeviceid_tokenhash: engine.open_tree("userdeviceid_tokenhash").await?,
            db: engine,
        };

        info!(
            "✅ Opened {} database in {:?}",
            db.db.describe(),
            start.elapsed()
        );

        Ok(Arc::new(db))
    }

    /// Fresh in-memory database
    pub async fn in_memory() -> Result<Arc<Self>> {
        Self::open_with(abstraction::memory::Engine::new()).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush().await
    }
}
