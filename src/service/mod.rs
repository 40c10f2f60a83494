// =============================================================================
// Matrixon Sliding Sync Proxy - Service Container
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Wires the shared cache, accounts, poller pool and sliding sync engine
//   together and owns their background tasks.
//
// =============================================================================

pub mod accounts;
pub mod cache;
pub mod pollers;
pub mod sync;

use std::{sync::Arc, time::Instant};

use matrixon_vault::TokenVault;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use self::{
    accounts::DeviceContext,
    pollers::{upstream::Upstream, PollerPool},
    sync::{SlidingSyncRequest, SlidingSyncResponse, SlidingSyncService},
};
use crate::{database::KeyValueDatabase, Config, Error, Result};

/// Central service container
pub struct Services {
    pub config: Config,
    db: Arc<KeyValueDatabase>,
    pub cache: Arc<cache::Service>,
    pub accounts: Arc<accounts::Service>,
    pub pollers: Arc<PollerPool>,
    pub sliding_sync: Arc<SlidingSyncService>,
}

impl Services {
    /// Build every service on top of an opened database
    #[instrument(level = "info", skip_all)]
    pub fn build(
        config: Config,
        db: Arc<KeyValueDatabase>,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Arc<Self>> {
        let start = Instant::now();
        info!("🚀 Initializing sliding sync proxy services");

        let vault = TokenVault::new(&config.secret).map_err(|e| {
            error!("❌ Failed to build token vault: {}", e);
            Error::from(e)
        })?;

        let cache = Arc::new(cache::Service::new(db.clone(), config.cache.clone()));
        debug!("✅ Shared cache initialized");

        let accounts = Arc::new(accounts::Service::new(db.clone(), vault, Arc::clone(&upstream)));
        debug!("✅ Accounts service initialized");

        let pollers = PollerPool::new(
            upstream,
            Arc::clone(&cache),
            Arc::clone(&accounts),
            config.poller.clone(),
        );
        debug!("✅ Poller pool initialized");

        let sliding_sync = Arc::new(SlidingSyncService::new(
            Arc::clone(&cache),
            config.sliding_sync.clone(),
        ));
        debug!("✅ Sliding sync engine initialized");

        info!("✅ Services initialized in {:?}", start.elapsed());
        Ok(Arc::new(Self {
            config,
            db,
            cache,
            accounts,
            pollers,
            sliding_sync,
        }))
    }

    /// Resolves a client token and makes sure its account is being polled
    pub async fn authenticate(&self, access_token: &str) -> Result<DeviceContext> {
        let (device, fresh) = self.accounts.authenticate(access_token).await?;

        if !self.pollers.ensure_polling(&device.account_id).await? {
            return Err(Error::ReauthRequired(device.account_id));
        }
        if fresh {
            info!("🔄 Polling {} for new device {}", device.account_id, device.device_id);
        }

        Ok(device)
    }

    /// Authenticates and answers one sliding sync request
    pub async fn sliding_sync(
        &self,
        access_token: &str,
        request: SlidingSyncRequest,
    ) -> Result<SlidingSyncResponse> {
        let device = self.authenticate(access_token).await?;
        self.sliding_sync.handle_request(&device, request).await
    }

    /// Forgets a device; the account's poller stops with its last device
    pub async fn logout(&self, access_token: &str) -> Result<()> {
        let Some(device) = self.accounts.logout(access_token).await? else {
            return Err(Error::UnknownToken);
        };

        let sessions = self.sliding_sync.remove_device(&device)?;
        debug!("🧹 Dropped {} sessions of {:?}", sessions, device);

        if !self.accounts.has_live_devices(&device.account_id).await? {
            self.pollers.stop(&device.account_id).await?;
        }
        Ok(())
    }

    /// Drops idle sessions, then the cached partitions of accounts nobody polls or reads
    pub fn cleanup(&self) -> Result<(usize, usize)> {
        let sessions = self.sliding_sync.cleanup()?;
        let partitions = self
            .cache
            .evict_unused(|account_id| self.pollers.is_running(account_id))?;
        Ok((sessions, partitions))
    }

    /// Periodically runs [`Services::cleanup`]
    pub fn spawn_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let services = Arc::downgrade(self);
        let interval = self.config.sliding_sync.cleanup_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(services) = services.upgrade() else {
                    break;
                };
                if let Err(e) = services.cleanup() {
                    error!("❌ Cleanup failed: {}", e);
                }
            }
        })
    }

    /// Stops the pollers and flushes the store
    pub async fn shutdown(&self) {
        let start = Instant::now();
        info!("🛑 Shutting down sliding sync proxy");

        self.pollers.shutdown().await;
        if let Err(e) = self.db.flush().await {
            error!("❌ Failed to flush database: {}", e);
        }

        info!("✅ Shutdown completed in {:?}", start.elapsed());
    }
}
