// =============================================================================
// Matrixon Sliding Sync Proxy - Poller Pool
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   One upstream poller per account. The pool starts workers on demand,
//   restarts them with another device when a token is rejected, and flags
//   the account for re-authentication when no usable device is left.
//
// =============================================================================

pub mod backoff;
pub mod upstream;
mod worker;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use ruma::{OwnedDeviceId, OwnedUserId, UserId};
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

pub use self::worker::StopReason;
use self::{upstream::Upstream, worker::Worker};
use crate::{
    config::PollerConfig,
    service::{accounts, cache},
    Error, Result,
};

/// How long `stop` and `shutdown` wait for a worker to notice
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Idle,
    Polling,
    BackoffWait,
    Stopped,
}

struct WorkerHandle {
    device_id: OwnedDeviceId,
    generation: u64,
    state: watch::Receiver<PollerState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    fn is_running(&self) -> bool {
        !self.task.is_finished() && *self.state.borrow() != PollerState::Stopped
    }
}

struct WorkerExit {
    account_id: OwnedUserId,
    device_id: OwnedDeviceId,
    generation: u64,
    reason: StopReason,
}

pub struct PollerPool {
    workers: Mutex<HashMap<OwnedUserId, WorkerHandle>>,
    exits: mpsc::UnboundedSender<WorkerExit>,
    generation: AtomicU64,
    upstream: Arc<dyn Upstream>,
    cache: Arc<cache::Service>,
    accounts: Arc<accounts::Service>,
    config: PollerConfig,
}

impl PollerPool {
    /// Creates the pool and its supervisor task
    pub fn new(
        upstream: Arc<dyn Upstream>,
        cache: Arc<cache::Service>,
        accounts: Arc<accounts::Service>,
        config: PollerConfig,
    ) -> Arc<Self> {
        let (exits, receiver) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            workers: Mutex::new(HashMap::new()),
            exits,
            generation: AtomicU64::new(0),
            upstream,
            cache,
            accounts,
            config,
        });

        tokio::spawn(Self::supervise(Arc::downgrade(&pool), receiver));
        pool
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<OwnedUserId, WorkerHandle>>> {
        self.workers
            .lock()
            .map_err(|_| Error::bad_database("Poller registry lock poisoned."))
    }

    async fn supervise(pool: Weak<Self>, mut exits: mpsc::UnboundedReceiver<WorkerExit>) {
        while let Some(exit) = exits.recv().await {
            let Some(pool) = pool.upgrade() else {
                break;
            };
            let account_id = exit.account_id.clone();
            if let Err(e) = pool.handle_exit(exit).await {
                error!("❌ Failed to handle poller exit for {}: {}", account_id, e);
            }
        }
        debug!("🧹 Poller supervisor finished");
    }

    async fn handle_exit(&self, exit: WorkerExit) -> Result<()> {
        let current = self
            .lock()?
            .get(&exit.account_id)
            .is_some_and(|handle| handle.generation == exit.generation);
        if !current {
            // Superseded or explicitly stopped
            return Ok(());
        }

        match exit.reason {
            StopReason::Shutdown => {}
            StopReason::StoreConflict => {
                error!(
                    "❌ Poller for {} stopped; its partition needs attention",
                    exit.account_id
                );
            }
            StopReason::CredentialInvalid => {
                self.accounts
                    .expire(&exit.account_id, &exit.device_id)
                    .await?;

                if self.start(&exit.account_id).await? {
                    info!(
                        "🔄 Poller for {} moved off device {}",
                        exit.account_id, exit.device_id
                    );
                } else {
                    self.cache
                        .set_credential_invalid(&exit.account_id, true)
                        .await?;
                }
            }
        }

        self.record_active()?;
        Ok(())
    }

    /// Makes sure a worker polls for the account
    ///
    /// Returns false when the account has no usable credential.
    pub async fn ensure_polling(&self, account_id: &UserId) -> Result<bool> {
        if self
            .lock()?
            .get(account_id)
            .is_some_and(WorkerHandle::is_running)
        {
            return Ok(true);
        }

        self.start(account_id).await
    }

    async fn start(&self, account_id: &UserId) -> Result<bool> {
        let Some(credential) = self.accounts.credential(account_id).await? else {
            return Ok(false);
        };
        self.cache.set_credential_invalid(account_id, false).await?;

        {
            let mut workers = self.lock()?;
            if workers.get(account_id).is_some_and(WorkerHandle::is_running) {
                return Ok(true);
            }

            let generation = self.generation.fetch_add(1, Ordering::Relaxed);
            let (state_tx, state_rx) = watch::channel(PollerState::Idle);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let device_id = credential.device_id.clone();

            let worker = Worker {
                account_id: account_id.to_owned(),
                credential,
                upstream: Arc::clone(&self.upstream),
                cache: Arc::clone(&self.cache),
                config: self.config.clone(),
                state: state_tx,
                shutdown: shutdown_rx,
            };

            let exits = self.exits.clone();
            let exit_account = account_id.to_owned();
            let exit_device = device_id.clone();
            let task = tokio::spawn(async move {
                let reason = worker.run().await;
                let _ = exits.send(WorkerExit {
                    account_id: exit_account,
                    device_id: exit_device,
                    generation,
                    reason,
                });
            });

            workers.insert(
                account_id.to_owned(),
                WorkerHandle {
                    device_id,
                    generation,
                    state: state_rx,
                    shutdown: shutdown_tx,
                    task,
                },
            );
        }

        self.record_active()?;
        Ok(true)
    }

    /// Stops the account's worker and waits for it to finish
    pub async fn stop(&self, account_id: &UserId) -> Result<()> {
        let handle = self.lock()?.remove(account_id);
        if let Some(handle) = handle {
            info!("🛑 Stopping poller for {} ({})", account_id, handle.device_id);
            join(handle).await;
        }
        self.record_active()
    }

    /// Current state of the account's poller; `Idle` when there is none
    pub fn state(&self, account_id: &UserId) -> PollerState {
        self.lock()
            .ok()
            .and_then(|workers| workers.get(account_id).map(|handle| *handle.state.borrow()))
            .unwrap_or(PollerState::Idle)
    }

    /// Whether a live worker polls for the account
    pub fn is_running(&self, account_id: &UserId) -> bool {
        self.lock()
            .map(|workers| workers.get(account_id).is_some_and(WorkerHandle::is_running))
            .unwrap_or(false)
    }

    /// Device the account's poller uses
    pub fn device(&self, account_id: &UserId) -> Option<OwnedDeviceId> {
        self.lock()
            .ok()?
            .get(account_id)
            .map(|handle| handle.device_id.clone())
    }

    /// Resumes polling for every account with stored state
    pub async fn start_known(&self) -> Result<usize> {
        let start = Instant::now();
        let mut started = 0;

        for account_id in self.cache.known_accounts().await? {
            match self.ensure_polling(&account_id).await {
                Ok(true) => started += 1,
                Ok(false) => debug!("⏸️ No usable credential for {}", account_id),
                Err(e) => error!("❌ Failed to start poller for {}: {}", account_id, e),
            }
        }

        info!(
            "✅ Started {} pollers in {:?}",
            started,
            start.elapsed()
        );
        Ok(started)
    }

    /// Stops every worker
    pub async fn shutdown(&self) {
        let handles: Vec<_> = match self.lock() {
            Ok(mut workers) => workers.drain().map(|(_, handle)| handle).collect(),
            Err(e) => {
                error!("❌ Cannot shut pollers down: {}", e);
                return;
            }
        };

        info!("🛑 Shutting down {} pollers", handles.len());
        futures::future::join_all(handles.into_iter().map(join)).await;
    }

    fn record_active(&self) -> Result<()> {
        let active = self
            .lock()?
            .values()
            .filter(|handle| handle.is_running())
            .count();
        metrics::gauge!("syncv3_pollers_active").set(active as f64);
        Ok(())
    }
}

async fn join(handle: WorkerHandle) {
    handle.shutdown.send_replace(true);
    let mut task = handle.task;
    if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
        warn!("⚠️ Poller did not stop within {:?}, aborting", STOP_GRACE);
        task.abort();
    }
}
