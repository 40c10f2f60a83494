// =============================================================================
// Matrixon Sliding Sync Proxy - Shared Cache Service
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Per-account partitions of upstream state. Pollers write deltas, clients
//   read immutable snapshots and wait for the next commit.
//
// =============================================================================

mod data;
pub mod merge;
pub mod models;
pub mod window;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Instant,
};

pub use data::Data;
use ruma::{OwnedRoomId, OwnedUserId, UserId};
use tokio::sync::{watch, Mutex, OnceCell};
use tracing::{debug, error, info, instrument, warn};

use self::{
    models::{AccountHead, AccountSnapshot, Cursor, Delta},
    window::{WindowDiff, WindowRequest},
};
use crate::{config::CacheConfig, Error, Result};

/// What a waiting client compares against
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Version {
    seq: u64,
    credential_invalid: bool,
}

struct Partition {
    snapshot: RwLock<Arc<AccountSnapshot>>,
    /// Serializes commits for this account
    writer: Mutex<()>,
    version: watch::Sender<Version>,
}

impl Partition {
    fn new(snapshot: AccountSnapshot) -> Self {
        let (version, _) = watch::channel(Version {
            seq: snapshot.head.seq,
            credential_invalid: snapshot.head.credential_invalid,
        });

        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
            version,
        }
    }

    fn load(&self) -> Result<Arc<AccountSnapshot>> {
        self.snapshot
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| Error::bad_database("Partition lock poisoned."))
    }

    fn publish(&self, snapshot: AccountSnapshot) -> Result<Arc<AccountSnapshot>> {
        let version = Version {
            seq: snapshot.head.seq,
            credential_invalid: snapshot.head.credential_invalid,
        };
        let snapshot = Arc::new(snapshot);

        *self
            .snapshot
            .write()
            .map_err(|_| Error::bad_database("Partition lock poisoned."))? = Arc::clone(&snapshot);

        // Raised after the swap so woken readers see the new snapshot
        self.version.send_if_modified(|current| {
            let modified = *current != version;
            *current = version;
            modified
        });

        Ok(snapshot)
    }
}

/// Resolves once the account moves past a cursor or needs re-authentication
pub struct ChangeWaiter {
    receiver: watch::Receiver<Version>,
    after_seq: u64,
}

impl ChangeWaiter {
    fn ready(&self, version: Version) -> bool {
        version.seq > self.after_seq || version.credential_invalid
    }

    /// Whether a change already happened
    pub fn is_ready(&self) -> bool {
        let version = *self.receiver.borrow();
        self.ready(version)
    }

    /// Waits for the change; dropping the future cancels the wait
    pub async fn wait(mut self) {
        loop {
            let version = *self.receiver.borrow_and_update();
            if self.ready(version) {
                return;
            }
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct Service {
    db: Arc<dyn Data>,
    config: CacheConfig,
    /// Each account is read from the store once; first loads of different accounts run in parallel
    partitions: RwLock<HashMap<OwnedUserId, Arc<OnceCell<Arc<Partition>>>>>,
}

impl Service {
    pub fn new(db: Arc<dyn Data>, config: CacheConfig) -> Self {
        Self {
            db,
            config,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    fn cell(&self, account_id: &UserId) -> Result<Arc<OnceCell<Arc<Partition>>>> {
        if let Some(cell) = self
            .partitions
            .read()
            .map_err(|_| Error::bad_database("Partition map lock poisoned."))?
            .get(account_id)
        {
            return Ok(Arc::clone(cell));
        }

        let mut partitions = self
            .partitions
            .write()
            .map_err(|_| Error::bad_database("Partition map lock poisoned."))?;
        Ok(Arc::clone(partitions.entry(account_id.to_owned()).or_default()))
    }

    async fn partition(&self, account_id: &UserId) -> Result<Arc<Partition>> {
        let cell = self.cell(account_id)?;
        cell.get_or_try_init(|| self.load_partition(account_id))
            .await
            .cloned()
    }

    async fn load_partition(&self, account_id: &UserId) -> Result<Arc<Partition>> {
        let start = Instant::now();
        let short = self.db.short_account_id(account_id).await?;
        let snapshot = match self.db.load_partition(short).await? {
            Some((head, rooms)) => {
                let rooms = rooms
                    .into_iter()
                    .map(|room| (room.room_id.clone(), Arc::new(room)))
                    .collect();
                let ordering = merge::order_rooms(&rooms, self.config.recency_bucket_ms);
                AccountSnapshot {
                    head,
                    rooms,
                    ordering,
                }
            }
            None => AccountSnapshot::empty(AccountHead::new(account_id.to_owned(), short)),
        };

        debug!(
            "📊 Loaded partition for {} at seq {} ({} rooms) in {:?}",
            account_id,
            snapshot.head.seq,
            snapshot.rooms.len(),
            start.elapsed()
        );

        Ok(Arc::new(Partition::new(snapshot)))
    }

    /// Drops in-memory partitions nobody is using; returns how many went
    ///
    /// A partition stays while `keep` holds for its account, while a client
    /// waits on it, or while a reader or writer holds it. Evicted accounts
    /// are reloaded from the store on next use.
    pub fn evict_unused(&self, keep: impl Fn(&UserId) -> bool) -> Result<usize> {
        let mut partitions = self
            .partitions
            .write()
            .map_err(|_| Error::bad_database("Partition map lock poisoned."))?;
        let before = partitions.len();

        partitions.retain(|account_id, cell| {
            if keep(account_id) || Arc::strong_count(cell) > 1 {
                return true;
            }
            cell.get().is_some_and(|partition| {
                Arc::strong_count(partition) > 1 || partition.version.receiver_count() > 0
            })
        });

        let evicted = before - partitions.len();
        metrics::gauge!("syncv3_cache_partitions").set(partitions.len() as f64);
        if evicted > 0 {
            debug!("🧹 Evicted {} idle partitions", evicted);
        }
        Ok(evicted)
    }

    /// Current immutable snapshot of an account
    pub async fn snapshot(&self, account_id: &UserId) -> Result<Arc<AccountSnapshot>> {
        self.partition(account_id).await?.load()
    }

    /// Head cursor of an account
    pub async fn cursor(&self, account_id: &UserId) -> Result<Cursor> {
        Ok(self.snapshot(account_id).await?.cursor())
    }

    /// Upstream position a poller should resume from
    pub async fn upstream_since(&self, account_id: &UserId) -> Result<Option<String>> {
        Ok(self.snapshot(account_id).await?.head.since.clone())
    }

    /// Applies one upstream delta atomically and returns the resulting cursor
    ///
    /// Re-applying the delta whose `next_batch` is already stored is a no-op.
    /// A delta that does not continue from the stored upstream position is a
    /// `StoreConflict`.
    #[instrument(level = "debug", skip(self, delta), fields(next_batch = %delta.next_batch))]
    pub async fn apply_delta(&self, account_id: &UserId, delta: &Delta) -> Result<Cursor> {
        let start = Instant::now();
        let partition = self.partition(account_id).await?;
        let _writer = partition.writer.lock().await;
        let current = partition.load()?;

        if current.head.since.as_deref() == Some(delta.next_batch.as_str()) {
            debug!("🔄 Delta {} already applied for {}", delta.next_batch, account_id);
            return Ok(current.cursor());
        }

        if delta.since != current.head.since {
            warn!(
                "❌ Out of order delta for {}: stored {:?}, delta continues from {:?}",
                account_id, current.head.since, delta.since
            );
            return Err(Error::StoreConflict(format!(
                "delta continues from {:?} but {} is at {:?}",
                delta.since, account_id, current.head.since
            )));
        }

        let outcome = merge::merge(&current, delta, &self.config);
        self.db.commit(&outcome.snapshot.head, &outcome.changed).await?;
        let snapshot = partition.publish(outcome.snapshot)?;

        metrics::counter!("syncv3_cache_deltas_applied_total").increment(1);
        debug!(
            "✅ Applied delta for {}: {} rooms changed, seq {} in {:?}",
            account_id,
            outcome.changed.len(),
            snapshot.head.seq,
            start.elapsed()
        );

        Ok(snapshot.cursor())
    }

    /// Window diff since `since` (or the full window when `None`) against the current snapshot
    ///
    /// `previous` is the window the client saw at `since`. Fails with
    /// `StaleCursor` when `since` cannot be diffed against.
    pub async fn snapshot_since(
        &self,
        account_id: &UserId,
        since: Option<&Cursor>,
        request: &WindowRequest,
        previous: &[OwnedRoomId],
    ) -> Result<(WindowDiff, Cursor)> {
        let snapshot = self.snapshot(account_id).await?;

        let since_seq = match since {
            Some(cursor) => {
                snapshot.check_cursor(cursor, self.config.cursor_retention)?;
                cursor.seq
            }
            None => 0,
        };
        let previous = if since.is_some() { previous } else { &[] };

        let diff = window::compute(&snapshot, since_seq, previous, request);
        Ok((diff, snapshot.cursor()))
    }

    /// Registers interest in the next change after `after`
    ///
    /// The waiter is ready at once when the account already moved on or is
    /// already flagged, so a change racing with the caller's computation is
    /// never missed.
    pub async fn notify_on_change(&self, account_id: &UserId, after: &Cursor) -> Result<ChangeWaiter> {
        let partition = self.partition(account_id).await?;

        Ok(ChangeWaiter {
            receiver: partition.version.subscribe(),
            after_seq: after.seq,
        })
    }

    /// Flags or clears the account's need for re-authentication
    ///
    /// Raising the flag wakes every waiting client of the account.
    pub async fn set_credential_invalid(&self, account_id: &UserId, invalid: bool) -> Result<()> {
        let partition = self.partition(account_id).await?;
        let _writer = partition.writer.lock().await;
        let current = partition.load()?;

        if current.head.credential_invalid == invalid {
            return Ok(());
        }

        let mut snapshot = (*current).clone();
        snapshot.head.credential_invalid = invalid;
        self.db.commit(&snapshot.head, &[]).await?;
        partition.publish(snapshot)?;

        if invalid {
            warn!("🔐 {} must re-authenticate", account_id);
        } else {
            info!("🔐 {} has a usable credential again", account_id);
        }

        Ok(())
    }

    /// Accounts with stored state, for restarting pollers after a restart
    pub async fn known_accounts(&self) -> Result<Vec<OwnedUserId>> {
        self.db.known_accounts().await.map_err(|e| {
            error!("❌ Failed to list known accounts: {}", e);
            e
        })
    }

    /// Number of partitions currently in memory
    pub fn partition_count(&self) -> usize {
        self.partitions.read().map(|map| map.len()).unwrap_or_default()
    }
}
