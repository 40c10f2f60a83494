//! Device sessions: per-connection cursor and window bookkeeping

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use ruma::OwnedRoomId;
use tokio::{
    sync::{watch, Mutex as AsyncMutex},
    time::Instant,
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    service::{accounts::DeviceContext, cache::models::Cursor},
    Error, Result,
};

/// A cursor handed to the client together with the window it described
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivered {
    pub cursor: Cursor,
    pub visible: Vec<OwnedRoomId>,
}

/// What one session last told its client
#[derive(Debug, Default)]
pub struct DeviceSession {
    delivered: Option<Delivered>,
    /// The delivery before `delivered`, kept so a retried request can be answered again
    previous: Option<Delivered>,
}

impl DeviceSession {
    /// The delivery a client position refers to, if it is still known
    pub fn resolve(&self, pos: &str) -> Option<Delivered> {
        let cursor: Cursor = pos.parse().ok()?;

        [&self.delivered, &self.previous]
            .into_iter()
            .flatten()
            .find(|delivered| delivered.cursor == cursor)
            .cloned()
    }

    pub fn record(&mut self, since: Option<Delivered>, delivered: Delivered) {
        self.previous = since;
        self.delivered = Some(delivered);
    }

    pub fn delivered(&self) -> Option<&Delivered> {
        self.delivered.as_ref()
    }
}

pub struct SessionSlot {
    pub id: String,
    pub owner: DeviceContext,
    pub state: AsyncMutex<DeviceSession>,
    /// Bumped by every request so an older long-poll can step aside
    requests: watch::Sender<u64>,
    last_activity: Mutex<Instant>,
}

impl SessionSlot {
    fn new(owner: DeviceContext) -> Self {
        let (requests, _) = watch::channel(0);
        Self {
            id: Uuid::new_v4().to_string(),
            owner,
            state: AsyncMutex::new(DeviceSession::default()),
            requests,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|_| Instant::now())
    }

    /// Announces a new request, interrupting the one in flight
    ///
    /// Returns the request's generation for [`SessionSlot::superseded`].
    pub fn begin_request(&self) -> u64 {
        self.touch();
        let mut generation = 0;
        self.requests.send_modify(|current| {
            *current += 1;
            generation = *current;
        });
        generation
    }

    /// Resolves once a request newer than `generation` arrived
    pub async fn superseded(&self, generation: u64) {
        let mut receiver = self.requests.subscribe();
        let _ = receiver.wait_for(|current| *current != generation).await;
    }
}

/// Session id to device session map
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
    ttl: Duration,
    max_per_device: usize,
}

impl ConnectionRegistry {
    pub fn new(ttl: Duration, max_per_device: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
            max_per_device: max_per_device.max(1),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<SessionSlot>>>> {
        self.sessions
            .read()
            .map_err(|_| Error::bad_database("Session registry lock poisoned."))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<SessionSlot>>>> {
        self.sessions
            .write()
            .map_err(|_| Error::bad_database("Session registry lock poisoned."))
    }

    /// The caller's session, or a new one
    ///
    /// Unknown, expired and foreign session ids all allocate a fresh session.
    pub fn resolve(&self, owner: &DeviceContext, session_id: Option<&str>) -> Result<Arc<SessionSlot>> {
        if let Some(session_id) = session_id {
            let existing = self.read()?.get(session_id).cloned();
            match existing {
                Some(slot) if slot.owner == *owner && slot.last_activity().elapsed() <= self.ttl => {
                    slot.touch();
                    return Ok(slot);
                }
                Some(_) => debug!("🔄 Session {} not reusable for {:?}", session_id, owner),
                None => debug!("🔄 Unknown session {} for {:?}", session_id, owner),
            }
        }

        let slot = Arc::new(SessionSlot::new(owner.clone()));
        let mut sessions = self.write()?;
        sessions.insert(slot.id.clone(), Arc::clone(&slot));

        let mut owned: Vec<(Instant, String)> = sessions
            .values()
            .filter(|other| other.owner == *owner && other.id != slot.id)
            .map(|other| (other.last_activity(), other.id.clone()))
            .collect();
        if owned.len() >= self.max_per_device {
            owned.sort();
            let excess = owned.len() + 1 - self.max_per_device;
            for (_, id) in owned.into_iter().take(excess) {
                sessions.remove(&id);
                debug!("🧹 Evicted session {} of {:?}", id, owner);
            }
        }

        metrics::gauge!("syncv3_sessions_active").set(sessions.len() as f64);
        debug!("🆕 Session {} for {:?}", slot.id, owner);
        Ok(slot)
    }

    /// Drops sessions idle for longer than the TTL; returns how many went
    pub fn evict_idle(&self) -> Result<usize> {
        let mut sessions = self.write()?;
        let before = sessions.len();

        sessions.retain(|_, slot| {
            // A session with a request in flight is not idle
            slot.last_activity().elapsed() <= self.ttl || slot.state.try_lock().is_err()
        });

        metrics::gauge!("syncv3_sessions_active").set(sessions.len() as f64);
        Ok(before - sessions.len())
    }

    /// Drops every session of a device
    pub fn remove_device(&self, owner: &DeviceContext) -> Result<usize> {
        let mut sessions = self.write()?;
        let before = sessions.len();
        sessions.retain(|_, slot| slot.owner != *owner);

        metrics::gauge!("syncv3_sessions_active").set(sessions.len() as f64);
        Ok(before - sessions.len())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.read()
            .map(|sessions| sessions.contains_key(session_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.read().map(|sessions| sessions.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
