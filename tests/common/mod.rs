//! Scripted homeserver and service wiring shared by the integration tests

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use figment::{providers::Serialized, Figment};
use matrixon_sliding_proxy::{
    database::KeyValueDatabase,
    service::{
        cache::models::{Delta, MembershipState, RoomDelta},
        pollers::upstream::{SyncRequest, Upstream, Whoami},
    },
    Config, Error, Result, Services,
};
use ruma::{OwnedDeviceId, RoomId, UserId};
use serde_json::json;
use tokio::sync::Notify;

/// What the next `/sync` answers
pub enum Step {
    Rooms(Vec<RoomDelta>),
    Unavailable,
}

/// A homeserver that answers `/sync` from a queue and otherwise idles
#[derive(Default)]
pub struct ScriptedUpstream {
    tokens: Mutex<HashMap<String, Whoami>>,
    script: Mutex<VecDeque<Step>>,
    pushed: Notify,
    batches: AtomicU64,
    pub syncs: AtomicU64,
}

impl ScriptedUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_token(&self, token: &str, user_id: &UserId, device_id: &str) {
        self.tokens.lock().unwrap().insert(
            token.to_owned(),
            Whoami {
                user_id: user_id.to_owned(),
                device_id: Some(OwnedDeviceId::from(device_id)),
            },
        );
    }

    /// The homeserver forgets the token
    pub fn revoke(&self, token: &str) {
        self.tokens.lock().unwrap().remove(token);
    }

    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
        self.pushed.notify_one();
    }

    /// Queues one message per room; later rooms end up more recent
    pub fn push_messages(&self, rooms: &[&RoomId]) {
        let base = self.batches.load(Ordering::SeqCst) * 100;
        let rooms = rooms
            .iter()
            .enumerate()
            .map(|(i, room_id)| {
                let mut room = RoomDelta::new((*room_id).to_owned(), MembershipState::Join);
                room.timeline = vec![json!({
                    "type": "m.room.message",
                    "event_id": format!("${}_{}", room_id.as_str()[1..].split(':').next().unwrap(), base + i as u64),
                    "sender": "@bob:example.org",
                    "origin_server_ts": base + i as u64 + 1,
                    "content": { "msgtype": "m.text", "body": "hello" }
                })];
                room
            })
            .collect();
        self.push(Step::Rooms(rooms));
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn whoami(&self, access_token: &str) -> Result<Whoami> {
        self.tokens
            .lock()
            .unwrap()
            .get(access_token)
            .cloned()
            .ok_or_else(|| Error::UpstreamCredentialInvalid("M_UNKNOWN_TOKEN".to_owned()))
    }

    async fn sync(&self, request: &SyncRequest) -> Result<Delta> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        if !self.tokens.lock().unwrap().contains_key(&request.access_token) {
            return Err(Error::UpstreamCredentialInvalid("M_UNKNOWN_TOKEN".to_owned()));
        }

        let step = loop {
            if let Some(step) = self.script.lock().unwrap().pop_front() {
                break Some(step);
            }
            if tokio::time::timeout(request.timeout, self.pushed.notified())
                .await
                .is_err()
            {
                break None;
            }
        };

        let rooms = match step {
            Some(Step::Rooms(rooms)) => rooms,
            Some(Step::Unavailable) => return Err(Error::transient("502 Bad Gateway")),
            None => Vec::new(),
        };

        let next_batch = if rooms.is_empty() {
            request.since.clone().unwrap_or_else(|| "s0".to_owned())
        } else {
            format!("s{}", self.batches.fetch_add(1, Ordering::SeqCst) + 1)
        };

        Ok(Delta {
            since: request.since.clone(),
            next_batch,
            rooms,
            direct_rooms: None,
        })
    }
}

pub fn config() -> Config {
    let figment = Figment::new().merge(Serialized::defaults(json!({
        "server": "https://matrix.example.org",
        "secret": "integration-secret",
        "poller": {
            "poll_timeout_ms": 200,
            "backoff_base_ms": 10,
            "backoff_max_ms": 50
        }
    })));
    Config::from_figment(figment).unwrap()
}

pub async fn services(upstream: Arc<ScriptedUpstream>) -> Arc<Services> {
    let db = KeyValueDatabase::in_memory().await.unwrap();
    Services::build(config(), db, upstream).unwrap()
}

/// Polls `condition` until it holds or five seconds pass
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
