// =============================================================================
// Matrixon Sliding Sync Proxy - Sliding Sync Engine
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Answers sliding sync requests from the shared cache. A request with a
//   known position gets the window diff since that position, long-polling
//   when there is nothing new; anything else gets a full resync.
//
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use super::connections::{ConnectionRegistry, Delivered};
use crate::{
    config::SlidingSyncConfig,
    service::{
        accounts::DeviceContext,
        cache::{
            self,
            models::Cursor,
            window::{RoomFilters, Window, WindowDiff, WindowRequest},
        },
    },
    Error, Result,
};

/// Client request body; `pos` and `timeout_ms` may also come from the query string
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SlidingSyncRequest {
    pub session_id: Option<String>,
    pub pos: Option<String>,
    pub window: Window,
    pub filters: RoomFilters,
    pub timeline_limit: Option<u64>,
    pub required_state: Vec<(String, String)>,
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlidingSyncResponse {
    pub pos: String,
    pub session_id: String,
    /// The client must drop its room list and rebuild it from `diff`
    pub full_resync: bool,
    pub count: u64,
    pub diff: WindowDiff,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Wake {
    Change,
    Timeout,
    Interrupted,
}

impl Wake {
    fn as_str(self) -> &'static str {
        match self {
            Wake::Change => "change",
            Wake::Timeout => "timeout",
            Wake::Interrupted => "interrupted",
        }
    }
}

pub struct SlidingSyncService {
    cache: Arc<cache::Service>,
    connections: ConnectionRegistry,
    config: SlidingSyncConfig,
}

impl SlidingSyncService {
    pub fn new(cache: Arc<cache::Service>, config: SlidingSyncConfig) -> Self {
        Self {
            cache,
            connections: ConnectionRegistry::new(config.session_ttl(), config.max_sessions_per_device),
            config,
        }
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Handle one sliding sync request
    #[instrument(level = "debug", skip(self, request), fields(account = %device.account_id))]
    pub async fn handle_request(
        &self,
        device: &DeviceContext,
        request: SlidingSyncRequest,
    ) -> Result<SlidingSyncResponse> {
        let start = Instant::now();
        let window_request = self.window_request(&request)?;
        let timeout = self.config.wait_timeout(request.timeout_ms);
        let account_id = &device.account_id;

        let slot = self
            .connections
            .resolve(device, request.session_id.as_deref())?;
        let generation = slot.begin_request();
        let mut session = slot.state.lock().await;

        self.check_credential(device).await?;

        let since = request.pos.as_deref().and_then(|pos| session.resolve(pos));
        if since.is_none() {
            if let Some(pos) = &request.pos {
                debug!("🔄 Position {} unknown to session {}, resyncing", pos, slot.id);
            }
        }

        let (mut diff, mut cursor, mut since) = self.compute(device, since, &window_request).await?;

        if since.is_some() && diff.is_empty() && !timeout.is_zero() {
            let waiter = self.cache.notify_on_change(account_id, &cursor).await?;

            let wake = tokio::select! {
                _ = waiter.wait() => Wake::Change,
                _ = tokio::time::sleep(timeout) => Wake::Timeout,
                _ = slot.superseded(generation) => Wake::Interrupted,
            };
            metrics::counter!("syncv3_longpoll_wakeups_total", "reason" => wake.as_str()).increment(1);
            debug!("⏰ Long-poll on session {} woke: {:?}", slot.id, wake);

            self.check_credential(device).await?;
            (diff, cursor, since) = self.compute(device, since, &window_request).await?;
        }

        let full_resync = since.is_none();

        session.record(
            since,
            Delivered {
                cursor,
                visible: diff.visible.clone(),
            },
        );

        metrics::counter!("syncv3_requests_total").increment(1);
        info!(
            "✅ Sliding sync for {} at {} ({} entered, {} updated) in {:?}",
            device.device_id,
            cursor,
            diff.rooms_entered.len(),
            diff.rooms_updated.len(),
            start.elapsed()
        );

        Ok(SlidingSyncResponse {
            pos: cursor.to_string(),
            session_id: slot.id.clone(),
            full_resync,
            count: diff.count,
            diff,
        })
    }

    /// Diff since `since`, or the full window when it is gone or absent
    ///
    /// The returned delivery is `None` when the diff is a full resync.
    async fn compute(
        &self,
        device: &DeviceContext,
        since: Option<Delivered>,
        request: &WindowRequest,
    ) -> Result<(WindowDiff, Cursor, Option<Delivered>)> {
        let account_id = &device.account_id;

        if let Some(delivered) = since {
            match self
                .cache
                .snapshot_since(account_id, Some(&delivered.cursor), request, &delivered.visible)
                .await
            {
                Ok((diff, cursor)) => return Ok((diff, cursor, Some(delivered))),
                Err(Error::StaleCursor(reason)) => {
                    debug!("🔄 Resyncing {}: {}", device.device_id, reason);
                }
                Err(e) => return Err(e),
            }
        }

        metrics::counter!("syncv3_full_resyncs_total").increment(1);
        let (diff, cursor) = self.cache.snapshot_since(account_id, None, request, &[]).await?;
        Ok((diff, cursor, None))
    }

    async fn check_credential(&self, device: &DeviceContext) -> Result<()> {
        if self
            .cache
            .snapshot(&device.account_id)
            .await?
            .head
            .credential_invalid
        {
            return Err(Error::ReauthRequired(device.account_id.clone()));
        }
        Ok(())
    }

    fn window_request(&self, request: &SlidingSyncRequest) -> Result<WindowRequest> {
        let mut window = request.window;
        if window.from > window.to {
            return Err(Error::BadRequest(format!(
                "window start {} is after its end {}",
                window.from, window.to
            )));
        }
        if window.len() > self.config.max_window_size {
            window.to = window.from + self.config.max_window_size.saturating_sub(1);
        }

        let timeline_limit = request
            .timeline_limit
            .unwrap_or(self.config.default_timeline_limit)
            .min(self.config.max_timeline_limit);

        Ok(WindowRequest {
            window,
            filters: request.filters.clone(),
            timeline_limit: usize::try_from(timeline_limit).unwrap_or(usize::MAX),
            required_state: request.required_state.clone(),
        })
    }

    /// Drops idle sessions
    pub fn cleanup(&self) -> Result<usize> {
        let start = Instant::now();
        let evicted = self.connections.evict_idle()?;
        if evicted > 0 {
            debug!(
                "🧹 Evicted {} idle sessions, {} remaining, in {:?}",
                evicted,
                self.connections.len(),
                start.elapsed()
            );
        }
        Ok(evicted)
    }

    /// Forgets every session of a logged out device
    pub fn remove_device(&self, device: &DeviceContext) -> Result<usize> {
        self.connections.remove_device(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CacheConfig,
        database::KeyValueDatabase,
        service::cache::models::{Delta, MembershipState, RoomDelta},
    };
    use ruma::{room_id, user_id, OwnedRoomId, RoomId};
    use serde_json::json;
    use std::time::Duration;
    use test_log::test;

    struct Harness {
        cache: Arc<cache::Service>,
        engine: Arc<SlidingSyncService>,
        upstream_since: std::sync::Mutex<Option<String>>,
        batches: std::sync::atomic::AtomicU64,
    }

    fn phone() -> DeviceContext {
        DeviceContext {
            account_id: user_id!("@alice:example.org").to_owned(),
            device_id: "PHONE".into(),
        }
    }

    async fn harness(config: SlidingSyncConfig) -> Harness {
        let db = KeyValueDatabase::in_memory().await.unwrap();
        let cache = Arc::new(cache::Service::new(db, CacheConfig::default()));
        let engine = Arc::new(SlidingSyncService::new(Arc::clone(&cache), config));
        Harness {
            cache,
            engine,
            upstream_since: std::sync::Mutex::new(None),
            batches: Default::default(),
        }
    }

    impl Harness {
        /// One message per room, in the given order, so the last room is the most recent
        async fn messages(&self, rooms: &[&RoomId]) {
            let n = self.batches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let since = self.upstream_since.lock().unwrap().clone();
            let next_batch = format!("b{n}");

            let rooms = rooms
                .iter()
                .enumerate()
                .map(|(i, room_id)| {
                    let mut room = RoomDelta::new((*room_id).to_owned(), MembershipState::Join);
                    room.timeline = vec![json!({
                        "type": "m.room.message",
                        "event_id": format!("${n}_{i}"),
                        "origin_server_ts": n * 100 + i as u64 + 1,
                        "content": { "body": "hi" }
                    })];
                    room
                })
                .collect();

            self.apply(Delta {
                since,
                next_batch,
                rooms,
                direct_rooms: None,
            })
            .await;
        }

        async fn leave(&self, room_id: &RoomId) {
            let n = self.batches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let since = self.upstream_since.lock().unwrap().clone();
            self.apply(Delta {
                since,
                next_batch: format!("b{n}"),
                rooms: vec![RoomDelta::new(room_id.to_owned(), MembershipState::Leave)],
                direct_rooms: None,
            })
            .await;
        }

        async fn apply(&self, delta: Delta) {
            let next = delta.next_batch.clone();
            self.cache.apply_delta(&phone().account_id, &delta).await.unwrap();
            *self.upstream_since.lock().unwrap() = Some(next);
        }
    }

    fn request(pos: Option<&str>, session_id: Option<&str>, to: u64) -> SlidingSyncRequest {
        SlidingSyncRequest {
            session_id: session_id.map(str::to_owned),
            pos: pos.map(str::to_owned),
            window: Window { from: 0, to },
            timeout_ms: Some(50),
            ..SlidingSyncRequest::default()
        }
    }

    fn ids(rooms: &[cache::window::RoomData]) -> Vec<OwnedRoomId> {
        rooms.iter().map(|room| room.room_id.clone()).collect()
    }

    #[test(tokio::test)]
    async fn test_first_request_is_full_resync() {
        let h = harness(SlidingSyncConfig::default()).await;
        h.messages(&[room_id!("!a:example.org"), room_id!("!b:example.org")]).await;

        let response = h.engine.handle_request(&phone(), request(None, None, 9)).await.unwrap();

        assert!(response.full_resync);
        assert_eq!(response.count, 2);
        assert_eq!(
            ids(&response.diff.rooms_entered),
            vec![room_id!("!b:example.org").to_owned(), room_id!("!a:example.org").to_owned()]
        );
        assert!(h.engine.connections().contains(&response.session_id));
    }

    #[test(tokio::test)]
    async fn test_recency_reorder_moves_rooms_across_the_window() {
        let h = harness(SlidingSyncConfig::default()).await;
        let (r1, r2, r3) = (
            room_id!("!r1:example.org"),
            room_id!("!r2:example.org"),
            room_id!("!r3:example.org"),
        );
        h.messages(&[r3, r2, r1]).await;

        let first = h.engine.handle_request(&phone(), request(None, None, 1)).await.unwrap();
        assert_eq!(ids(&first.diff.rooms_entered), vec![r1.to_owned(), r2.to_owned()]);

        h.messages(&[r3]).await;
        let second = h
            .engine
            .handle_request(&phone(), request(Some(&first.pos), Some(&first.session_id), 1))
            .await
            .unwrap();

        assert!(!second.full_resync);
        assert_eq!(ids(&second.diff.rooms_entered), vec![r3.to_owned()]);
        assert_eq!(second.diff.rooms_left, vec![r2.to_owned()]);
        assert!(second.diff.rooms_removed.is_empty());
    }

    #[test(tokio::test)]
    async fn test_left_room_is_removed() {
        let h = harness(SlidingSyncConfig::default()).await;
        let (a, b) = (room_id!("!a:example.org"), room_id!("!b:example.org"));
        h.messages(&[a, b]).await;

        let first = h.engine.handle_request(&phone(), request(None, None, 9)).await.unwrap();
        h.leave(a).await;
        let second = h
            .engine
            .handle_request(&phone(), request(Some(&first.pos), Some(&first.session_id), 9))
            .await
            .unwrap();

        assert_eq!(second.diff.rooms_removed, vec![a.to_owned()]);
        assert_eq!(second.count, 1);
    }

    #[test(tokio::test)]
    async fn test_idle_request_times_out_with_empty_diff() {
        let h = harness(SlidingSyncConfig::default()).await;
        h.messages(&[room_id!("!a:example.org")]).await;

        let first = h.engine.handle_request(&phone(), request(None, None, 9)).await.unwrap();
        let second = h
            .engine
            .handle_request(&phone(), request(Some(&first.pos), Some(&first.session_id), 9))
            .await
            .unwrap();

        assert!(!second.full_resync);
        assert!(second.diff.is_empty());
        assert_eq!(second.pos, first.pos);
    }

    #[test(tokio::test)]
    async fn test_long_poll_wakes_on_commit() {
        let h = harness(SlidingSyncConfig::default()).await;
        let room = room_id!("!a:example.org");
        h.messages(&[room]).await;

        let first = h.engine.handle_request(&phone(), request(None, None, 9)).await.unwrap();

        let engine = Arc::clone(&h.engine);
        let mut waiting = request(Some(&first.pos), Some(&first.session_id), 9);
        waiting.timeout_ms = Some(30_000);
        let started = Instant::now();
        let handle = tokio::spawn(async move { engine.handle_request(&phone(), waiting).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        h.messages(&[room]).await;

        let response = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("long-poll should wake")
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(ids(&response.diff.rooms_updated), vec![room.to_owned()]);
        assert_eq!(response.diff.rooms_updated[0].timeline.len(), 1);
    }

    #[test(tokio::test)]
    async fn test_unknown_position_resyncs() {
        let h = harness(SlidingSyncConfig::default()).await;
        h.messages(&[room_id!("!a:example.org")]).await;

        let first = h.engine.handle_request(&phone(), request(None, None, 9)).await.unwrap();
        let response = h
            .engine
            .handle_request(&phone(), request(Some("1_999"), Some(&first.session_id), 9))
            .await
            .unwrap();

        assert!(response.full_resync);
        assert_eq!(response.diff.rooms_entered.len(), 1);
        assert_eq!(response.pos, first.pos);
    }

    #[test(tokio::test)]
    async fn test_cursor_past_retention_resyncs() {
        let db = KeyValueDatabase::in_memory().await.unwrap();
        let cache = Arc::new(cache::Service::new(
            db,
            CacheConfig {
                cursor_retention: 1,
                ..CacheConfig::default()
            },
        ));
        let h = Harness {
            engine: Arc::new(SlidingSyncService::new(Arc::clone(&cache), SlidingSyncConfig::default())),
            cache,
            upstream_since: std::sync::Mutex::new(None),
            batches: Default::default(),
        };
        let room = room_id!("!a:example.org");
        h.messages(&[room]).await;

        let first = h.engine.handle_request(&phone(), request(None, None, 9)).await.unwrap();
        h.messages(&[room]).await;
        h.messages(&[room]).await;

        let response = h
            .engine
            .handle_request(&phone(), request(Some(&first.pos), Some(&first.session_id), 9))
            .await
            .unwrap();

        assert!(response.full_resync);
        assert_eq!(ids(&response.diff.rooms_entered), vec![room.to_owned()]);
        assert_ne!(response.pos, first.pos);
    }

    #[test(tokio::test)]
    async fn test_retried_request_gets_same_diff() {
        let h = harness(SlidingSyncConfig::default()).await;
        let (a, b) = (room_id!("!a:example.org"), room_id!("!b:example.org"));
        h.messages(&[a]).await;

        let first = h.engine.handle_request(&phone(), request(None, None, 9)).await.unwrap();
        h.messages(&[b]).await;

        let retry = request(Some(&first.pos), Some(&first.session_id), 9);
        let lost = h.engine.handle_request(&phone(), retry.clone()).await.unwrap();
        let again = h.engine.handle_request(&phone(), retry).await.unwrap();

        assert_eq!(ids(&again.diff.rooms_entered), vec![b.to_owned()]);
        assert_eq!(again.diff, lost.diff);
        assert_eq!(again.pos, lost.pos);
        assert!(!again.full_resync);
    }

    #[test(tokio::test)]
    async fn test_flagged_account_requires_reauth() {
        let h = harness(SlidingSyncConfig::default()).await;
        h.messages(&[room_id!("!a:example.org")]).await;
        let first = h.engine.handle_request(&phone(), request(None, None, 9)).await.unwrap();

        let engine = Arc::clone(&h.engine);
        let mut waiting = request(Some(&first.pos), Some(&first.session_id), 9);
        waiting.timeout_ms = Some(30_000);
        let handle = tokio::spawn(async move { engine.handle_request(&phone(), waiting).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        h.cache
            .set_credential_invalid(&phone().account_id, true)
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("waiting request should fail fast")
            .unwrap();
        assert!(matches!(result, Err(Error::ReauthRequired(_))));

        let result = h.engine.handle_request(&phone(), request(None, None, 9)).await;
        assert!(matches!(result, Err(Error::ReauthRequired(_))));
    }

    #[test(tokio::test)]
    async fn test_newer_request_interrupts_long_poll() {
        let h = harness(SlidingSyncConfig::default()).await;
        h.messages(&[room_id!("!a:example.org")]).await;
        let first = h.engine.handle_request(&phone(), request(None, None, 9)).await.unwrap();

        let engine = Arc::clone(&h.engine);
        let mut waiting = request(Some(&first.pos), Some(&first.session_id), 9);
        waiting.timeout_ms = Some(30_000);
        let handle = tokio::spawn(async move { engine.handle_request(&phone(), waiting).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Same position, narrower window
        let narrower = h
            .engine
            .handle_request(&phone(), request(Some(&first.pos), Some(&first.session_id), 0))
            .await
            .unwrap();
        assert!(!narrower.full_resync);

        let interrupted = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("older request should be interrupted")
            .unwrap()
            .unwrap();
        assert!(interrupted.diff.is_empty());
    }

    #[test(tokio::test)]
    async fn test_sessions_keep_independent_windows() {
        let h = harness(SlidingSyncConfig::default()).await;
        let (a, b) = (room_id!("!a:example.org"), room_id!("!b:example.org"));
        h.messages(&[a, b]).await;

        let wide = h.engine.handle_request(&phone(), request(None, None, 9)).await.unwrap();
        let narrow = h.engine.handle_request(&phone(), request(None, None, 0)).await.unwrap();
        assert_ne!(wide.session_id, narrow.session_id);

        h.messages(&[a]).await;

        let wide = h
            .engine
            .handle_request(&phone(), request(Some(&wide.pos), Some(&wide.session_id), 9))
            .await
            .unwrap();
        let narrow = h
            .engine
            .handle_request(&phone(), request(Some(&narrow.pos), Some(&narrow.session_id), 0))
            .await
            .unwrap();

        assert_eq!(ids(&wide.diff.rooms_updated), vec![a.to_owned()]);
        assert!(wide.diff.rooms_entered.is_empty());
        assert_eq!(ids(&narrow.diff.rooms_entered), vec![a.to_owned()]);
        assert_eq!(narrow.diff.rooms_left, vec![b.to_owned()]);
    }

    #[test(tokio::test)]
    async fn test_request_bounds() {
        let h = harness(SlidingSyncConfig {
            max_window_size: 2,
            ..SlidingSyncConfig::default()
        })
        .await;
        h.messages(&[
            room_id!("!a:example.org"),
            room_id!("!b:example.org"),
            room_id!("!c:example.org"),
        ])
        .await;

        let response = h.engine.handle_request(&phone(), request(None, None, 99)).await.unwrap();
        assert_eq!(response.diff.rooms_entered.len(), 2);
        assert_eq!(response.count, 3);

        let backwards = SlidingSyncRequest {
            window: Window { from: 5, to: 1 },
            ..SlidingSyncRequest::default()
        };
        assert!(matches!(
            h.engine.handle_request(&phone(), backwards).await,
            Err(Error::BadRequest(_))
        ));
    }

    #[test(tokio::test)]
    async fn test_unbounded_window_end_is_capped() {
        let h = harness(SlidingSyncConfig {
            max_window_size: 2,
            ..SlidingSyncConfig::default()
        })
        .await;
        h.messages(&[
            room_id!("!a:example.org"),
            room_id!("!b:example.org"),
            room_id!("!c:example.org"),
            room_id!("!d:example.org"),
            room_id!("!e:example.org"),
        ])
        .await;

        let response = h
            .engine
            .handle_request(&phone(), request(None, None, u64::MAX))
            .await
            .unwrap();
        assert_eq!(response.diff.rooms_entered.len(), 2);
        assert_eq!(response.count, 5);
        assert_eq!(Window { from: 0, to: u64::MAX }.len(), u64::MAX);
    }
}
