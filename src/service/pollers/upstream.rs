// =============================================================================
// Matrixon Sliding Sync Proxy - Upstream Client
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Client-server API calls made on behalf of proxied devices: `/sync`
//   long-polls and `/account/whoami`. Responses are normalized into cache
//   deltas and failures into the poller's error classes.
//
// =============================================================================

use std::{collections::BTreeSet, time::Duration};

use async_trait::async_trait;
use reqwest::StatusCode;
use ruma::{
    api::client::sync::sync_events::{
        v3::{GlobalAccountData, RoomAccountData, Rooms},
        UnreadNotificationsCount,
    },
    events::{AnyGlobalAccountDataEvent, AnyRoomAccountDataEvent},
    serde::Raw,
    OwnedDeviceId, OwnedRoomId, OwnedUserId,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::{
    service::cache::models::{Delta, MembershipState, RoomDelta, UnreadCounts},
    Error, Result,
};

/// Extra time granted on top of the long-poll timeout before giving up on a request
const REQUEST_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncRequest {
    pub access_token: String,
    pub since: Option<String>,
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Whoami {
    pub user_id: OwnedUserId,
    #[serde(default)]
    pub device_id: Option<OwnedDeviceId>,
}

/// The homeserver as seen by the proxy
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Resolves the owner of an access token
    async fn whoami(&self, access_token: &str) -> Result<Whoami>;

    /// One long-poll; the returned delta continues from `request.since`
    async fn sync(&self, request: &SyncRequest) -> Result<Delta>;
}

pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUpstream {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("matrixon-sliding-proxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::bad_config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    #[instrument(level = "debug", skip_all)]
    async fn whoami(&self, access_token: &str) -> Result<Whoami> {
        let response = self
            .client
            .get(format!("{}/_matrix/client/v3/account/whoami", self.base_url))
            .bearer_auth(access_token)
            .timeout(REQUEST_GRACE)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(request_error)?;
        check_status(status, &body)?;

        serde_json::from_slice(&body)
            .map_err(|e| Error::UpstreamTruncated(format!("whoami body: {e}")))
    }

    #[instrument(level = "debug", skip_all, fields(since = ?request.since))]
    async fn sync(&self, request: &SyncRequest) -> Result<Delta> {
        let mut query = vec![
            ("timeout", request.timeout.as_millis().to_string()),
            ("set_presence", "offline".to_owned()),
        ];
        if let Some(since) = &request.since {
            query.push(("since", since.clone()));
        }

        let response = self
            .client
            .get(format!("{}/_matrix/client/v3/sync", self.base_url))
            .bearer_auth(&request.access_token)
            .query(&query)
            .timeout(request.timeout + REQUEST_GRACE)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(request_error)?;
        check_status(status, &body)?;

        let delta = parse_sync_response(&body, request.since.clone())?;

        debug!(
            "📥 Upstream sync returned {} rooms, next_batch {}",
            delta.rooms.len(),
            delta.next_batch
        );
        Ok(delta)
    }
}

fn request_error(e: reqwest::Error) -> Error {
    if e.is_body() || e.is_decode() {
        Error::UpstreamTruncated(e.to_string())
    } else {
        Error::transient(e.to_string())
    }
}

/// Classifies a non-success homeserver response
fn check_status(status: StatusCode, body: &[u8]) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }

    let error: Value = serde_json::from_slice(body).unwrap_or_default();
    let errcode = error
        .get("errcode")
        .and_then(Value::as_str)
        .unwrap_or("M_UNKNOWN")
        .to_owned();

    match status {
        StatusCode::UNAUTHORIZED => Err(Error::UpstreamCredentialInvalid(errcode)),
        StatusCode::FORBIDDEN if errcode == "M_UNKNOWN_TOKEN" => {
            Err(Error::UpstreamCredentialInvalid(errcode))
        }
        StatusCode::TOO_MANY_REQUESTS => Err(Error::UpstreamTransient {
            message: format!("rate limited ({errcode})"),
            retry_after: error
                .get("retry_after_ms")
                .and_then(Value::as_u64)
                .map(Duration::from_millis),
        }),
        _ => Err(Error::transient(format!("homeserver returned {status} ({errcode})"))),
    }
}

/// The parts of a `/sync` response body the cache keeps
#[derive(Deserialize)]
struct SyncResponseBody {
    next_batch: Option<String>,
    #[serde(default)]
    rooms: Rooms,
    #[serde(default)]
    account_data: GlobalAccountData,
}

/// Events handed to clients unchanged
fn pass_through<T>(events: &[Raw<T>]) -> Vec<Value> {
    events
        .iter()
        .filter_map(|event| match event.deserialize_as::<Value>() {
            Ok(json) => Some(json),
            Err(e) => {
                warn!("❌ Dropping unreadable upstream event: {}", e);
                None
            }
        })
        .collect()
}

fn unread_counts(unread: &UnreadNotificationsCount) -> Option<UnreadCounts> {
    if unread.notification_count.is_none() && unread.highlight_count.is_none() {
        return None;
    }
    Some(UnreadCounts {
        notification_count: unread.notification_count.map(u64::from).unwrap_or(0),
        highlight_count: unread.highlight_count.map(u64::from).unwrap_or(0),
    })
}

/// Tag names from a room's `m.tag` account data, if the batch carries one
fn room_tags(account_data: &RoomAccountData) -> Option<BTreeSet<String>> {
    let mut tags = None;
    for event in &account_data.events {
        match event.deserialize() {
            Ok(AnyRoomAccountDataEvent::Tag(event)) => {
                tags = Some(
                    event
                        .content
                        .tags
                        .keys()
                        .map(|tag| tag.as_ref().to_owned())
                        .collect(),
                );
            }
            Ok(_) => {}
            Err(e) => debug!("⚠️ Skipping room account data event: {}", e),
        }
    }
    tags
}

/// Rooms named in the account's `m.direct`, if the batch carries one
fn direct_rooms(account_data: &GlobalAccountData) -> Option<BTreeSet<OwnedRoomId>> {
    let mut rooms = None;
    for event in &account_data.events {
        match event.deserialize() {
            Ok(AnyGlobalAccountDataEvent::Direct(event)) => {
                rooms = Some(event.content.values().flatten().cloned().collect());
            }
            Ok(_) => {}
            Err(e) => debug!("⚠️ Skipping account data event: {}", e),
        }
    }
    rooms
}

/// Normalizes a `/sync` response body
pub fn parse_sync_response(body: &[u8], since: Option<String>) -> Result<Delta> {
    let body: SyncResponseBody = serde_json::from_slice(body)
        .map_err(|e| Error::UpstreamTruncated(format!("sync body: {e}")))?;
    let next_batch = body
        .next_batch
        .ok_or_else(|| Error::UpstreamTruncated("response has no next_batch".to_owned()))?;

    let mut rooms = Vec::new();

    for (room_id, joined) in &body.rooms.join {
        let mut room = RoomDelta::new(room_id.clone(), MembershipState::Join);
        room.state = pass_through(&joined.state.events);
        room.timeline = pass_through(&joined.timeline.events);
        room.limited = joined.timeline.limited;
        room.unread = unread_counts(&joined.unread_notifications);
        room.tags = room_tags(&joined.account_data);
        rooms.push(room);
    }

    for (room_id, invited) in &body.rooms.invite {
        let mut room = RoomDelta::new(room_id.clone(), MembershipState::Invite);
        room.state = pass_through(&invited.invite_state.events);
        rooms.push(room);
    }

    for (room_id, knocked) in &body.rooms.knock {
        let mut room = RoomDelta::new(room_id.clone(), MembershipState::Knock);
        room.state = pass_through(&knocked.knock_state.events);
        rooms.push(room);
    }

    for (room_id, left) in &body.rooms.leave {
        let mut room = RoomDelta::new(room_id.clone(), MembershipState::Leave);
        room.state = pass_through(&left.state.events);
        room.timeline = pass_through(&left.timeline.events);
        room.limited = left.timeline.limited;
        room.tags = room_tags(&left.account_data);
        rooms.push(room);
    }

    Ok(Delta {
        since,
        next_batch,
        rooms,
        direct_rooms: direct_rooms(&body.account_data),
    })
}
