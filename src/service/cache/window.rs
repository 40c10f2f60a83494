//! Windowed views over an account snapshot and the diffs between them

use std::collections::HashSet;

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::models::{is_active, AccountSnapshot, MembershipState, RoomState};

/// Inclusive index range over the filtered, ordered room list
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub from: u64,
    pub to: u64,
}

impl Default for Window {
    fn default() -> Self {
        Self { from: 0, to: 19 }
    }
}

impl Window {
    pub fn len(&self) -> u64 {
        self.to.saturating_sub(self.from).saturating_add(1)
    }
}

/// Room predicates; every set field must match
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomFilters {
    pub is_dm: Option<bool>,
    pub is_encrypted: Option<bool>,
    pub is_invite: Option<bool>,
    /// Case-insensitive substring of the room name
    pub room_name_like: Option<String>,
    /// Room must carry at least one of these tags
    pub tags: Vec<String>,
    /// Room must carry none of these tags
    pub not_tags: Vec<String>,
}

impl RoomFilters {
    pub fn matches(&self, room: &RoomState) -> bool {
        if self.is_dm.is_some_and(|dm| dm != room.is_dm) {
            return false;
        }
        if self.is_encrypted.is_some_and(|enc| enc != room.is_encrypted) {
            return false;
        }
        if self
            .is_invite
            .is_some_and(|invite| invite != (room.membership == MembershipState::Invite))
        {
            return false;
        }
        if let Some(pattern) = &self.room_name_like {
            let name = room.display_name().to_lowercase();
            if !name.contains(&pattern.to_lowercase()) {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|tag| room.tags.contains(tag)) {
            return false;
        }
        !self.not_tags.iter().any(|tag| room.tags.contains(tag))
    }
}

/// What a client subscribes to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowRequest {
    pub window: Window,
    pub filters: RoomFilters,
    pub timeline_limit: usize,
    /// (event type, state key) pairs; `*` matches every state key
    pub required_state: Vec<(String, String)>,
}

/// Room payload sent to clients
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoomData {
    pub room_id: OwnedRoomId,
    pub membership: MembershipState,
    /// True when this is the full room rather than changes since the cursor
    pub initial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tombstone: Option<String>,
    pub is_dm: bool,
    pub is_encrypted: bool,
    pub recency: u64,
    pub joined_count: u64,
    pub invited_count: u64,
    pub notification_count: u64,
    pub highlight_count: u64,
    pub timeline: Vec<Value>,
    pub limited: bool,
    pub required_state: Vec<Value>,
}

/// Changes to a client's visible window between two cursors
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WindowDiff {
    /// Newly visible rooms, with full content, in window order
    pub rooms_entered: Vec<RoomData>,
    /// Previously visible rooms that are still active but fell out of the window
    pub rooms_left: Vec<OwnedRoomId>,
    /// Still-visible rooms with changes since the cursor
    pub rooms_updated: Vec<RoomData>,
    /// Previously visible rooms that are no longer active at all
    pub rooms_removed: Vec<OwnedRoomId>,
    /// Rooms matching the filters, regardless of the window
    pub count: u64,
    /// Room ids inside the window, in order
    #[serde(skip)]
    pub visible: Vec<OwnedRoomId>,
}

impl WindowDiff {
    pub fn is_empty(&self) -> bool {
        self.rooms_entered.is_empty()
            && self.rooms_left.is_empty()
            && self.rooms_updated.is_empty()
            && self.rooms_removed.is_empty()
    }
}

/// Diff of `request` over `snapshot` for a client that last saw `previous` at `since_seq`
///
/// `since_seq == 0` with an empty `previous` yields the full window.
pub fn compute(
    snapshot: &AccountSnapshot,
    since_seq: u64,
    previous: &[OwnedRoomId],
    request: &WindowRequest,
) -> WindowDiff {
    let filtered: Vec<&RoomState> = snapshot
        .ordering
        .iter()
        .filter_map(|room_id| snapshot.rooms.get(room_id))
        .map(|room| &**room)
        .filter(|room| request.filters.matches(room))
        .collect();

    let mut diff = WindowDiff {
        count: filtered.len() as u64,
        ..WindowDiff::default()
    };

    let from = usize::try_from(request.window.from).unwrap_or(usize::MAX);
    let to = usize::try_from(request.window.to).unwrap_or(usize::MAX);
    let visible: &[&RoomState] = if from < filtered.len() {
        &filtered[from..=to.min(filtered.len() - 1)]
    } else {
        &[]
    };

    let previous_set: HashSet<&OwnedRoomId> = previous.iter().collect();
    for room in visible {
        diff.visible.push(room.room_id.clone());

        if !previous_set.contains(&room.room_id) {
            diff.rooms_entered.push(room_data(room, 0, request));
        } else if room.changed_at > since_seq {
            diff.rooms_updated.push(room_data(room, since_seq, request));
        }
    }

    let visible_set: HashSet<&OwnedRoomId> = diff.visible.iter().collect();
    let mut left = Vec::new();
    let mut removed = Vec::new();
    for room_id in previous {
        if visible_set.contains(room_id) {
            continue;
        }
        match snapshot.rooms.get(room_id) {
            Some(room) if is_active(&room.membership) => left.push(room_id.clone()),
            _ => removed.push(room_id.clone()),
        }
    }
    diff.rooms_left = left;
    diff.rooms_removed = removed;

    diff
}

/// Room content after `since_seq`; 0 means the full room
fn room_data(room: &RoomState, since_seq: u64, request: &WindowRequest) -> RoomData {
    let fresh: Vec<_> = room
        .timeline
        .iter()
        .filter(|event| event.seq > since_seq)
        .collect();

    let skip = fresh.len().saturating_sub(request.timeline_limit);
    let limited = skip > 0 || room.trimmed_through > since_seq;

    let mut required_state = Vec::new();
    for (event_type, state_key) in &request.required_state {
        let Some(events) = room.state.get(event_type) else {
            continue;
        };
        let matching = events
            .iter()
            .filter(|(key, _)| state_key == "*" || *key == state_key)
            .map(|(_, event)| event)
            .filter(|event| event.seq > since_seq);
        required_state.extend(matching.map(|event| event.json.clone()));
    }

    RoomData {
        room_id: room.room_id.clone(),
        membership: room.membership.clone(),
        initial: since_seq == 0,
        name: room.name.clone(),
        avatar: room.avatar.clone(),
        topic: room.topic.clone(),
        tombstone: room.tombstone.clone(),
        is_dm: room.is_dm,
        is_encrypted: room.is_encrypted,
        recency: room.recency,
        joined_count: room.joined_count,
        invited_count: room.invited_count,
        notification_count: room.notification_count,
        highlight_count: room.highlight_count,
        timeline: fresh[skip..].iter().map(|event| event.json.clone()).collect(),
        limited,
        required_state,
    }
}
