use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    str::FromStr,
    sync::Arc,
};

pub use ruma::events::room::member::MembershipState;
use ruma::{OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Opaque position in an account's change stream
///
/// Cursors of one account are totally ordered by `seq`; cursors from
/// different accounts are never comparable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Cursor {
    pub account: u64,
    pub seq: u64,
}

impl Cursor {
    pub fn new(account: u64, seq: u64) -> Self {
        Self { account, seq }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.account, self.seq)
    }
}

impl FromStr for Cursor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (account, seq) = s
            .split_once('_')
            .ok_or_else(|| Error::StaleCursor(format!("malformed position {s:?}")))?;

        match (account.parse(), seq.parse()) {
            (Ok(account), Ok(seq)) => Ok(Self { account, seq }),
            _ => Err(Error::StaleCursor(format!("malformed position {s:?}"))),
        }
    }
}

/// Joined and invited rooms are listed; everything else is gone for the client
pub fn is_active(membership: &MembershipState) -> bool {
    matches!(membership, MembershipState::Join | MembershipState::Invite)
}

/// An event as held by the cache, tagged with the commit that introduced it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Missing for stripped invite state
    pub event_id: Option<String>,
    pub event_type: String,
    pub state_key: Option<String>,
    pub sender: Option<String>,
    pub origin_server_ts: u64,
    pub seq: u64,
    pub json: Value,
}

impl StoredEvent {
    /// `None` when the JSON has no event type
    pub fn from_json(json: Value, seq: u64) -> Option<Self> {
        let event_type = json.get("type")?.as_str()?.to_owned();
        let str_field = |name: &str| json.get(name).and_then(Value::as_str).map(str::to_owned);

        Some(Self {
            event_id: str_field("event_id"),
            state_key: str_field("state_key"),
            sender: str_field("sender"),
            origin_server_ts: json
                .get("origin_server_ts")
                .and_then(Value::as_u64)
                .unwrap_or_default(),
            event_type,
            seq,
            json,
        })
    }

    pub fn content(&self) -> Option<&Value> {
        self.json.get("content")
    }

    pub fn content_str(&self, field: &str) -> Option<&str> {
        self.content()?.get(field)?.as_str()
    }
}

/// Everything the cache knows about one room from one account's point of view
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    pub room_id: OwnedRoomId,
    pub membership: MembershipState,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub topic: Option<String>,
    /// Replacement room from `m.room.tombstone`
    pub tombstone: Option<String>,
    pub is_dm: bool,
    pub is_encrypted: bool,
    pub tags: BTreeSet<String>,
    pub joined_count: u64,
    pub invited_count: u64,
    pub notification_count: u64,
    pub highlight_count: u64,
    /// Timestamp of the latest timeline event
    pub recency: u64,
    /// event type -> state key -> event
    pub state: BTreeMap<String, BTreeMap<String, StoredEvent>>,
    pub timeline: VecDeque<StoredEvent>,
    /// Highest seq of an event dropped from the timeline by retention
    pub trimmed_through: u64,
    /// Commit that last touched this room
    pub changed_at: u64,
}

impl RoomState {
    pub fn new(room_id: OwnedRoomId, membership: MembershipState) -> Self {
        Self {
            room_id,
            membership,
            name: None,
            avatar: None,
            topic: None,
            tombstone: None,
            is_dm: false,
            is_encrypted: false,
            tags: BTreeSet::new(),
            joined_count: 0,
            invited_count: 0,
            notification_count: 0,
            highlight_count: 0,
            recency: 0,
            state: BTreeMap::new(),
            timeline: VecDeque::new(),
            trimmed_through: 0,
            changed_at: 0,
        }
    }

    pub fn state_event(&self, event_type: &str, state_key: &str) -> Option<&StoredEvent> {
        self.state.get(event_type)?.get(state_key)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.room_id.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCounts {
    pub notification_count: u64,
    pub highlight_count: u64,
}

/// One room's slice of an upstream sync response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomDelta {
    pub room_id: OwnedRoomId,
    /// Section of the response the room appeared in
    pub membership: MembershipState,
    #[serde(default)]
    pub state: Vec<Value>,
    #[serde(default)]
    pub timeline: Vec<Value>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default)]
    pub unread: Option<UnreadCounts>,
    #[serde(default)]
    pub tags: Option<BTreeSet<String>>,
}

impl RoomDelta {
    pub fn new(room_id: OwnedRoomId, membership: MembershipState) -> Self {
        Self {
            room_id,
            membership,
            state: Vec::new(),
            timeline: Vec::new(),
            limited: false,
            unread: None,
            tags: None,
        }
    }
}

/// A normalized upstream sync response for one account
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Upstream position the response was requested from
    pub since: Option<String>,
    pub next_batch: String,
    pub rooms: Vec<RoomDelta>,
    /// Replaces the DM room set when present (`m.direct`)
    pub direct_rooms: Option<BTreeSet<OwnedRoomId>>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty() && self.direct_rooms.is_none()
    }
}

/// Durable per-account header, stored next to the account's rooms
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountHead {
    pub account_id: OwnedUserId,
    pub short: u64,
    pub seq: u64,
    /// Upstream position of the last applied delta
    pub since: Option<String>,
    pub credential_invalid: bool,
    #[serde(default)]
    pub direct_rooms: BTreeSet<OwnedRoomId>,
}

impl AccountHead {
    pub fn new(account_id: OwnedUserId, short: u64) -> Self {
        Self {
            account_id,
            short,
            seq: 0,
            since: None,
            credential_invalid: false,
            direct_rooms: BTreeSet::new(),
        }
    }
}

/// Immutable view of an account at one commit; readers hold it through an `Arc`
#[derive(Clone, Debug)]
pub struct AccountSnapshot {
    pub head: AccountHead,
    pub rooms: BTreeMap<OwnedRoomId, Arc<RoomState>>,
    /// Active rooms, most recent first
    pub ordering: Vec<OwnedRoomId>,
}

impl AccountSnapshot {
    pub fn empty(head: AccountHead) -> Self {
        Self {
            head,
            rooms: BTreeMap::new(),
            ordering: Vec::new(),
        }
    }

    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.head.short, self.head.seq)
    }

    /// Checks that `cursor` belongs to this account and is within retention
    pub fn check_cursor(&self, cursor: &Cursor, retention: u64) -> Result<()> {
        if cursor.account != self.head.short {
            return Err(Error::StaleCursor(format!(
                "position {cursor} belongs to another account"
            )));
        }

        if cursor.seq > self.head.seq {
            return Err(Error::StaleCursor(format!(
                "position {cursor} is ahead of the store"
            )));
        }

        if self.head.seq - cursor.seq > retention {
            return Err(Error::StaleCursor(format!(
                "position {cursor} is older than the retention horizon"
            )));
        }

        Ok(())
    }
}
