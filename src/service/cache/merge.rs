//! Folding upstream deltas into immutable account snapshots

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use ruma::OwnedRoomId;

use super::models::{
    is_active, AccountSnapshot, Delta, MembershipState, RoomDelta, RoomState, StoredEvent,
};
use crate::config::CacheConfig;

/// Result of folding one delta
pub(super) struct MergeOutcome {
    pub snapshot: AccountSnapshot,
    /// Rooms written by this commit, already stamped with the new seq
    pub changed: Vec<Arc<RoomState>>,
}

/// Builds the snapshot that follows `current` once `delta` is applied
///
/// The seq only advances when at least one room changed, so an empty upstream
/// response moves the upstream position without waking any client.
pub(super) fn merge(current: &AccountSnapshot, delta: &Delta, config: &CacheConfig) -> MergeOutcome {
    let next_seq = current.head.seq + 1;
    let mut head = current.head.clone();
    head.since = Some(delta.next_batch.clone());

    let mut changed: BTreeMap<OwnedRoomId, RoomState> = BTreeMap::new();

    if let Some(direct) = &delta.direct_rooms {
        if *direct != head.direct_rooms {
            for (room_id, room) in &current.rooms {
                let is_dm = direct.contains(room_id);
                if room.is_dm != is_dm {
                    let mut room = (**room).clone();
                    room.is_dm = is_dm;
                    changed.insert(room_id.clone(), room);
                }
            }
            head.direct_rooms = direct.clone();
        }
    }

    for room_delta in &delta.rooms {
        let room_id = &room_delta.room_id;
        let (mut room, mut touched) = match changed.remove(room_id) {
            Some(room) => (room, true),
            None => match current.rooms.get(room_id) {
                Some(room) => ((**room).clone(), false),
                None => {
                    let mut room = RoomState::new(room_id.clone(), room_delta.membership.clone());
                    room.is_dm = head.direct_rooms.contains(room_id);
                    (room, true)
                }
            },
        };

        touched |= apply_room_delta(&mut room, room_delta, next_seq, config.timeline_retention);
        if touched {
            changed.insert(room_id.clone(), room);
        }
    }

    if changed.is_empty() {
        let mut snapshot = current.clone();
        snapshot.head = head;
        return MergeOutcome {
            snapshot,
            changed: Vec::new(),
        };
    }

    head.seq = next_seq;
    let mut rooms = current.rooms.clone();
    let mut written = Vec::with_capacity(changed.len());
    for (room_id, mut room) in changed {
        room.changed_at = next_seq;
        let room = Arc::new(room);
        rooms.insert(room_id, Arc::clone(&room));
        written.push(room);
    }

    let ordering = order_rooms(&rooms, config.recency_bucket_ms);
    MergeOutcome {
        snapshot: AccountSnapshot {
            head,
            rooms,
            ordering,
        },
        changed: written,
    }
}

/// Active rooms by recency (bucketed), most recent first, ties by room id
pub(super) fn order_rooms(
    rooms: &BTreeMap<OwnedRoomId, Arc<RoomState>>,
    recency_bucket_ms: u64,
) -> Vec<OwnedRoomId> {
    let bucket = |recency: u64| {
        if recency_bucket_ms == 0 {
            recency
        } else {
            recency / recency_bucket_ms
        }
    };

    let mut active: Vec<&RoomState> = rooms
        .values()
        .filter(|room| is_active(&room.membership))
        .map(|room| &**room)
        .collect();

    active.sort_by(|a, b| {
        bucket(b.recency)
            .cmp(&bucket(a.recency))
            .then_with(|| a.room_id.cmp(&b.room_id))
    });

    active.into_iter().map(|room| room.room_id.clone()).collect()
}

fn apply_room_delta(room: &mut RoomState, delta: &RoomDelta, seq: u64, retention: usize) -> bool {
    let mut touched = false;

    for json in &delta.state {
        if let Some(event) = StoredEvent::from_json(json.clone(), seq) {
            touched |= apply_state(room, event);
        }
    }

    let mut known: HashSet<String> = room
        .timeline
        .iter()
        .filter_map(|event| event.event_id.clone())
        .collect();

    let mut appended = false;
    for json in &delta.timeline {
        let Some(event) = StoredEvent::from_json(json.clone(), seq) else {
            continue;
        };
        let Some(event_id) = event.event_id.clone() else {
            continue;
        };
        if !known.insert(event_id) {
            continue;
        }

        if event.state_key.is_some() {
            apply_state(room, event.clone());
        }
        room.recency = room.recency.max(event.origin_server_ts);
        room.timeline.push_back(event);
        appended = true;
    }

    if appended && delta.limited {
        // Clients behind this commit missed the events upstream skipped
        room.trimmed_through = room.trimmed_through.max(seq);
    }
    touched |= appended;

    while room.timeline.len() > retention {
        if let Some(dropped) = room.timeline.pop_front() {
            room.trimmed_through = room.trimmed_through.max(dropped.seq);
        }
    }

    if let Some(unread) = delta.unread {
        if room.notification_count != unread.notification_count
            || room.highlight_count != unread.highlight_count
        {
            room.notification_count = unread.notification_count;
            room.highlight_count = unread.highlight_count;
            touched = true;
        }
    }

    if let Some(tags) = &delta.tags {
        if room.tags != *tags {
            room.tags = tags.clone();
            touched = true;
        }
    }

    // The response section is authoritative over member events replayed above
    if room.membership != delta.membership {
        room.membership = delta.membership.clone();
        touched = true;
    }

    touched
}

/// Applies one state event; false when it was already known
fn apply_state(room: &mut RoomState, event: StoredEvent) -> bool {
    let Some(state_key) = event.state_key.clone() else {
        return false;
    };

    if let Some(old) = room.state_event(&event.event_type, &state_key) {
        if old.event_id.is_some() && old.event_id == event.event_id {
            return false;
        }
        if old.event_id.is_none() && old.json == event.json {
            return false;
        }
    }

    let non_empty = |value: Option<&str>| value.filter(|v| !v.is_empty()).map(str::to_owned);
    match event.event_type.as_str() {
        "m.room.name" => room.name = non_empty(event.content_str("name")),
        "m.room.avatar" => room.avatar = non_empty(event.content_str("url")),
        "m.room.topic" => room.topic = non_empty(event.content_str("topic")),
        "m.room.tombstone" => room.tombstone = non_empty(event.content_str("replacement_room")),
        "m.room.encryption" => room.is_encrypted = true,
        _ => {}
    }

    let is_member = event.event_type == "m.room.member";
    room.state
        .entry(event.event_type.clone())
        .or_default()
        .insert(state_key, event);

    if is_member {
        let count = |wanted: MembershipState| {
            room.state.get("m.room.member").map_or(0, |members| {
                members
                    .values()
                    .filter_map(|member| member.content_str("membership"))
                    .filter(|membership| MembershipState::from(*membership) == wanted)
                    .count() as u64
            })
        };
        room.joined_count = count(MembershipState::Join);
        room.invited_count = count(MembershipState::Invite);
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::cache::models::{AccountHead, UnreadCounts};
    use ruma::{room_id, user_id};
    use serde_json::json;

    fn empty() -> AccountSnapshot {
        AccountSnapshot::empty(AccountHead::new(user_id!("@alice:example.org").to_owned(), 1))
    }

    fn message(id: &str, ts: u64) -> serde_json::Value {
        json!({
            "type": "m.room.message",
            "event_id": id,
            "sender": "@bob:example.org",
            "origin_server_ts": ts,
            "content": { "body": id }
        })
    }

    fn delta(next_batch: &str, rooms: Vec<RoomDelta>) -> Delta {
        Delta {
            since: None,
            next_batch: next_batch.to_owned(),
            rooms,
            direct_rooms: None,
        }
    }

    #[test]
    fn test_timeline_is_deduplicated_by_event_id() {
        let config = CacheConfig::default();
        let mut room = RoomDelta::new(room_id!("!a:example.org").to_owned(), MembershipState::Join);
        room.timeline = vec![message("$1", 10), message("$2", 20)];

        let first = merge(&empty(), &delta("s1", vec![room.clone()]), &config).snapshot;
        let second = merge(&first, &delta("s2", vec![room]), &config);

        assert!(second.changed.is_empty(), "Replayed events must not create a commit");
        assert_eq!(second.snapshot.head.seq, first.head.seq);
        assert_eq!(second.snapshot.head.since.as_deref(), Some("s2"));
        assert_eq!(first.rooms[room_id!("!a:example.org")].timeline.len(), 2);
    }

    #[test]
    fn test_retention_marks_trimmed_events() {
        let config = CacheConfig {
            timeline_retention: 2,
            ..CacheConfig::default()
        };
        let mut room = RoomDelta::new(room_id!("!a:example.org").to_owned(), MembershipState::Join);
        room.timeline = vec![message("$1", 1), message("$2", 2), message("$3", 3)];

        let snapshot = merge(&empty(), &delta("s1", vec![room]), &config).snapshot;
        let room = &snapshot.rooms[room_id!("!a:example.org")];

        assert_eq!(room.timeline.len(), 2);
        assert_eq!(room.trimmed_through, 1);
        assert_eq!(room.recency, 3);
    }

    #[test]
    fn test_state_updates_room_metadata() {
        let config = CacheConfig::default();
        let mut room = RoomDelta::new(room_id!("!a:example.org").to_owned(), MembershipState::Join);
        room.state = vec![
            json!({"type": "m.room.name", "state_key": "", "event_id": "$n", "content": {"name": "Lobby"}}),
            json!({"type": "m.room.encryption", "state_key": "", "event_id": "$e", "content": {}}),
            json!({"type": "m.room.member", "state_key": "@bob:example.org", "event_id": "$m1", "content": {"membership": "join"}}),
            json!({"type": "m.room.member", "state_key": "@carol:example.org", "event_id": "$m2", "content": {"membership": "invite"}}),
        ];
        room.unread = Some(UnreadCounts {
            notification_count: 3,
            highlight_count: 1,
        });

        let snapshot = merge(&empty(), &delta("s1", vec![room]), &config).snapshot;
        let room = &snapshot.rooms[room_id!("!a:example.org")];

        assert_eq!(room.name.as_deref(), Some("Lobby"));
        assert!(room.is_encrypted);
        assert_eq!((room.joined_count, room.invited_count), (1, 1));
        assert_eq!(room.notification_count, 3);
    }

    #[test]
    fn test_left_rooms_leave_the_ordering() {
        let config = CacheConfig::default();
        let a = room_id!("!a:example.org").to_owned();
        let b = room_id!("!b:example.org").to_owned();

        let mut join_a = RoomDelta::new(a.clone(), MembershipState::Join);
        join_a.timeline = vec![message("$1", 10)];
        let mut join_b = RoomDelta::new(b.clone(), MembershipState::Join);
        join_b.timeline = vec![message("$2", 20)];

        let snapshot = merge(&empty(), &delta("s1", vec![join_a, join_b]), &config).snapshot;
        assert_eq!(snapshot.ordering, vec![b.clone(), a.clone()]);

        let leave = merge(&snapshot, &delta("s2", vec![RoomDelta::new(b, MembershipState::Leave)]), &config);
        assert_eq!(leave.snapshot.ordering, vec![a]);
        assert_eq!(leave.snapshot.head.seq, snapshot.head.seq + 1);
    }

    #[test]
    fn test_ordering_ties_break_by_room_id() {
        let config = CacheConfig {
            recency_bucket_ms: 1000,
            ..CacheConfig::default()
        };
        let mut late = RoomDelta::new(room_id!("!z:example.org").to_owned(), MembershipState::Join);
        late.timeline = vec![message("$1", 1_900)];
        let mut early = RoomDelta::new(room_id!("!a:example.org").to_owned(), MembershipState::Join);
        early.timeline = vec![message("$2", 1_100)];

        let snapshot = merge(&empty(), &delta("s1", vec![late, early]), &config).snapshot;
        assert_eq!(snapshot.ordering[0], room_id!("!a:example.org"));
    }

    #[test]
    fn test_direct_rooms_flip_dm_flag() {
        let config = CacheConfig::default();
        let a = room_id!("!a:example.org").to_owned();

        let snapshot = merge(&empty(), &delta("s1", vec![RoomDelta::new(a.clone(), MembershipState::Join)]), &config)
            .snapshot;
        assert!(!snapshot.rooms[&a].is_dm);

        let mut update = delta("s2", Vec::new());
        update.direct_rooms = Some([a.clone()].into_iter().collect());
        let outcome = merge(&snapshot, &update, &config);

        assert_eq!(outcome.changed.len(), 1);
        assert!(outcome.snapshot.rooms[&a].is_dm);
        assert_eq!(outcome.snapshot.rooms[&a].changed_at, outcome.snapshot.head.seq);
    }
}
