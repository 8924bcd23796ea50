// Copyright 2026 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Minimal views over the room and to-device events the service reacts to.

use ruma::{EventEncryptionAlgorithm, OwnedEventId, OwnedRoomId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `m.room.encryption` state event type.
pub const ROOM_ENCRYPTION: &str = "m.room.encryption";
/// The `m.room.member` state event type.
pub const ROOM_MEMBER: &str = "m.room.member";
/// The `m.room.history_visibility` state event type.
pub const ROOM_HISTORY_VISIBILITY: &str = "m.room.history_visibility";
/// The `m.room.encrypted` event type.
pub const ROOM_ENCRYPTED: &str = "m.room.encrypted";

/// The `m.room_key` to-device event type.
pub const ROOM_KEY: &str = "m.room_key";
/// The `m.forwarded_room_key` to-device event type.
pub const FORWARDED_ROOM_KEY: &str = "m.forwarded_room_key";
/// The `m.room_key_request` to-device event type.
pub const ROOM_KEY_REQUEST: &str = "m.room_key_request";
/// The `m.secret.request` to-device event type.
pub const SECRET_REQUEST: &str = "m.secret.request";
/// The `m.secret.send` to-device event type.
pub const SECRET_SEND: &str = "m.secret.send";

/// Is the to-device event type one of the gossiping events we keep a trail
/// of.
pub fn is_gossiping_event_type(event_type: &str) -> bool {
    matches!(event_type, ROOM_KEY_REQUEST | FORWARDED_ROOM_KEY | SECRET_REQUEST | SECRET_SEND)
}

/// A room event as handed to the service by the sync layer.
///
/// State events carry a `state_key`, the content is kept as raw JSON and
/// only parsed for the event types the service cares about.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateEvent {
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The state key, `None` for message-like events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// The sender of the event.
    pub sender: OwnedUserId,
    /// The unique ID of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<OwnedEventId>,
    /// The content of the event.
    pub content: Value,
}

impl StateEvent {
    /// Is this a state event.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// The user a `m.room.member` event is about.
    pub fn member_user_id(&self) -> Option<OwnedUserId> {
        self.state_key.as_deref().and_then(|s| UserId::parse(s).ok())
    }

    /// Deserialize the content of the event.
    pub fn parse_content<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.content)
    }
}

/// The content of an `m.room.encryption` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomEncryptionEventContent {
    /// The encryption algorithm to be used to encrypt messages sent in the
    /// room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long the session should be used before changing it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_ms: Option<u64>,
    /// How many messages should be sent before changing the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_msgs: Option<u64>,
}

/// The membership state of a user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipState {
    /// The user is banned.
    Ban,
    /// The user has been invited.
    Invite,
    /// The user has joined.
    Join,
    /// The user has requested to join.
    Knock,
    /// The user has left.
    Leave,
    /// Any membership we don't know about.
    #[serde(other)]
    Unknown,
}

/// The content of an `m.room.member` event, reduced to what we need.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomMemberEventContent {
    /// The membership state of the user.
    pub membership: MembershipState,
}

/// Who can see a room's history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryVisibility {
    /// Previous events are accessible to newly joined members from the point
    /// they were invited onwards.
    Invited,
    /// Previous events are accessible to newly joined members from the point
    /// they joined the room onwards.
    Joined,
    /// Previous events are always accessible to newly joined members.
    Shared,
    /// All events while this is the `HistoryVisibility` value may be shared by
    /// any participating homeserver with anyone, regardless of whether they
    /// have ever joined the room.
    WorldReadable,
}

/// The content of an `m.room.history_visibility` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomHistoryVisibilityEventContent {
    /// Who can see the room history.
    pub history_visibility: HistoryVisibility,
}

/// The room and session a `m.room_key` or `m.forwarded_room_key` to-device
/// event carries.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct RoomKeyContent {
    pub room_id: OwnedRoomId,
    pub session_id: String,
}

/// The parts of a decrypted to-device event we need to route it.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ToDeviceEventHeader {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub sender: Option<OwnedUserId>,
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_let;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_member_event_parsing() {
        let event: StateEvent = serde_json::from_value(json!({
            "type": "m.room.member",
            "state_key": "@bob:example.org",
            "sender": "@bob:example.org",
            "content": { "membership": "join", "displayname": "Bob" },
        }))
        .unwrap();

        assert!(event.is_state());
        assert_eq!(event.member_user_id().unwrap().as_str(), "@bob:example.org");

        let content: RoomMemberEventContent = event.parse_content().unwrap();
        assert_eq!(content.membership, MembershipState::Join);
    }

    #[test]
    fn test_unknown_membership_does_not_fail() {
        let content: RoomMemberEventContent =
            serde_json::from_value(json!({ "membership": "org.example.custom" })).unwrap();

        assert_eq!(content.membership, MembershipState::Unknown);
    }

    #[test]
    fn test_encryption_event_parsing() {
        let content: RoomEncryptionEventContent = serde_json::from_value(json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "rotation_period_ms": 604800000,
        }))
        .unwrap();

        assert_eq!(content.algorithm, EventEncryptionAlgorithm::MegolmV1AesSha2);
        assert_let!(Some(604800000) = content.rotation_period_ms);
    }

    #[test]
    fn test_gossiping_event_types() {
        assert!(is_gossiping_event_type("m.room_key_request"));
        assert!(is_gossiping_event_type("m.secret.send"));
        assert!(!is_gossiping_event_type("m.room_key"));
    }
}
