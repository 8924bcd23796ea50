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

//! The seam between the [`CryptoService`](crate::CryptoService) and the Olm
//! machine doing the actual cryptography.
//!
//! The service never touches key material itself. It asks a [`CryptoEngine`]
//! what needs to be sent, sends it, and passes the responses back.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use ruma::{
    DeviceId, EventEncryptionAlgorithm, OwnedDeviceId, OwnedRoomId, OwnedTransactionId,
    OwnedUserId, RoomId, TransactionId, UserId,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::{
    error::{EngineResult, MegolmError},
    events::HistoryVisibility,
    requests::{KeyRequestPair, KeysClaimRequest, OutgoingRequest, RequestType, ToDeviceRequest},
    store::CryptoStore,
};

/// Rotate a group session after a week.
const ROTATION_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Rotate a group session after 100 messages.
const ROTATION_MESSAGES: u64 = 100;

/// Settings for an encrypted room.
///
/// This determines the algorithm and rotation periods of a group session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long the session should be used before changing it.
    pub rotation_period: Duration,
    /// How many messages should be sent before changing the session.
    pub rotation_period_msgs: u64,
    /// The history visibility of the room when the session was created.
    pub history_visibility: HistoryVisibility,
    /// Should untrusted devices receive the room key, or should they be
    /// excluded from the conversation.
    #[serde(default)]
    pub only_allow_trusted_devices: bool,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
            history_visibility: HistoryVisibility::Shared,
            only_allow_trusted_devices: false,
        }
    }
}

/// The set of users whose device lists changed, as reported by the sync.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLists {
    /// Users who have updated their device identity keys, or who now share an
    /// encrypted room with the client since the previous sync.
    #[serde(default)]
    pub changed: Vec<OwnedUserId>,
    /// Users who no longer share any encrypted rooms with us.
    #[serde(default)]
    pub left: Vec<OwnedUserId>,
}

impl DeviceLists {
    /// Are there any changes in this delta.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.left.is_empty()
    }
}

/// E2EE related changes of a single sync response.
#[derive(Debug)]
pub struct EncryptionSyncChanges<'a> {
    /// The raw to-device events.
    pub to_device_events: Vec<Value>,
    /// The device lists delta.
    pub changed_devices: &'a DeviceLists,
    /// The number of one-time keys we still have on the server, per algorithm.
    pub one_time_keys_counts: &'a BTreeMap<String, u64>,
    /// The fallback key algorithms that haven't been used yet, `None` if the
    /// server doesn't support fallback keys.
    pub unused_fallback_keys: Option<&'a [String]>,
}

/// A room key that has been received or imported.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyInfo {
    /// The room where the key is used.
    pub room_id: OwnedRoomId,
    /// The ID of the session that the key is for.
    pub session_id: String,
}

/// The result of a successful room event decryption.
#[derive(Clone, Debug)]
pub struct DecryptedRoomEvent {
    /// The decrypted event, with its `type` and `content`.
    pub event: Value,
    /// The curve25519 key of the device that sent the event.
    pub sender_curve25519_key: String,
    /// The ed25519 key the sender claimed to own.
    pub claimed_ed25519_key: Option<String>,
    /// The chain of curve25519 keys the room key was forwarded through.
    pub forwarding_curve25519_chain: Vec<String>,
    /// Is the sending device verified.
    pub verified: bool,
}

/// The public identity keys of our own device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeys {
    /// The ed25519 key, usually called the fingerprint of the device.
    pub ed25519: String,
    /// The curve25519 key, used to establish Olm sessions.
    pub curve25519: String,
}

/// The local trust state of a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device has been verified and is trusted.
    Verified,
    /// The device been blacklisted from communicating.
    BlackListed,
    /// The trust state of the device is being ignored.
    Ignored,
    /// The trust state is unset.
    #[default]
    Unset,
}

/// A device of a user, as the engine knows it from a keys query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// The user the device belongs to.
    pub user_id: OwnedUserId,
    /// The unique id of the device.
    pub device_id: OwnedDeviceId,
    /// The human readable name of the device, if any.
    pub display_name: Option<String>,
    /// The public identity keys of the device, keyed by `<algorithm>:<device>`.
    pub keys: BTreeMap<String, String>,
    /// The encryption algorithms the device supports.
    pub algorithms: Vec<EventEncryptionAlgorithm>,
    /// Our local trust decision for the device.
    pub local_trust: LocalTrust,
    /// Is the device signed by the owner's verified cross signing identity.
    pub cross_signing_trusted: bool,
}

impl DeviceInfo {
    /// Is the device considered trusted, either locally or by cross signing.
    pub fn is_verified(&self) -> bool {
        self.local_trust == LocalTrust::Verified || self.cross_signing_trusted
    }

    /// Has the device been blacklisted locally.
    pub fn is_blacklisted(&self) -> bool {
        self.local_trust == LocalTrust::BlackListed
    }
}

/// A room key in its exportable form, as described in the [key export]
/// format.
///
/// [key export]: https://spec.matrix.org/v1.8/client-server-api/#key-export-format
#[derive(Clone, Deserialize, Serialize)]
pub struct ExportedRoomKey {
    /// The encryption algorithm that the session uses.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room where the session is used.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device which initiated the session originally.
    pub sender_key: String,
    /// The ID of the session that the key is for.
    pub session_id: String,
    /// The key for the session.
    pub session_key: String,
    /// The Ed25519 key of the device which initiated the session originally.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// Chain of Curve25519 keys through which this session was forwarded, via
    /// m.forwarded_room_key events.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl fmt::Debug for ExportedRoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedRoomKey")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("sender_key", &self.sender_key)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Return type for the room key importing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoomKeyImportResult {
    /// The number of room keys that were imported.
    pub imported_count: usize,
    /// The total number of room keys that were found in the export.
    pub total_count: usize,
    /// The map of keys that were imported, room id to sender key to session
    /// ids.
    pub keys: BTreeMap<OwnedRoomId, BTreeMap<String, BTreeSet<String>>>,
}

/// The reason a room key was withheld from us.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum WithheldCode {
    /// the user/device was blacklisted.
    Blacklisted,
    /// the user/devices is unverified.
    Unverified,
    /// The user/device is not allowed have the key.
    Unauthorised,
    /// Sent in reply to a key request if the device that the key is requested
    /// from does not have the requested key.
    Unavailable,
    /// An olm session could not be established.
    NoOlm,
    #[doc(hidden)]
    _Custom(String),
}

impl WithheldCode {
    /// The wire representation of the code.
    pub fn as_str(&self) -> &str {
        match self {
            WithheldCode::Blacklisted => "m.blacklisted",
            WithheldCode::Unverified => "m.unverified",
            WithheldCode::Unauthorised => "m.unauthorised",
            WithheldCode::Unavailable => "m.unavailable",
            WithheldCode::NoOlm => "m.no_olm",
            WithheldCode::_Custom(s) => s,
        }
    }
}

impl From<&str> for WithheldCode {
    fn from(s: &str) -> Self {
        match s {
            "m.blacklisted" => WithheldCode::Blacklisted,
            "m.unverified" => WithheldCode::Unverified,
            "m.unauthorised" => WithheldCode::Unauthorised,
            "m.unavailable" => WithheldCode::Unavailable,
            "m.no_olm" => WithheldCode::NoOlm,
            other => WithheldCode::_Custom(other.to_owned()),
        }
    }
}

impl fmt::Display for WithheldCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match self {
            WithheldCode::Blacklisted => "The sender has blocked you.",
            WithheldCode::Unverified => "The sender has disabled encrypting to unverified devices.",
            WithheldCode::Unauthorised => "You are not authorised to read the message.",
            WithheldCode::Unavailable => "The requested key was not found.",
            WithheldCode::NoOlm => "Unable to establish a secure channel.",
            _ => self.as_str(),
        };

        write!(f, "{string}")
    }
}

impl Serialize for WithheldCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for WithheldCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.as_str().into())
    }
}

/// The Olm machine the [`CryptoService`](crate::CryptoService) drives.
///
/// An engine owns all cryptographic state: our identity keys, the device list
/// cache, the Olm and Megolm sessions. It never talks to the network, instead
/// it produces [`OutgoingRequest`]s and expects the responses to be handed back
/// through [`CryptoEngine::mark_request_as_sent()`]. A request that hasn't
/// been marked as sent is returned again by the next call to
/// [`CryptoEngine::outgoing_requests()`].
#[async_trait]
pub trait CryptoEngine: fmt::Debug + Send + Sync {
    /// The unique ID of the user that owns this engine.
    fn user_id(&self) -> &UserId;

    /// The unique device ID that identifies this engine.
    fn device_id(&self) -> &DeviceId;

    /// Get the public parts of our Olm identity keys.
    fn identity_keys(&self) -> IdentityKeys;

    /// Get the outgoing requests that need to be sent out.
    ///
    /// **Note**: This method call should be locked per call.
    async fn outgoing_requests(&self) -> EngineResult<Vec<OutgoingRequest>>;

    /// Mark the request with the given request id as sent.
    ///
    /// * `request_id` - The unique id of the request that was sent out.
    ///
    /// * `request_type` - The kind of the request that was sent out.
    ///
    /// * `response` - The raw body of the response that was received.
    async fn mark_request_as_sent(
        &self,
        request_id: &TransactionId,
        request_type: RequestType,
        response: &Value,
    ) -> EngineResult<()>;

    /// Handle the E2EE related changes of a sync response, returning the
    /// decrypted to-device events.
    async fn receive_sync_changes(
        &self,
        sync_changes: EncryptionSyncChanges<'_>,
    ) -> EngineResult<Vec<Value>>;

    /// Add the given users to the set of tracked users, queueing a keys query
    /// for those that weren't tracked before.
    async fn update_tracked_users(&self, users: &[OwnedUserId]) -> EngineResult<()>;

    /// Get the set of users whose devices the engine tracks.
    async fn tracked_users(&self) -> EngineResult<BTreeSet<OwnedUserId>>;

    /// Build a keys query for the given users right away, regardless of
    /// whether their device lists are considered outdated.
    fn query_keys_for_users(&self, users: &[OwnedUserId]) -> OutgoingRequest;

    /// Get a key claiming request for the user/device pairs that we are
    /// missing Olm sessions for, `None` if no request needs to be sent.
    async fn get_missing_sessions(
        &self,
        users: &[OwnedUserId],
    ) -> EngineResult<Option<(OwnedTransactionId, KeysClaimRequest)>>;

    /// Get the to-device requests that share the current outbound group
    /// session of the room with the given users.
    async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: &[OwnedUserId],
        settings: EncryptionSettings,
    ) -> EngineResult<Vec<Arc<ToDeviceRequest>>>;

    /// Encrypt a room event content using the room's outbound group session.
    ///
    /// A room key must have been shared using
    /// [`CryptoEngine::share_room_key()`] before.
    async fn encrypt_room_event_raw(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> EngineResult<Value>;

    /// Decrypt a `m.room.encrypted` event that was sent in the given room.
    async fn decrypt_room_event(
        &self,
        event: &Value,
        room_id: &RoomId,
    ) -> Result<DecryptedRoomEvent, MegolmError>;

    /// Create a new key request for the session that encrypted the given
    /// event, together with a cancellation of a previous request for the same
    /// session if one is still outstanding.
    async fn request_room_key(
        &self,
        event: &Value,
        room_id: &RoomId,
    ) -> EngineResult<KeyRequestPair>;

    /// Discard the outbound group session of the room, returns `true` if one
    /// existed.
    async fn discard_room_key(&self, room_id: &RoomId) -> EngineResult<bool>;

    /// Export the inbound group sessions we have.
    async fn export_room_keys(&self) -> EngineResult<Vec<ExportedRoomKey>>;

    /// Import the given room keys, calling `progress_listener` with the number
    /// of processed keys and the total.
    async fn import_room_keys(
        &self,
        keys: Vec<ExportedRoomKey>,
        progress_listener: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> EngineResult<RoomKeyImportResult>;

    /// Get a specific device of a user.
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> EngineResult<Option<DeviceInfo>>;

    /// Get all the known devices of a user.
    async fn get_user_devices(&self, user_id: &UserId) -> EngineResult<Vec<DeviceInfo>>;

    /// Set the local trust of a device.
    async fn set_local_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> EngineResult<()>;
}

/// Creates the [`CryptoEngine`] once a session is started.
#[async_trait]
pub trait CryptoEngineBuilder: fmt::Debug + Send + Sync {
    /// Open, or create, the engine for the given user/device pair, persisting
    /// its state into the given, already opened, store.
    async fn build(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        store: Arc<dyn CryptoStore>,
    ) -> EngineResult<Arc<dyn CryptoEngine>>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_withheld_code_wire_format() {
        let code: WithheldCode = serde_json::from_value(json!("m.unverified")).unwrap();
        assert_eq!(code, WithheldCode::Unverified);

        let code: WithheldCode = serde_json::from_value(json!("org.example.custom")).unwrap();
        assert_eq!(code.as_str(), "org.example.custom");
        assert_eq!(serde_json::to_value(&code).unwrap(), json!("org.example.custom"));
    }

    #[test]
    fn test_default_settings_use_megolm() {
        let settings = EncryptionSettings::default();

        assert_eq!(settings.algorithm, EventEncryptionAlgorithm::MegolmV1AesSha2);
        assert_eq!(settings.rotation_period_msgs, 100);
        assert!(!settings.only_allow_trusted_devices);
    }
}
