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

//! The requests the Olm machine wants us to send out to the homeserver.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId, TransactionId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// The keys upload request, uploading device and one-time keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    /// The signed device keys, only present if they weren't uploaded yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<Value>,
    /// The signed one-time keys, keyed by `<algorithm>:<key id>`.
    #[serde(default)]
    pub one_time_keys: BTreeMap<String, Value>,
    /// The signed fallback keys.
    #[serde(default)]
    pub fallback_keys: BTreeMap<String, Value>,
}

/// The keys query request, fetching the device and cross signing keys of
/// other users.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysQueryRequest {
    /// The users, and optionally the specific devices, we want keys for. An
    /// empty list means all the devices of the user.
    pub device_keys: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
    /// How long the server should wait for remote servers.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_ms")]
    pub timeout: Option<Duration>,
}

impl KeysQueryRequest {
    /// Create a keys query for all the devices of the given users.
    pub fn new(users: impl IntoIterator<Item = OwnedUserId>) -> Self {
        Self { device_keys: users.into_iter().map(|u| (u, Vec::new())).collect(), timeout: None }
    }

    /// The users this query asks keys for.
    pub fn users(&self) -> impl Iterator<Item = &OwnedUserId> {
        self.device_keys.keys()
    }
}

/// The key claiming request, fetching one-time keys of other users so new Olm
/// sessions can be created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysClaimRequest {
    /// The one-time key algorithm we want to claim, per device.
    pub one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>>,
    /// How long the server should wait for remote servers.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_ms")]
    pub timeout: Option<Duration>,
}

impl KeysClaimRequest {
    /// The number of devices we're claiming a key for.
    pub fn device_count(&self) -> usize {
        self.one_time_keys.values().map(BTreeMap::len).sum()
    }
}

/// A recipient device of a to-device message.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceIdOrAllDevices {
    /// A single device.
    DeviceId(OwnedDeviceId),
    /// Every device of the user, encoded as `*` on the wire.
    AllDevices,
}

impl From<OwnedDeviceId> for DeviceIdOrAllDevices {
    fn from(d: OwnedDeviceId) -> Self {
        DeviceIdOrAllDevices::DeviceId(d)
    }
}

impl fmt::Display for DeviceIdOrAllDevices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceIdOrAllDevices::DeviceId(d) => f.write_str(d.as_str()),
            DeviceIdOrAllDevices::AllDevices => f.write_str("*"),
        }
    }
}

impl Serialize for DeviceIdOrAllDevices {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceIdOrAllDevices {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;

        Ok(if s == "*" {
            DeviceIdOrAllDevices::AllDevices
        } else {
            DeviceIdOrAllDevices::DeviceId(s.into())
        })
    }
}

/// Customized version of
/// `ruma_client_api::to_device::send_event_to_device::v3::Request`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceRequest {
    /// Type of event being sent to each device.
    pub event_type: String,
    /// A request identifier unique to the access token used to send the
    /// request.
    pub txn_id: OwnedTransactionId,
    /// A map of users to devices to a content for a message event to be
    /// sent to the user's device. Individual message events can be sent
    /// to devices, but all events must be of the same type.
    /// The content's type for this field will be updated in a future
    /// release, until then you can create a value using
    /// `serde_json::value::to_raw_value`.
    pub messages: BTreeMap<OwnedUserId, BTreeMap<DeviceIdOrAllDevices, Value>>,
}

impl ToDeviceRequest {
    /// Create a new owned to-device request for a single recipient device.
    pub fn new(
        recipient: OwnedUserId,
        recipient_device: impl Into<DeviceIdOrAllDevices>,
        event_type: &str,
        content: Value,
    ) -> Self {
        let messages =
            BTreeMap::from([(recipient, BTreeMap::from([(recipient_device.into(), content)]))]);

        Self { event_type: event_type.to_owned(), txn_id: TransactionId::new(), messages }
    }

    /// Gets the total number of messages in this request.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(BTreeMap::len).sum()
    }
}

/// Request that will publish cross signing signatures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignatureUploadRequest {
    /// The signed keys, keyed by user id and key/device id.
    pub signed_keys: BTreeMap<OwnedUserId, BTreeMap<String, Value>>,
}

/// A request that will back up a batch of room keys to the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysBackupRequest {
    /// The backup version that these room keys should be part of.
    pub version: String,
    /// The map from room id to a backed up room key that we're going to upload
    /// to the server.
    pub rooms: BTreeMap<OwnedRoomId, Value>,
}

/// Customized owned request type for sending out room messages, used for
/// in-room verification.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomMessageRequest {
    /// The room to send the event to.
    pub room_id: OwnedRoomId,
    /// The transaction ID for this event.
    pub txn_id: OwnedTransactionId,
    /// The type of the event.
    pub event_type: String,
    /// The event content to send.
    pub content: Value,
}

/// Enum over the different outgoing requests we can have.
///
/// The engine decides what needs to go out, the
/// [`CryptoService`](crate::CryptoService) only dispatches, adding a kind here
/// forces every dispatch site to handle it.
#[derive(Clone, Debug)]
pub enum AnyOutgoingRequest {
    /// The keys upload request, uploading device and one-time keys.
    KeysUpload(KeysUploadRequest),
    /// The keys query request, fetching the device and cross signing keys of
    /// other users.
    KeysQuery(KeysQueryRequest),
    /// The request to claim one-time keys for a user/device pair from the
    /// server, after the response is received an 1-to-1 Olm session will be
    /// established with the user/device pair.
    KeysClaim(KeysClaimRequest),
    /// The to-device requests, this request is used for a couple of different
    /// things, the main use is key requests/forwards and interactive device
    /// verification.
    ToDeviceRequest(ToDeviceRequest),
    /// Signature upload request, this request is used after a successful device
    /// or user verification is done.
    SignatureUpload(SignatureUploadRequest),
    /// A room message request, usually for sending in-room interactive
    /// verification events.
    RoomMessage(RoomMessageRequest),
    /// A request that will back up a batch of room keys to the server.
    KeysBackup(KeysBackupRequest),
}

impl AnyOutgoingRequest {
    /// The kind of this request, used when marking it as sent.
    pub fn request_type(&self) -> RequestType {
        match self {
            AnyOutgoingRequest::KeysUpload(_) => RequestType::KeysUpload,
            AnyOutgoingRequest::KeysQuery(_) => RequestType::KeysQuery,
            AnyOutgoingRequest::KeysClaim(_) => RequestType::KeysClaim,
            AnyOutgoingRequest::ToDeviceRequest(_) => RequestType::ToDevice,
            AnyOutgoingRequest::SignatureUpload(_) => RequestType::SignatureUpload,
            AnyOutgoingRequest::RoomMessage(_) => RequestType::RoomMessage,
            AnyOutgoingRequest::KeysBackup(_) => RequestType::KeysBackup,
        }
    }

    /// Get the to-device request if this is one.
    pub fn to_device(&self) -> Option<&ToDeviceRequest> {
        match self {
            AnyOutgoingRequest::ToDeviceRequest(r) => Some(r),
            _ => None,
        }
    }
}

impl From<KeysQueryRequest> for AnyOutgoingRequest {
    fn from(request: KeysQueryRequest) -> Self {
        AnyOutgoingRequest::KeysQuery(request)
    }
}

impl From<KeysUploadRequest> for AnyOutgoingRequest {
    fn from(request: KeysUploadRequest) -> Self {
        AnyOutgoingRequest::KeysUpload(request)
    }
}

impl From<KeysClaimRequest> for AnyOutgoingRequest {
    fn from(request: KeysClaimRequest) -> Self {
        AnyOutgoingRequest::KeysClaim(request)
    }
}

impl From<ToDeviceRequest> for AnyOutgoingRequest {
    fn from(request: ToDeviceRequest) -> Self {
        AnyOutgoingRequest::ToDeviceRequest(request)
    }
}

impl From<SignatureUploadRequest> for AnyOutgoingRequest {
    fn from(request: SignatureUploadRequest) -> Self {
        AnyOutgoingRequest::SignatureUpload(request)
    }
}

impl From<RoomMessageRequest> for AnyOutgoingRequest {
    fn from(request: RoomMessageRequest) -> Self {
        AnyOutgoingRequest::RoomMessage(request)
    }
}

impl From<KeysBackupRequest> for AnyOutgoingRequest {
    fn from(request: KeysBackupRequest) -> Self {
        AnyOutgoingRequest::KeysBackup(request)
    }
}

/// The kind of an outgoing request, passed back to the engine together with
/// the response body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestType {
    /// A [`KeysUploadRequest`].
    KeysUpload,
    /// A [`KeysQueryRequest`].
    KeysQuery,
    /// A [`KeysClaimRequest`].
    KeysClaim,
    /// A [`ToDeviceRequest`].
    ToDevice,
    /// A [`SignatureUploadRequest`].
    SignatureUpload,
    /// A [`RoomMessageRequest`].
    RoomMessage,
    /// A [`KeysBackupRequest`].
    KeysBackup,
}

/// Outgoing request type, holds the unique ID of the request and the actual
/// request.
#[derive(Clone, Debug)]
pub struct OutgoingRequest {
    /// The unique id of a request, needs to be passed when receiving a
    /// response.
    pub(crate) request_id: OwnedTransactionId,
    /// The underlying outgoing request.
    pub(crate) request: Arc<AnyOutgoingRequest>,
}

impl OutgoingRequest {
    /// Create a new outgoing request with the given id.
    pub fn new(request_id: OwnedTransactionId, request: impl Into<AnyOutgoingRequest>) -> Self {
        Self { request_id, request: Arc::new(request.into()) }
    }

    /// Get the unique id of this request.
    pub fn request_id(&self) -> &TransactionId {
        &self.request_id
    }

    /// Get the underlying outgoing request.
    pub fn request(&self) -> &AnyOutgoingRequest {
        &self.request
    }
}

impl From<ToDeviceRequest> for OutgoingRequest {
    fn from(r: ToDeviceRequest) -> Self {
        Self { request_id: r.txn_id.clone(), request: Arc::new(r.into()) }
    }
}

/// A pair of outgoing room key requests, both of those are sendToDevice
/// requests.
#[derive(Clone, Debug)]
pub struct KeyRequestPair {
    /// The optional cancellation, this is None if no previous key request was
    /// sent out for this key, thus it doesn't need to be cancelled.
    pub cancellation: Option<OutgoingRequest>,
    /// The actual key request.
    pub key_request: OutgoingRequest,
}

mod opt_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_u64(d.as_millis().try_into().unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, owned_user_id};
    use serde_json::json;

    use super::*;

    #[test]
    fn test_to_device_all_devices_wire_format() {
        let request = ToDeviceRequest::new(
            owned_user_id!("@alice:example.org"),
            DeviceIdOrAllDevices::AllDevices,
            "m.room_key_request",
            json!({ "action": "request_cancellation" }),
        );

        let serialized = serde_json::to_value(&request.messages).unwrap();
        assert_eq!(
            serialized,
            json!({ "@alice:example.org": { "*": { "action": "request_cancellation" } } })
        );
        assert_eq!(request.message_count(), 1);

        let request: OutgoingRequest = request.into();
        assert_eq!(request.request().request_type(), RequestType::ToDevice);
        assert!(request.request().to_device().is_some());
    }

    #[test]
    fn test_device_recipient_round_trips_through_json() {
        let recipient: DeviceIdOrAllDevices = device_id!("ABCDEF").to_owned().into();
        let value = serde_json::to_value(&recipient).unwrap();

        assert_eq!(value, json!("ABCDEF"));
        assert_eq!(serde_json::from_value::<DeviceIdOrAllDevices>(value).unwrap(), recipient);
    }

    #[test]
    fn test_keys_query_timeout_in_milliseconds() {
        let mut request = KeysQueryRequest::new([owned_user_id!("@bob:example.org")]);
        request.timeout = Some(Duration::from_secs(10));

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({ "device_keys": { "@bob:example.org": [] }, "timeout": 10000 })
        );
    }
}
