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

//! The homeserver endpoints the [`CryptoService`](crate::CryptoService) needs.

use std::fmt;

use async_trait::async_trait;
use ruma::{DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::requests::{
    KeysBackupRequest, KeysClaimRequest, KeysQueryRequest, KeysUploadRequest, RoomMessageRequest,
    SignatureUploadRequest, ToDeviceRequest,
};

/// Result type of the [`CryptoApi`] calls.
pub type HttpResult<T> = std::result::Result<T, HttpError>;

/// An HTTP error, representing either a connection error or an error while
/// converting the raw HTTP response into a Matrix response.
#[derive(Error, Debug)]
pub enum HttpError {
    /// The homeserver answered with a Matrix error.
    #[error("the server returned an error, status {status_code}: {errcode}: {message}")]
    Api {
        /// The HTTP status code of the response.
        status_code: u16,
        /// The Matrix error code, e.g. `M_LIMIT_EXCEEDED`.
        errcode: String,
        /// The human readable error message.
        message: String,
    },

    /// The request couldn't be sent or the response couldn't be received.
    #[error("network error: {0}")]
    Network(String),

    /// The response couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HttpError {
    /// Does the server want us to authenticate further, e.g. for a device
    /// deletion.
    pub fn is_uia_required(&self) -> bool {
        matches!(self, HttpError::Api { status_code: 401, .. })
    }
}

/// A device of our own account, as listed by the homeserver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDevice {
    /// The device ID.
    pub device_id: OwnedDeviceId,
    /// The public display name of the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Most recently seen IP address of the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_ip: Option<String>,
    /// Unix timestamp that the session was last active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_ts: Option<MilliSecondsSinceUnixEpoch>,
}

/// The client-server endpoints driven by the outgoing request pipeline and the
/// device management calls.
///
/// Every request body is produced by the [`CryptoEngine`](crate::CryptoEngine)
/// and every response body is handed back to it untouched, hence the raw JSON
/// responses.
#[async_trait]
pub trait CryptoApi: fmt::Debug + Send + Sync {
    /// `POST /_matrix/client/v3/keys/upload`
    async fn upload_keys(&self, request: &KeysUploadRequest) -> HttpResult<Value>;

    /// `POST /_matrix/client/v3/keys/query`
    async fn query_keys(&self, request: &KeysQueryRequest) -> HttpResult<Value>;

    /// `POST /_matrix/client/v3/keys/claim`
    async fn claim_keys(&self, request: &KeysClaimRequest) -> HttpResult<Value>;

    /// `PUT /_matrix/client/v3/sendToDevice/{eventType}/{txnId}`
    async fn send_to_device(&self, request: &ToDeviceRequest) -> HttpResult<()>;

    /// `POST /_matrix/client/v3/keys/signatures/upload`
    async fn upload_signatures(&self, request: &SignatureUploadRequest) -> HttpResult<Value>;

    /// `PUT /_matrix/client/v3/room_keys/keys`
    async fn backup_room_keys(&self, request: &KeysBackupRequest) -> HttpResult<Value>;

    /// `PUT /_matrix/client/v3/rooms/{roomId}/send/{eventType}/{txnId}`
    async fn send_room_message(&self, request: &RoomMessageRequest) -> HttpResult<Value>;

    /// `GET /_matrix/client/v3/devices`
    async fn get_devices(&self) -> HttpResult<Vec<ServerDevice>>;

    /// `GET /_matrix/client/v3/devices/{deviceId}`
    async fn get_device(&self, device_id: &DeviceId) -> HttpResult<ServerDevice>;

    /// `PUT /_matrix/client/v3/devices/{deviceId}`
    async fn set_device_name(&self, device_id: &DeviceId, display_name: &str) -> HttpResult<()>;

    /// `DELETE /_matrix/client/v3/devices/{deviceId}`
    ///
    /// `auth` carries the user-interactive authentication data, if the server
    /// asked for it.
    async fn delete_device(&self, device_id: &DeviceId, auth: Option<Value>) -> HttpResult<()>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_server_device_parsing() {
        let device: ServerDevice = serde_json::from_value(json!({
            "device_id": "QBUAZIFURK",
            "display_name": "android",
            "last_seen_ip": "1.2.3.4",
            "last_seen_ts": 1474491775024u64,
        }))
        .unwrap();

        assert_eq!(device.device_id.as_str(), "QBUAZIFURK");
        assert_eq!(device.display_name.as_deref(), Some("android"));
    }

    #[test]
    fn test_uia_detection() {
        let error = HttpError::Api {
            status_code: 401,
            errcode: "M_FORBIDDEN".to_owned(),
            message: "Invalid password".to_owned(),
        };

        assert!(error.is_uia_required());
        assert!(!HttpError::Network("timeout".to_owned()).is_uia_required());
    }
}
