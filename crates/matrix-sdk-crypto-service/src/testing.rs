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

//! Scripted doubles of the Olm machine and the homeserver.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use async_trait::async_trait;
use ruma::{
    owned_device_id, owned_user_id, DeviceId, EventEncryptionAlgorithm, OwnedDeviceId,
    OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId, UserId,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};

use crate::{
    api::{CryptoApi, HttpError, HttpResult, ServerDevice},
    engine::{
        CryptoEngine, CryptoEngineBuilder, DecryptedRoomEvent, DeviceInfo, EncryptionSettings,
        EncryptionSyncChanges, ExportedRoomKey, IdentityKeys, LocalTrust, RoomKeyImportResult,
        WithheldCode,
    },
    error::{EngineError, EngineResult, MegolmError},
    requests::{
        DeviceIdOrAllDevices, KeyRequestPair, KeysBackupRequest, KeysClaimRequest,
        KeysQueryRequest, KeysUploadRequest, OutgoingRequest, RequestType, RoomMessageRequest,
        SignatureUploadRequest, ToDeviceRequest,
    },
    store::CryptoStore,
};

pub(crate) fn alice_id() -> OwnedUserId {
    owned_user_id!("@alice:example.org")
}

pub(crate) fn alice_device_id() -> OwnedDeviceId {
    owned_device_id!("ALICEDEVICE")
}

/// The fields of an encrypted room event content the mock cares about.
#[derive(Deserialize)]
struct MegolmContent {
    session_id: String,
}

/// An Olm machine that doesn't do any cryptography.
///
/// Outgoing requests are kept until they are marked as sent, every call is
/// recorded so tests can inspect what the service did.
#[derive(Debug)]
pub(crate) struct MockEngine {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    pub pending: StdMutex<BTreeMap<OwnedTransactionId, OutgoingRequest>>,
    pub marked: StdMutex<Vec<(OwnedTransactionId, RequestType)>>,
    pub outgoing_requests_calls: AtomicUsize,
    pub tracked: StdMutex<BTreeSet<OwnedUserId>>,
    pub update_tracked_users_calls: StdMutex<Vec<Vec<OwnedUserId>>>,
    pub missing_sessions: StdMutex<Option<KeysClaimRequest>>,
    pub shares: StdMutex<Vec<(OwnedRoomId, Vec<OwnedUserId>, EncryptionSettings)>>,
    pub outbound_sessions: StdMutex<BTreeSet<OwnedRoomId>>,
    pub discarded: StdMutex<Vec<OwnedRoomId>>,
    pub encrypt_calls: AtomicUsize,
    pub inbound_sessions: StdMutex<BTreeMap<String, ExportedRoomKey>>,
    pub withheld: StdMutex<BTreeMap<String, WithheldCode>>,
    pub key_requests: StdMutex<BTreeMap<String, OwnedTransactionId>>,
    pub devices: StdMutex<BTreeMap<(OwnedUserId, OwnedDeviceId), DeviceInfo>>,
}

impl MockEngine {
    pub(crate) fn new(user_id: OwnedUserId, device_id: OwnedDeviceId) -> Self {
        Self {
            user_id,
            device_id,
            pending: Default::default(),
            marked: Default::default(),
            outgoing_requests_calls: AtomicUsize::new(0),
            tracked: Default::default(),
            update_tracked_users_calls: Default::default(),
            missing_sessions: Default::default(),
            shares: Default::default(),
            outbound_sessions: Default::default(),
            discarded: Default::default(),
            encrypt_calls: AtomicUsize::new(0),
            inbound_sessions: Default::default(),
            withheld: Default::default(),
            key_requests: Default::default(),
            devices: Default::default(),
        }
    }

    /// Queue a request, as if the machine wanted to send it.
    pub(crate) fn queue(&self, request: OutgoingRequest) -> OwnedTransactionId {
        let request_id = request.request_id().to_owned();
        self.pending.lock().unwrap().insert(request_id.clone(), request);
        request_id
    }

    pub(crate) fn marked_ids(&self) -> Vec<OwnedTransactionId> {
        self.marked.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    pub(crate) fn add_inbound_session(&self, room_id: &RoomId, session_id: &str) {
        self.inbound_sessions.lock().unwrap().insert(
            session_id.to_owned(),
            ExportedRoomKey {
                algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
                room_id: room_id.to_owned(),
                sender_key: "FYOoKQSwe4d9jhTZ/LQCZFJINjPEqZ7Or4Z08reP92M".to_owned(),
                session_id: session_id.to_owned(),
                session_key: format!("session key of {session_id}"),
                sender_claimed_keys: BTreeMap::new(),
                forwarding_curve25519_key_chain: Vec::new(),
            },
        );
    }

    pub(crate) fn add_device(&self, user_id: &UserId, device_id: &DeviceId) {
        let device = DeviceInfo {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            display_name: None,
            keys: BTreeMap::new(),
            algorithms: vec![EventEncryptionAlgorithm::MegolmV1AesSha2],
            local_trust: LocalTrust::Unset,
            cross_signing_trusted: false,
        };

        self.devices.lock().unwrap().insert((user_id.to_owned(), device_id.to_owned()), device);
    }

    fn room_key_request(&self, content: Value) -> ToDeviceRequest {
        ToDeviceRequest::new(
            self.user_id.clone(),
            DeviceIdOrAllDevices::AllDevices,
            "m.room_key_request",
            content,
        )
    }
}

#[async_trait]
impl CryptoEngine for MockEngine {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn identity_keys(&self) -> IdentityKeys {
        IdentityKeys {
            ed25519: "lij2YH5iVh6uO7ZSpE1e7MBSu2wVp9gP9K2UkBKp7bo".to_owned(),
            curve25519: "FYOoKQSwe4d9jhTZ/LQCZFJINjPEqZ7Or4Z08reP92M".to_owned(),
        }
    }

    async fn outgoing_requests(&self) -> EngineResult<Vec<OutgoingRequest>> {
        self.outgoing_requests_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.pending.lock().unwrap().values().cloned().collect())
    }

    async fn mark_request_as_sent(
        &self,
        request_id: &TransactionId,
        request_type: RequestType,
        _response: &Value,
    ) -> EngineResult<()> {
        self.pending.lock().unwrap().remove(request_id);
        self.marked.lock().unwrap().push((request_id.to_owned(), request_type));

        Ok(())
    }

    async fn receive_sync_changes(
        &self,
        sync_changes: EncryptionSyncChanges<'_>,
    ) -> EngineResult<Vec<Value>> {
        Ok(sync_changes.to_device_events)
    }

    async fn update_tracked_users(&self, users: &[OwnedUserId]) -> EngineResult<()> {
        self.update_tracked_users_calls.lock().unwrap().push(users.to_vec());

        let new_users: Vec<_> = {
            let mut tracked = self.tracked.lock().unwrap();
            users.iter().filter(|u| tracked.insert((*u).clone())).cloned().collect()
        };

        if !new_users.is_empty() {
            self.queue(self.query_keys_for_users(&new_users));
        }

        Ok(())
    }

    async fn tracked_users(&self) -> EngineResult<BTreeSet<OwnedUserId>> {
        Ok(self.tracked.lock().unwrap().clone())
    }

    fn query_keys_for_users(&self, users: &[OwnedUserId]) -> OutgoingRequest {
        OutgoingRequest::new(TransactionId::new(), KeysQueryRequest::new(users.iter().cloned()))
    }

    async fn get_missing_sessions(
        &self,
        _users: &[OwnedUserId],
    ) -> EngineResult<Option<(OwnedTransactionId, KeysClaimRequest)>> {
        Ok(self.missing_sessions.lock().unwrap().take().map(|r| (TransactionId::new(), r)))
    }

    async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: &[OwnedUserId],
        settings: EncryptionSettings,
    ) -> EngineResult<Vec<Arc<ToDeviceRequest>>> {
        self.shares.lock().unwrap().push((room_id.to_owned(), users.to_vec(), settings));
        self.outbound_sessions.lock().unwrap().insert(room_id.to_owned());

        Ok(users
            .iter()
            .map(|user_id| {
                Arc::new(ToDeviceRequest::new(
                    user_id.clone(),
                    DeviceIdOrAllDevices::AllDevices,
                    "m.room.encrypted",
                    json!({ "algorithm": "m.olm.v1.curve25519-aes-sha2", "ciphertext": {} }),
                ))
            })
            .collect())
    }

    async fn encrypt_room_event_raw(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> EngineResult<Value> {
        self.encrypt_calls.fetch_add(1, Ordering::SeqCst);

        if !self.outbound_sessions.lock().unwrap().contains(room_id) {
            return Err(EngineError::MissingSession(room_id.to_owned()));
        }

        Ok(json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "ciphertext": format!("{event_type}:{content}"),
            "sender_key": self.identity_keys().curve25519,
            "device_id": self.device_id,
            "session_id": format!("outbound-{room_id}"),
        }))
    }

    async fn decrypt_room_event(
        &self,
        event: &Value,
        _room_id: &RoomId,
    ) -> Result<DecryptedRoomEvent, MegolmError> {
        let content = event.get("content").cloned().unwrap_or(Value::Null);
        let content: MegolmContent = serde_json::from_value(content)?;

        if let Some(code) = self.withheld.lock().unwrap().get(&content.session_id) {
            return Err(MegolmError::MissingRoomKey(Some(code.clone())));
        }

        let sessions = self.inbound_sessions.lock().unwrap();
        let session =
            sessions.get(&content.session_id).ok_or(MegolmError::MissingRoomKey(None))?;

        Ok(DecryptedRoomEvent {
            event: json!({
                "type": "m.room.message",
                "content": { "msgtype": "m.text", "body": "It's a secret to everybody" },
            }),
            sender_curve25519_key: session.sender_key.clone(),
            claimed_ed25519_key: None,
            forwarding_curve25519_chain: Vec::new(),
            verified: false,
        })
    }

    async fn request_room_key(
        &self,
        event: &Value,
        _room_id: &RoomId,
    ) -> EngineResult<KeyRequestPair> {
        let content = event.get("content").cloned().unwrap_or(Value::Null);
        let content: MegolmContent = serde_json::from_value(content)?;

        let key_request = self.room_key_request(json!({
            "action": "request",
            "body": { "session_id": content.session_id },
        }));
        let key_request = OutgoingRequest::from(key_request);

        let previous = self
            .key_requests
            .lock()
            .unwrap()
            .insert(content.session_id, key_request.request_id().to_owned());

        let cancellation = previous.map(|previous| {
            OutgoingRequest::from(self.room_key_request(json!({
                "action": "request_cancellation",
                "request_id": previous,
            })))
        });

        Ok(KeyRequestPair { cancellation, key_request })
    }

    async fn discard_room_key(&self, room_id: &RoomId) -> EngineResult<bool> {
        self.discarded.lock().unwrap().push(room_id.to_owned());
        Ok(self.outbound_sessions.lock().unwrap().remove(room_id))
    }

    async fn export_room_keys(&self) -> EngineResult<Vec<ExportedRoomKey>> {
        Ok(self.inbound_sessions.lock().unwrap().values().cloned().collect())
    }

    async fn import_room_keys(
        &self,
        keys: Vec<ExportedRoomKey>,
        progress_listener: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> EngineResult<RoomKeyImportResult> {
        let total_count = keys.len();
        let mut result = RoomKeyImportResult { total_count, ..Default::default() };

        for (i, key) in keys.into_iter().enumerate() {
            let mut sessions = self.inbound_sessions.lock().unwrap();

            if !sessions.contains_key(&key.session_id) {
                result
                    .keys
                    .entry(key.room_id.clone())
                    .or_default()
                    .entry(key.sender_key.clone())
                    .or_default()
                    .insert(key.session_id.clone());
                result.imported_count += 1;
                sessions.insert(key.session_id.clone(), key);
            }

            drop(sessions);
            progress_listener(i + 1, total_count);
        }

        Ok(result)
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> EngineResult<Option<DeviceInfo>> {
        Ok(self.devices.lock().unwrap().get(&(user_id.to_owned(), device_id.to_owned())).cloned())
    }

    async fn get_user_devices(&self, user_id: &UserId) -> EngineResult<Vec<DeviceInfo>> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn set_local_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> EngineResult<()> {
        let mut devices = self.devices.lock().unwrap();

        let device = devices
            .get_mut(&(user_id.to_owned(), device_id.to_owned()))
            .ok_or_else(|| EngineError::Olm(format!("unknown device {device_id}")))?;
        device.local_trust = trust;

        Ok(())
    }
}

/// Hands out the same [`MockEngine`] on every build, unless told to fail.
#[derive(Debug)]
pub(crate) struct MockEngineBuilder {
    pub engine: Arc<MockEngine>,
    pub fail: AtomicBool,
    pub builds: AtomicUsize,
}

impl MockEngineBuilder {
    pub(crate) fn new() -> Self {
        Self {
            engine: Arc::new(MockEngine::new(alice_id(), alice_device_id())),
            fail: AtomicBool::new(false),
            builds: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CryptoEngineBuilder for MockEngineBuilder {
    async fn build(
        &self,
        _user_id: &UserId,
        _device_id: &DeviceId,
        _store: Arc<dyn CryptoStore>,
    ) -> EngineResult<Arc<dyn CryptoEngine>> {
        self.builds.fetch_add(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Olm("the account pickle is corrupted".to_owned()));
        }

        Ok(self.engine.clone())
    }
}

/// A homeserver that answers every request successfully, unless told
/// otherwise.
///
/// Key queries and to-device requests announce themselves on the `entered`
/// channel, and wait for a permit once the API has been [gated].
///
/// [gated]: MockApi::gate
#[derive(Debug)]
pub(crate) struct MockApi {
    gate: StdMutex<Option<Arc<Semaphore>>>,
    entered_sender: mpsc::UnboundedSender<&'static str>,
    entered: StdMutex<Option<mpsc::UnboundedReceiver<&'static str>>>,
    pub fail_keys_query: AtomicBool,
    pub fail_to_device: AtomicBool,
    pub to_device: StdMutex<Vec<ToDeviceRequest>>,
    pub keys_queries: StdMutex<Vec<KeysQueryRequest>>,
    pub keys_claims: AtomicUsize,
    pub renamed: StdMutex<Vec<(OwnedDeviceId, String)>>,
}

impl MockApi {
    pub(crate) fn new() -> Self {
        let (entered_sender, entered) = mpsc::unbounded_channel();

        Self {
            gate: Default::default(),
            entered_sender,
            entered: StdMutex::new(Some(entered)),
            fail_keys_query: AtomicBool::new(false),
            fail_to_device: AtomicBool::new(false),
            to_device: Default::default(),
            keys_queries: Default::default(),
            keys_claims: AtomicUsize::new(0),
            renamed: Default::default(),
        }
    }

    /// Block key queries and to-device requests until permits are added to
    /// the returned semaphore.
    pub(crate) fn gate(&self) -> Arc<Semaphore> {
        let semaphore = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(semaphore.clone());
        semaphore
    }

    /// The receiving end of the `entered` channel, can only be taken once.
    pub(crate) fn entered(&self) -> mpsc::UnboundedReceiver<&'static str> {
        self.entered.lock().unwrap().take().expect("The entered channel was already taken")
    }

    async fn enter(&self, endpoint: &'static str) {
        let _ = self.entered_sender.send(endpoint);

        let gate = self.gate.lock().unwrap().clone();

        if let Some(gate) = gate {
            let permit = gate.acquire().await.expect("The gate should never be closed");
            permit.forget();
        }
    }
}

#[async_trait]
impl CryptoApi for MockApi {
    async fn upload_keys(&self, _request: &KeysUploadRequest) -> HttpResult<Value> {
        Ok(json!({ "one_time_key_counts": { "signed_curve25519": 50 } }))
    }

    async fn query_keys(&self, request: &KeysQueryRequest) -> HttpResult<Value> {
        self.enter("keys_query").await;
        self.keys_queries.lock().unwrap().push(request.clone());

        if self.fail_keys_query.load(Ordering::SeqCst) {
            return Err(HttpError::Network("connection reset".to_owned()));
        }

        Ok(json!({ "device_keys": {}, "failures": {} }))
    }

    async fn claim_keys(&self, _request: &KeysClaimRequest) -> HttpResult<Value> {
        self.keys_claims.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "one_time_keys": {}, "failures": {} }))
    }

    async fn send_to_device(&self, request: &ToDeviceRequest) -> HttpResult<()> {
        self.enter("to_device").await;

        if self.fail_to_device.load(Ordering::SeqCst) {
            return Err(HttpError::Api {
                status_code: 500,
                errcode: "M_UNKNOWN".to_owned(),
                message: "Internal server error".to_owned(),
            });
        }

        self.to_device.lock().unwrap().push(request.clone());

        Ok(())
    }

    async fn upload_signatures(&self, _request: &SignatureUploadRequest) -> HttpResult<Value> {
        Ok(json!({ "failures": {} }))
    }

    async fn backup_room_keys(&self, _request: &KeysBackupRequest) -> HttpResult<Value> {
        Ok(json!({ "count": 0, "etag": "1" }))
    }

    async fn send_room_message(&self, _request: &RoomMessageRequest) -> HttpResult<Value> {
        Ok(json!({ "event_id": "$event:example.org" }))
    }

    async fn get_devices(&self) -> HttpResult<Vec<ServerDevice>> {
        Ok(vec![ServerDevice {
            device_id: alice_device_id(),
            display_name: Some("Alice's phone".to_owned()),
            last_seen_ip: None,
            last_seen_ts: None,
        }])
    }

    async fn get_device(&self, device_id: &DeviceId) -> HttpResult<ServerDevice> {
        Ok(ServerDevice {
            device_id: device_id.to_owned(),
            display_name: None,
            last_seen_ip: None,
            last_seen_ts: None,
        })
    }

    async fn set_device_name(&self, device_id: &DeviceId, display_name: &str) -> HttpResult<()> {
        self.renamed.lock().unwrap().push((device_id.to_owned(), display_name.to_owned()));
        Ok(())
    }

    async fn delete_device(&self, _device_id: &DeviceId, auth: Option<Value>) -> HttpResult<()> {
        match auth {
            Some(_) => Ok(()),
            None => Err(HttpError::Api {
                status_code: 401,
                errcode: "M_FORBIDDEN".to_owned(),
                message: "User-interactive authentication is required".to_owned(),
            }),
        }
    }
}
