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

//! Making sure every recipient has a room key before we encrypt.

use std::sync::Arc;

use futures_util::future::join_all;
use ruma::{OwnedUserId, RoomId};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::CryptoService;
use crate::{
    engine::CryptoEngine,
    error::Result,
    requests::{KeyRequestPair, OutgoingRequest},
    store::KeyRequestRecord,
};

impl CryptoService {
    /// Claim one-time keys for the devices of the given users we don't have
    /// an Olm session with yet.
    ///
    /// Claims are serialized over the whole session, one-time keys are a
    /// scarce resource and overlapping claims would waste them.
    pub(crate) async fn claim_missing_sessions(
        &self,
        machine: &dyn CryptoEngine,
        users: &[OwnedUserId],
    ) -> Result<()> {
        let _guard = self.inner.key_claim_lock.lock().await;

        if let Some((request_id, request)) = machine.get_missing_sessions(users).await? {
            debug!(device_count = request.device_count(), "Claiming one-time keys");

            let request = OutgoingRequest::new(request_id, request);
            self.send_outgoing_request(machine, &request).await?;
        }

        Ok(())
    }

    /// The lock serializing the key share of a single room, created on first
    /// use.
    fn group_session_lock(&self, room_id: &RoomId) -> Arc<Mutex<()>> {
        self.inner
            .group_session_locks
            .lock()
            .unwrap()
            .entry(room_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Share the current room key of the room with the given users.
    ///
    /// Missing Olm sessions are established first, then the room key is sent
    /// to every device that doesn't have it yet. Shares for the same room are
    /// serialized, shares for different rooms run concurrently.
    ///
    /// If any of the to-device requests fails the outbound group session of
    /// the room is discarded, using it would end up in undecryptable messages.
    #[instrument(skip_all, fields(room_id = ?room_id, user_count = users.len()))]
    pub async fn preshare_room_key(&self, room_id: &RoomId, users: &[OwnedUserId]) -> Result<()> {
        let machine = self.olm_machine()?;

        self.claim_missing_sessions(&*machine, users).await?;

        let lock = self.group_session_lock(room_id);
        let _guard = lock.lock().await;

        let settings = self.encryption_settings(room_id).await?;
        let requests = machine.share_room_key(room_id, users, settings).await?;

        if requests.is_empty() {
            return Ok(());
        }

        debug!(request_count = requests.len(), "Sharing the room key");

        let machine_ref = &*machine;
        let results = join_all(
            requests
                .iter()
                .map(|request| self.send_to_device(machine_ref, &request.txn_id, request)),
        )
        .await;

        if let Some(e) = results.into_iter().find_map(Result::err) {
            warn!(error = ?e, "Failed to share the room key, discarding the outbound session");
            machine.discard_room_key(room_id).await?;

            return Err(e);
        }

        Ok(())
    }

    /// Request the room key of an event we couldn't decrypt from our other
    /// devices and the sender, again.
    ///
    /// An outstanding request for the same room key is cancelled first. The
    /// request is recorded in the key request log of the store.
    #[instrument(skip_all, fields(room_id = ?room_id))]
    pub async fn re_request_room_key(&self, event: &Value, room_id: &RoomId) -> Result<()> {
        let machine = self.olm_machine()?;

        let KeyRequestPair { cancellation, key_request } =
            machine.request_room_key(event, room_id).await?;

        for request in cancellation.iter().chain([&key_request]) {
            if let Some(to_device) = request.request().to_device() {
                self.send_to_device(&*machine, request.request_id(), to_device).await?;
            }
        }

        let session_id = event
            .get("content")
            .and_then(|c| c.get("session_id"))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);

        let store = self.store()?;

        // The cancellation only names the superseded request in its content,
        // our own log tells us which one it was.
        let cancelled_request_id = if cancellation.is_some() {
            store
                .load_key_requests()
                .await?
                .into_iter()
                .rev()
                .find(|r| &*r.room_id == room_id && r.session_id == session_id)
                .map(|r| r.request_id)
        } else {
            None
        };

        let record = KeyRequestRecord {
            request_id: key_request.request_id().to_owned(),
            room_id: room_id.to_owned(),
            session_id,
            cancelled_request_id,
        };

        debug!(
            request_id = ?record.request_id,
            cancelled_request_id = ?record.cancelled_request_id,
            "Re-requested a room key",
        );

        store.save_key_request(record).await?;

        Ok(())
    }
}
