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

use std::collections::BTreeMap;

use ruma::MilliSecondsSinceUnixEpoch;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, instrument, trace, warn};

use super::CryptoService;
use crate::{
    engine::{DeviceLists, EncryptionSyncChanges, RoomKeyInfo},
    error::Result,
    events::{
        is_gossiping_event_type, RoomKeyContent, ToDeviceEventHeader, FORWARDED_ROOM_KEY, ROOM_KEY,
    },
    store::GossipingEvent,
};

impl CryptoService {
    /// Feed the E2EE related parts of a sync response into the Olm machine.
    ///
    /// Returns the to-device events, decrypted if they were encrypted. Every
    /// room key found in them is announced to the new session listeners.
    ///
    /// # Arguments
    ///
    /// * `to_device_events` - The to-device events of the sync.
    ///
    /// * `changed_devices` - The device lists delta of the sync.
    ///
    /// * `one_time_keys_counts` - The number of one-time keys the server still
    ///   has for us.
    ///
    /// * `unused_fallback_keys` - The fallback key algorithms that haven't
    ///   been used yet.
    #[instrument(skip_all, fields(to_device_count = to_device_events.len()))]
    pub async fn receive_sync_changes(
        &self,
        to_device_events: Vec<Value>,
        changed_devices: &DeviceLists,
        one_time_keys_counts: &BTreeMap<String, u64>,
        unused_fallback_keys: Option<&[String]>,
    ) -> Result<Vec<Value>> {
        let machine = self.olm_machine()?;

        let events = machine
            .receive_sync_changes(EncryptionSyncChanges {
                to_device_events,
                changed_devices,
                one_time_keys_counts,
                unused_fallback_keys,
            })
            .await?;

        let mut room_keys = Vec::new();
        let mut gossiping_events = Vec::new();

        for event in &events {
            let header = match ToDeviceEventHeader::deserialize(event) {
                Ok(header) => header,
                Err(e) => {
                    warn!(error = ?e, "Received a malformed to-device event");
                    continue;
                }
            };

            if matches!(header.event_type.as_str(), ROOM_KEY | FORWARDED_ROOM_KEY) {
                match event.get("content").map(RoomKeyContent::deserialize) {
                    Some(Ok(content)) => room_keys.push(RoomKeyInfo {
                        room_id: content.room_id,
                        session_id: content.session_id,
                    }),
                    _ => warn!(event_type = %header.event_type, "Received a malformed room key"),
                }
            }

            if is_gossiping_event_type(&header.event_type) {
                gossiping_events.push(GossipingEvent {
                    event_type: header.event_type,
                    sender: header.sender,
                    event: event.clone(),
                    received_at: MilliSecondsSinceUnixEpoch::now(),
                });
            }
        }

        if !gossiping_events.is_empty() {
            trace!(count = gossiping_events.len(), "Buffering gossiping events");
            self.inner.gossiping_buffer.lock().unwrap().extend(gossiping_events);
        }

        if !room_keys.is_empty() {
            debug!(count = room_keys.len(), "Received new room keys");
            self.notify_room_keys(room_keys);
        }

        self.notify_devices_updated(changed_devices.changed.clone());

        Ok(events)
    }

    /// Tell the service that a sync cycle has been completed.
    ///
    /// The gossiping events of the cycle are persisted in the background,
    /// then, if the service is started, the outgoing requests are sent out.
    /// A failure of either doesn't affect the other.
    pub async fn on_sync_completed(&self) {
        if self.is_started() {
            self.spawn_task(|service| async move {
                if let Err(e) = service.flush_gossiping_events().await {
                    warn!(error = ?e, "Failed to persist the gossiping events");
                }
            });

            if let Err(e) = self.send_outgoing_requests().await {
                error!(error = ?e, "Failed to send out the outgoing E2EE requests");
            }
        }
    }

    /// Persist the buffered gossiping events, then drop them from the buffer.
    ///
    /// Events that get buffered while the store writes are kept for the next
    /// flush.
    pub(crate) async fn flush_gossiping_events(&self) -> Result<()> {
        let _guard = self.inner.gossip_flush_lock.lock().await;

        let events = self.inner.gossiping_buffer.lock().unwrap().clone();

        if events.is_empty() {
            return Ok(());
        }

        self.store()?.save_gossiping_events(&events).await?;
        self.inner.gossiping_buffer.lock().unwrap().drain(..events.len());

        trace!(count = events.len(), "Persisted the gossiping events");

        Ok(())
    }
}
