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

//! Sending out the requests the Olm machine produces.

use futures_util::{stream, StreamExt};
use ruma::TransactionId;
use serde_json::{json, Value};
use tracing::{debug, instrument, trace, warn};

use super::CryptoService;
use crate::{
    engine::CryptoEngine,
    error::Result,
    requests::{
        AnyOutgoingRequest, KeysQueryRequest, KeysUploadRequest, OutgoingRequest, RequestType,
        ToDeviceRequest,
    },
};

impl CryptoService {
    /// Send out all the requests the Olm machine currently wants to send.
    ///
    /// Only one drain runs at a time, a concurrent call waits for the running
    /// one to finish. The requests of a drain are sent out concurrently, a
    /// failing request is logged and doesn't abort the others. Since it isn't
    /// marked as sent, the Olm machine hands it out again on the next drain.
    #[instrument(skip_all)]
    pub async fn send_outgoing_requests(&self) -> Result<()> {
        let machine = self.olm_machine()?;
        let _guard = self.inner.outgoing_requests_lock.lock().await;

        let requests = machine.outgoing_requests().await?;

        if requests.is_empty() {
            trace!("No outgoing requests to send");
            return Ok(());
        }

        debug!(request_count = requests.len(), "Sending out outgoing E2EE requests");

        let machine = &*machine;

        stream::iter(requests)
            .map(|r| async move {
                let result = self.send_outgoing_request(machine, &r).await;
                (r, result)
            })
            .buffer_unordered(self.inner.config.max_concurrent_requests.get())
            .for_each(|(r, result)| async move {
                if let Err(e) = result {
                    warn!(
                        request_id = ?r.request_id(),
                        request_type = ?r.request().request_type(),
                        error = ?e,
                        "Error when sending out an outgoing E2EE request",
                    );
                }
            })
            .await;

        Ok(())
    }

    /// Send a single request and hand the response back to the Olm machine.
    pub(crate) async fn send_outgoing_request(
        &self,
        machine: &dyn CryptoEngine,
        r: &OutgoingRequest,
    ) -> Result<()> {
        let api = &self.inner.api;

        match r.request() {
            AnyOutgoingRequest::KeysUpload(request) => {
                self.keys_upload(machine, r.request_id(), request).await?;
            }
            AnyOutgoingRequest::KeysQuery(request) => {
                self.keys_query(machine, r.request_id(), request).await?;
            }
            AnyOutgoingRequest::KeysClaim(request) => {
                let response = api.claim_keys(request).await?;
                machine
                    .mark_request_as_sent(r.request_id(), RequestType::KeysClaim, &response)
                    .await?;
            }
            AnyOutgoingRequest::ToDeviceRequest(request) => {
                self.send_to_device(machine, r.request_id(), request).await?;
            }
            AnyOutgoingRequest::SignatureUpload(request) => {
                let response = api.upload_signatures(request).await?;
                machine
                    .mark_request_as_sent(r.request_id(), RequestType::SignatureUpload, &response)
                    .await?;
            }
            AnyOutgoingRequest::RoomMessage(request) => {
                let response = api.send_room_message(request).await?;
                machine
                    .mark_request_as_sent(r.request_id(), RequestType::RoomMessage, &response)
                    .await?;
            }
            AnyOutgoingRequest::KeysBackup(request) => {
                let response = api.backup_room_keys(request).await?;
                machine
                    .mark_request_as_sent(r.request_id(), RequestType::KeysBackup, &response)
                    .await?;
            }
        }

        Ok(())
    }

    #[instrument(skip_all, fields(request_id = ?request_id))]
    async fn keys_upload(
        &self,
        machine: &dyn CryptoEngine,
        request_id: &TransactionId,
        request: &KeysUploadRequest,
    ) -> Result<Value> {
        debug!(
            device_keys = request.device_keys.is_some(),
            one_time_key_count = request.one_time_keys.len(),
            "Uploading public encryption keys",
        );

        let response = self.inner.api.upload_keys(request).await?;
        machine.mark_request_as_sent(request_id, RequestType::KeysUpload, &response).await?;

        Ok(response)
    }

    /// Download the device keys of the users in the request.
    ///
    /// The device update listeners are notified once the Olm machine processed
    /// the response.
    #[instrument(skip_all, fields(request_id = ?request_id))]
    async fn keys_query(
        &self,
        machine: &dyn CryptoEngine,
        request_id: &TransactionId,
        request: &KeysQueryRequest,
    ) -> Result<Value> {
        debug!(user_count = request.device_keys.len(), "Querying device keys");

        let response = self.inner.api.query_keys(request).await?;
        machine.mark_request_as_sent(request_id, RequestType::KeysQuery, &response).await?;

        self.notify_devices_updated(request.users().cloned().collect());

        Ok(response)
    }

    /// Send a to-device request, the server answers with an empty body.
    pub(crate) async fn send_to_device(
        &self,
        machine: &dyn CryptoEngine,
        request_id: &TransactionId,
        request: &ToDeviceRequest,
    ) -> Result<()> {
        trace!(
            event_type = %request.event_type,
            message_count = request.message_count(),
            "Sending a to-device request",
        );

        self.inner.api.send_to_device(request).await?;
        machine.mark_request_as_sent(request_id, RequestType::ToDevice, &json!({})).await?;

        Ok(())
    }
}
