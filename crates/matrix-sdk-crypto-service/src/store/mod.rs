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

//! Types and traits to implement the storage layer for the
//! [`CryptoService`](crate::CryptoService).
//!
//! The [`CryptoStore`] keeps the E2EE bookkeeping that lives next to the Olm
//! machine's own state: which algorithm a room uses, whether invited members
//! receive room keys, the unverified device blacklist, the key request log and
//! the trail of gossiping events.

use std::fmt;

use async_trait::async_trait;
use ruma::{
    EventEncryptionAlgorithm, MilliSecondsSinceUnixEpoch, OwnedRoomId, OwnedTransactionId,
    OwnedUserId, RoomId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod memorystore;

pub use memorystore::MemoryStore;

/// A `CryptoStore` specific result type.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

/// The crypto store's error type.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// The store was used before it was opened, or after it was closed.
    #[error("the crypto store isn't open")]
    NotOpen,

    /// Error in the internal database
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    /// An error de/serializing type for the `StateStore`
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl CryptoStoreError {
    /// Create a new [`Backend`][Self::Backend] error.
    ///
    /// Shorthand for `CryptoStoreError::Backend(Box::new(error))`.
    #[inline]
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// A to-device event that was part of a key or secret gossiping exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GossipingEvent {
    /// The type of the event.
    pub event_type: String,
    /// The user that sent the event.
    pub sender: Option<OwnedUserId>,
    /// The full, decrypted, event.
    pub event: Value,
    /// When we received the event.
    pub received_at: MilliSecondsSinceUnixEpoch,
}

/// An entry of the outgoing key request log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequestRecord {
    /// The id of the to-device request that asked for the key.
    pub request_id: OwnedTransactionId,
    /// The room the requested session belongs to.
    pub room_id: OwnedRoomId,
    /// The id of the requested session, if the event told us.
    pub session_id: Option<String>,
    /// The id of the earlier request that this one superseded and cancelled.
    pub cancelled_request_id: Option<OwnedTransactionId>,
}

/// Trait abstracting a store that the [`CryptoService`](crate::CryptoService)
/// uses to persist its E2EE bookkeeping.
#[async_trait]
pub trait CryptoStore: fmt::Debug + Send + Sync {
    /// Open the store, must be called before any other method.
    async fn open(&self) -> Result<()>;

    /// Close the store, flushing anything that is pending.
    async fn close(&self) -> Result<()>;

    /// Get the encryption algorithm of the room, `None` if the room isn't
    /// encrypted.
    async fn get_room_algorithm(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<EventEncryptionAlgorithm>>;

    /// Store the encryption algorithm of the room.
    async fn set_room_algorithm(
        &self,
        room_id: &RoomId,
        algorithm: EventEncryptionAlgorithm,
    ) -> Result<()>;

    /// Should room keys of the room be shared with invited members as well.
    async fn should_encrypt_for_invited_members(&self, room_id: &RoomId) -> Result<bool>;

    /// Set whether room keys of the room should be shared with invited members.
    async fn set_should_encrypt_for_invited_members(
        &self,
        room_id: &RoomId,
        should_encrypt: bool,
    ) -> Result<()>;

    /// Should unverified devices be excluded from receiving room keys in every
    /// room.
    async fn get_global_blacklist_unverified_devices(&self) -> Result<bool>;

    /// Set the global unverified device blacklist flag.
    async fn set_global_blacklist_unverified_devices(&self, block: bool) -> Result<()>;

    /// Get the rooms that exclude unverified devices from receiving room keys.
    async fn get_rooms_blacklisting_unverified_devices(&self) -> Result<Vec<OwnedRoomId>>;

    /// Add or remove the room from the list of rooms that exclude unverified
    /// devices.
    async fn set_room_blacklist_unverified_devices(
        &self,
        room_id: &RoomId,
        block: bool,
    ) -> Result<()>;

    /// Append the given events to the gossiping trail.
    async fn save_gossiping_events(&self, events: &[GossipingEvent]) -> Result<()>;

    /// Load the whole gossiping trail, oldest first.
    async fn load_gossiping_events(&self) -> Result<Vec<GossipingEvent>>;

    /// Append an entry to the outgoing key request log.
    async fn save_key_request(&self, record: KeyRequestRecord) -> Result<()>;

    /// Load the outgoing key request log, oldest first.
    async fn load_key_requests(&self) -> Result<Vec<KeyRequestRecord>>;
}
