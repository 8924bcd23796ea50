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

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        RwLock as StdRwLock,
    },
};

use async_trait::async_trait;
use ruma::{EventEncryptionAlgorithm, OwnedRoomId, RoomId};

use super::{CryptoStore, CryptoStoreError, GossipingEvent, KeyRequestRecord, Result};

/// An in-memory only store that will forget all the E2EE bookkeeping once it's
/// dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    open: AtomicBool,
    room_algorithms: StdRwLock<BTreeMap<OwnedRoomId, EventEncryptionAlgorithm>>,
    encrypt_for_invited: StdRwLock<BTreeMap<OwnedRoomId, bool>>,
    global_blacklist_unverified: AtomicBool,
    blacklisted_rooms: StdRwLock<BTreeSet<OwnedRoomId>>,
    gossiping_events: StdRwLock<Vec<GossipingEvent>>,
    key_requests: StdRwLock<Vec<KeyRequestRecord>>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Is the store currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CryptoStoreError::NotOpen)
        }
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_room_algorithm(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<EventEncryptionAlgorithm>> {
        self.ensure_open()?;
        Ok(self.room_algorithms.read().unwrap().get(room_id).cloned())
    }

    async fn set_room_algorithm(
        &self,
        room_id: &RoomId,
        algorithm: EventEncryptionAlgorithm,
    ) -> Result<()> {
        self.ensure_open()?;
        self.room_algorithms.write().unwrap().insert(room_id.to_owned(), algorithm);
        Ok(())
    }

    async fn should_encrypt_for_invited_members(&self, room_id: &RoomId) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.encrypt_for_invited.read().unwrap().get(room_id).copied().unwrap_or(false))
    }

    async fn set_should_encrypt_for_invited_members(
        &self,
        room_id: &RoomId,
        should_encrypt: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        self.encrypt_for_invited.write().unwrap().insert(room_id.to_owned(), should_encrypt);
        Ok(())
    }

    async fn get_global_blacklist_unverified_devices(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.global_blacklist_unverified.load(Ordering::SeqCst))
    }

    async fn set_global_blacklist_unverified_devices(&self, block: bool) -> Result<()> {
        self.ensure_open()?;
        self.global_blacklist_unverified.store(block, Ordering::SeqCst);
        Ok(())
    }

    async fn get_rooms_blacklisting_unverified_devices(&self) -> Result<Vec<OwnedRoomId>> {
        self.ensure_open()?;
        Ok(self.blacklisted_rooms.read().unwrap().iter().cloned().collect())
    }

    async fn set_room_blacklist_unverified_devices(
        &self,
        room_id: &RoomId,
        block: bool,
    ) -> Result<()> {
        self.ensure_open()?;

        let mut rooms = self.blacklisted_rooms.write().unwrap();

        if block {
            rooms.insert(room_id.to_owned());
        } else {
            rooms.remove(room_id);
        }

        Ok(())
    }

    async fn save_gossiping_events(&self, events: &[GossipingEvent]) -> Result<()> {
        self.ensure_open()?;
        self.gossiping_events.write().unwrap().extend_from_slice(events);
        Ok(())
    }

    async fn load_gossiping_events(&self) -> Result<Vec<GossipingEvent>> {
        self.ensure_open()?;
        Ok(self.gossiping_events.read().unwrap().clone())
    }

    async fn save_key_request(&self, record: KeyRequestRecord) -> Result<()> {
        self.ensure_open()?;
        self.key_requests.write().unwrap().push(record);
        Ok(())
    }

    async fn load_key_requests(&self) -> Result<Vec<KeyRequestRecord>> {
        self.ensure_open()?;
        Ok(self.key_requests.read().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use ruma::{room_id, EventEncryptionAlgorithm};

    use super::*;

    #[tokio::test]
    async fn test_store_must_be_opened() {
        let store = MemoryStore::new();
        let room_id = room_id!("!test:localhost");

        assert_matches!(store.get_room_algorithm(room_id).await, Err(CryptoStoreError::NotOpen));

        store.open().await.unwrap();
        assert!(store.get_room_algorithm(room_id).await.unwrap().is_none());

        store.close().await.unwrap();
        assert!(!store.is_open());
    }

    #[tokio::test]
    async fn test_room_settings() {
        let store = MemoryStore::new();
        store.open().await.unwrap();

        let room_id = room_id!("!test:localhost");

        store.set_room_algorithm(room_id, EventEncryptionAlgorithm::MegolmV1AesSha2).await.unwrap();
        assert_eq!(
            store.get_room_algorithm(room_id).await.unwrap(),
            Some(EventEncryptionAlgorithm::MegolmV1AesSha2)
        );

        assert!(!store.should_encrypt_for_invited_members(room_id).await.unwrap());
        store.set_should_encrypt_for_invited_members(room_id, true).await.unwrap();
        assert!(store.should_encrypt_for_invited_members(room_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_blacklisted_rooms() {
        let store = MemoryStore::new();
        store.open().await.unwrap();

        let room_id = room_id!("!test:localhost");

        store.set_room_blacklist_unverified_devices(room_id, true).await.unwrap();
        assert_eq!(
            store.get_rooms_blacklisting_unverified_devices().await.unwrap(),
            vec![room_id.to_owned()]
        );

        store.set_room_blacklist_unverified_devices(room_id, false).await.unwrap();
        assert!(store.get_rooms_blacklisting_unverified_devices().await.unwrap().is_empty());
    }
}
