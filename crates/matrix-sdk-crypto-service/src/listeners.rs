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

//! Callbacks for parties that want to learn about new room keys and device
//! list changes without polling.

use std::{
    collections::BTreeMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock as StdRwLock,
    },
};

use ruma::{OwnedUserId, RoomId};
use tracing::warn;

/// Gets notified when a room key arrives, either over to-device messages or
/// through a key import.
///
/// Events of the room that failed to decrypt with this session can be retried.
pub trait NewSessionListener: Send + Sync {
    /// A new inbound group session for the room is available.
    fn on_new_session(&self, room_id: &RoomId, session_id: &str);
}

/// Gets notified when the device list of some users changed.
pub trait DeviceUpdateListener: Send + Sync {
    /// The devices of the given users were updated.
    fn on_devices_updated(&self, users: &[OwnedUserId]);
}

impl<F> NewSessionListener for F
where
    F: Fn(&RoomId, &str) + Send + Sync,
{
    fn on_new_session(&self, room_id: &RoomId, session_id: &str) {
        self(room_id, session_id)
    }
}

impl<F> DeviceUpdateListener for F
where
    F: Fn(&[OwnedUserId]) + Send + Sync,
{
    fn on_devices_updated(&self, users: &[OwnedUserId]) {
        self(users)
    }
}

/// Handle returned when registering a listener, used to unregister it again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerHandle(u64);

/// A set of listeners of the same kind.
pub(crate) struct Listeners<L: ?Sized> {
    next_handle: AtomicU64,
    listeners: StdRwLock<BTreeMap<ListenerHandle, Arc<L>>>,
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self { next_handle: AtomicU64::new(0), listeners: Default::default() }
    }
}

impl<L: ?Sized> fmt::Debug for Listeners<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("count", &self.len()).finish()
    }
}

impl<L: ?Sized> Listeners<L> {
    pub(crate) fn add(&self, listener: Arc<L>) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().unwrap().insert(handle, listener);
        handle
    }

    pub(crate) fn remove(&self, handle: ListenerHandle) -> bool {
        self.listeners.write().unwrap().remove(&handle).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().unwrap().len()
    }

    /// Call `f` for every registered listener.
    ///
    /// The listeners are snapshotted first, so a listener may unregister
    /// itself while being notified. A panicking listener is logged and
    /// skipped.
    pub(crate) fn notify(&self, f: impl Fn(&L)) {
        let listeners: Vec<_> = self.listeners.read().unwrap().values().cloned().collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| f(&*listener))).is_err() {
                warn!("A listener panicked while being notified");
            }
        }
    }
}
