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

//! The [`CryptoService`], owner of the Olm machine of a logged in session.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    future::Future,
    sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak},
    time::Duration,
};

use futures_core::Stream;
use ruma::{
    DeviceId, EventEncryptionAlgorithm, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    api::{CryptoApi, ServerDevice},
    config::CryptoServiceConfig,
    engine::{
        CryptoEngine, CryptoEngineBuilder, DecryptedRoomEvent, DeviceInfo, EncryptionSettings,
        IdentityKeys, LocalTrust, RoomKeyImportResult, RoomKeyInfo,
    },
    error::{DecryptionError, EncryptionError, Error, KeyImportError, Result},
    events::{
        HistoryVisibility, MembershipState, RoomEncryptionEventContent,
        RoomHistoryVisibilityEventContent, RoomMemberEventContent, StateEvent, ROOM_ENCRYPTED,
        ROOM_ENCRYPTION, ROOM_HISTORY_VISIBILITY, ROOM_MEMBER,
    },
    key_export::{decrypt_room_key_export, encrypt_room_key_export},
    listeners::{DeviceUpdateListener, ListenerHandle, Listeners, NewSessionListener},
    store::{CryptoStore, GossipingEvent},
};

mod key_share;
mod outgoing;
mod sync;

/// The capacity of the broadcast channels backing the public streams.
const BROADCAST_CAPACITY: usize = 100;

/// The lifecycle state of the [`CryptoService`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    /// The service has been created but [`CryptoService::start()`] hasn't
    /// succeeded yet.
    NotStarted,
    /// [`CryptoService::start()`] is opening the store and the Olm machine.
    Starting,
    /// The Olm machine is ready, E2EE operations are possible.
    Started,
    /// The service has been closed, it can't be started again.
    Closed,
}

/// Where the Olm machine lives, it only exists in the started state.
enum Lifecycle {
    NotStarted,
    Starting,
    Started(Arc<dyn CryptoEngine>),
    Closed,
}

impl Lifecycle {
    fn state(&self) -> ServiceState {
        match self {
            Lifecycle::NotStarted => ServiceState::NotStarted,
            Lifecycle::Starting => ServiceState::Starting,
            Lifecycle::Started(_) => ServiceState::Started,
            Lifecycle::Closed => ServiceState::Closed,
        }
    }
}

/// An encrypted event content, ready to be sent into a room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedContent {
    /// The type of the event to send, always `m.room.encrypted`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The encrypted content.
    pub content: Value,
}

pub(crate) struct CryptoServiceInner {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    store: Arc<dyn CryptoStore>,
    api: Arc<dyn CryptoApi>,
    engine_builder: Arc<dyn CryptoEngineBuilder>,
    config: CryptoServiceConfig,

    lifecycle: StdRwLock<Lifecycle>,
    start_lock: Mutex<()>,

    /// Claiming one-time keys is serialized for the whole session.
    key_claim_lock: Mutex<()>,
    /// Sharing a room key is serialized per room, entries are never removed.
    group_session_locks: StdMutex<BTreeMap<OwnedRoomId, Arc<Mutex<()>>>>,
    /// Only one drain of the outgoing requests at a time.
    outgoing_requests_lock: Mutex<()>,
    /// Guards the check-and-set of a room's algorithm.
    encryption_state_lock: Mutex<()>,
    gossip_flush_lock: Mutex<()>,

    tracked_users: StdRwLock<BTreeSet<OwnedUserId>>,
    room_members: StdRwLock<BTreeMap<OwnedRoomId, BTreeMap<OwnedUserId, MembershipState>>>,
    room_settings: StdRwLock<BTreeMap<OwnedRoomId, RoomEncryptionEventContent>>,
    history_visibility: StdRwLock<BTreeMap<OwnedRoomId, HistoryVisibility>>,
    gossiping_buffer: StdMutex<Vec<GossipingEvent>>,

    tasks: StdMutex<Vec<JoinHandle<()>>>,

    new_session_listeners: Listeners<dyn NewSessionListener>,
    device_update_listeners: Listeners<dyn DeviceUpdateListener>,
    room_keys_sender: broadcast::Sender<Vec<RoomKeyInfo>>,
    device_updates_sender: broadcast::Sender<Vec<OwnedUserId>>,
}

/// Orchestrates the end-to-end encryption of a logged in session.
///
/// The service owns the Olm machine, created by [`CryptoService::start()`] and
/// dropped by [`CryptoService::close()`]. It keeps track of the encrypted
/// rooms and their members, makes sure room keys are shared before a message
/// is encrypted, sends out whatever the Olm machine wants to send and feeds
/// the E2EE parts of every sync into it.
///
/// The service is cheap to clone, all clones share the same state.
#[derive(Clone)]
pub struct CryptoService {
    inner: Arc<CryptoServiceInner>,
}

impl fmt::Debug for CryptoService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoService")
            .field("user_id", &self.inner.user_id)
            .field("device_id", &self.inner.device_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CryptoService {
    /// Create a new, not yet started, `CryptoService`.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user that owns the session.
    ///
    /// * `device_id` - The unique id of the device of the session.
    ///
    /// * `store` - The store that persists the E2EE bookkeeping, it's opened
    ///   by [`CryptoService::start()`].
    ///
    /// * `api` - The client used to talk to the homeserver.
    ///
    /// * `engine_builder` - Creates the Olm machine once the service starts.
    ///
    /// * `config` - The configuration of the service.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        store: Arc<dyn CryptoStore>,
        api: Arc<dyn CryptoApi>,
        engine_builder: Arc<dyn CryptoEngineBuilder>,
        config: CryptoServiceConfig,
    ) -> Self {
        let (room_keys_sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (device_updates_sender, _) = broadcast::channel(BROADCAST_CAPACITY);

        let inner = CryptoServiceInner {
            user_id,
            device_id,
            store,
            api,
            engine_builder,
            config,
            lifecycle: StdRwLock::new(Lifecycle::NotStarted),
            start_lock: Mutex::new(()),
            key_claim_lock: Mutex::new(()),
            group_session_locks: Default::default(),
            outgoing_requests_lock: Mutex::new(()),
            encryption_state_lock: Mutex::new(()),
            gossip_flush_lock: Mutex::new(()),
            tracked_users: Default::default(),
            room_members: Default::default(),
            room_settings: Default::default(),
            history_visibility: Default::default(),
            gossiping_buffer: Default::default(),
            tasks: Default::default(),
            new_session_listeners: Listeners::default(),
            device_update_listeners: Listeners::default(),
            room_keys_sender,
            device_updates_sender,
        };

        Self { inner: Arc::new(inner) }
    }

    fn from_weak(weak: &Weak<CryptoServiceInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// The unique id of the user that owns this service.
    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    /// The unique id of the device this service encrypts for.
    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    /// The current lifecycle state of the service.
    pub fn state(&self) -> ServiceState {
        self.inner.lifecycle.read().unwrap().state()
    }

    /// Is the Olm machine ready.
    pub fn is_started(&self) -> bool {
        self.state() == ServiceState::Started
    }

    /// Get the Olm machine, if the service has been started.
    pub(crate) fn olm_machine(&self) -> Result<Arc<dyn CryptoEngine>> {
        match &*self.inner.lifecycle.read().unwrap() {
            Lifecycle::Started(machine) => Ok(machine.clone()),
            Lifecycle::Closed => Err(Error::Closed),
            Lifecycle::NotStarted | Lifecycle::Starting => Err(Error::NotStarted),
        }
    }

    /// The store, once it has been opened by [`CryptoService::start()`].
    fn store(&self) -> Result<&dyn CryptoStore> {
        self.olm_machine()?;
        Ok(self.inner.store.as_ref())
    }

    /// Start the service.
    ///
    /// This opens the store, creates the Olm machine for our user and device
    /// and, unless disabled in the config, refreshes our own device list in
    /// the background.
    ///
    /// Concurrent calls are collapsed into a single initialization, calling
    /// this on a started service does nothing. If the initialization fails
    /// the service stays in the [`ServiceState::NotStarted`] state and the
    /// call can be retried.
    #[instrument(
        skip_all,
        fields(user_id = ?self.inner.user_id, device_id = ?self.inner.device_id)
    )]
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            ServiceState::Started => return Ok(()),
            ServiceState::Closed => return Err(Error::Closed),
            ServiceState::NotStarted | ServiceState::Starting => {}
        }

        let _guard = self.inner.start_lock.lock().await;

        // Someone else might have started, or closed, the service while we
        // waited for the lock.
        {
            let mut lifecycle = self.inner.lifecycle.write().unwrap();

            match &*lifecycle {
                Lifecycle::Started(_) => return Ok(()),
                Lifecycle::Closed => return Err(Error::Closed),
                Lifecycle::NotStarted | Lifecycle::Starting => *lifecycle = Lifecycle::Starting,
            }
        }

        match self.initialize().await {
            Ok(machine) => {
                let closed = {
                    let mut lifecycle = self.inner.lifecycle.write().unwrap();

                    if matches!(*lifecycle, Lifecycle::Closed) {
                        true
                    } else {
                        *lifecycle = Lifecycle::Started(machine);
                        false
                    }
                };

                if closed {
                    warn!("The crypto service was closed while it was starting");
                    self.inner.store.close().await?;
                    return Err(Error::Closed);
                }

                info!("The crypto service has been started");

                if self.inner.config.refresh_own_devices_on_start {
                    self.spawn_own_devices_refresh();
                }

                Ok(())
            }
            Err(e) => {
                error!(error = ?e, "Failed to start the crypto service");

                let mut lifecycle = self.inner.lifecycle.write().unwrap();

                if matches!(*lifecycle, Lifecycle::Starting) {
                    *lifecycle = Lifecycle::NotStarted;
                }

                Err(e)
            }
        }
    }

    async fn initialize(&self) -> Result<Arc<dyn CryptoEngine>> {
        self.inner.store.open().await?;

        match self.build_machine().await {
            Ok(machine) => Ok(machine),
            Err(e) => {
                if let Err(close_error) = self.inner.store.close().await {
                    warn!(error = ?close_error, "Failed to close the store after a failed start");
                }

                Err(e)
            }
        }
    }

    async fn build_machine(&self) -> Result<Arc<dyn CryptoEngine>> {
        let machine = self
            .inner
            .engine_builder
            .build(&self.inner.user_id, &self.inner.device_id, self.inner.store.clone())
            .await?;

        let tracked_users = machine.tracked_users().await?;
        self.inner.tracked_users.write().unwrap().extend(tracked_users);

        Ok(machine)
    }

    /// Close the service.
    ///
    /// Cancels the background work of the service, drops the Olm machine and
    /// closes the store. Safe to call on a service that never started, a
    /// closed service can't be started again.
    #[instrument(skip_all)]
    pub async fn close(&self) -> Result<()> {
        let previous =
            std::mem::replace(&mut *self.inner.lifecycle.write().unwrap(), Lifecycle::Closed);

        if matches!(previous, Lifecycle::Closed) {
            return Ok(());
        }

        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        drop(previous);

        self.inner.store.close().await?;

        info!("The crypto service has been closed");

        Ok(())
    }

    /// Spawn a task that is cancelled when the service gets closed.
    ///
    /// The task only gets a weak reference to the service, it's a no-op if
    /// the service is gone by the time it runs.
    fn spawn_task<F, Fut>(&self, f: F)
    where
        F: FnOnce(CryptoService) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let mut tasks = self.inner.tasks.lock().unwrap();

        if matches!(*self.inner.lifecycle.read().unwrap(), Lifecycle::Closed) {
            return;
        }

        tasks.retain(|task| !task.is_finished());
        tasks.push(tokio::spawn(async move {
            if let Some(service) = CryptoService::from_weak(&weak) {
                f(service).await;
            }
        }));
    }

    fn spawn_own_devices_refresh(&self) {
        self.spawn_task(|service| async move {
            let own_user = service.user_id().to_owned();

            if let Err(e) = service.download_keys(&[own_user], true).await {
                warn!(error = ?e, "Failed to refresh our own device list");
            }
        });
    }

    /// Our own identity keys.
    pub fn identity_keys(&self) -> Result<IdentityKeys> {
        Ok(self.olm_machine()?.identity_keys())
    }

    /// Handle a state event of a room.
    ///
    /// `m.room.encryption` events enable encryption in the room,
    /// `m.room.member` events update the tracked users and
    /// `m.room.history_visibility` events decide if invited members receive
    /// room keys. Other events are ignored.
    #[instrument(skip_all, fields(room_id = ?room_id, event_type = %event.event_type))]
    pub async fn on_state_event(&self, room_id: &RoomId, event: &StateEvent) -> Result<()> {
        match event.event_type.as_str() {
            ROOM_ENCRYPTION => {
                let content: RoomEncryptionEventContent = event.parse_content()?;
                self.on_room_encryption_event(room_id, content).await?;
            }
            ROOM_MEMBER => self.on_room_member_event(room_id, event).await?,
            ROOM_HISTORY_VISIBILITY => {
                let content: RoomHistoryVisibilityEventContent = event.parse_content()?;
                self.on_history_visibility_event(room_id, content.history_visibility).await?;
            }
            _ => {}
        }

        Ok(())
    }

    /// Handle an event of the live timeline, only state events are of
    /// interest.
    pub async fn on_live_event(&self, room_id: &RoomId, event: &StateEvent) -> Result<()> {
        if event.is_state() {
            self.on_state_event(room_id, event).await
        } else {
            Ok(())
        }
    }

    /// Enable encryption in the room.
    ///
    /// Returns `true` if the room is now encrypted because of this event. The
    /// first algorithm a room gets is final, a different one is rejected, as
    /// is any algorithm that isn't Megolm.
    async fn on_room_encryption_event(
        &self,
        room_id: &RoomId,
        content: RoomEncryptionEventContent,
    ) -> Result<bool> {
        let store = self.store()?;
        let algorithm = content.algorithm.clone();

        {
            let _guard = self.inner.encryption_state_lock.lock().await;

            if let Some(existing) = store.get_room_algorithm(room_id).await? {
                if existing != algorithm {
                    warn!(
                        ?existing,
                        requested = ?algorithm,
                        "Rejecting a change of the encryption algorithm of the room",
                    );
                }

                return Ok(false);
            }

            if algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
                warn!(?algorithm, "Not enabling encryption, the algorithm isn't supported");
                return Ok(false);
            }

            store.set_room_algorithm(room_id, algorithm).await?;
            self.inner.room_settings.write().unwrap().insert(room_id.to_owned(), content);
        }

        debug!("Encryption has been enabled in the room");

        let members = self.encryption_targets(room_id).await?;
        self.track_users(&members).await?;

        Ok(true)
    }

    async fn on_room_member_event(&self, room_id: &RoomId, event: &StateEvent) -> Result<()> {
        let Some(user_id) = event.member_user_id() else {
            warn!(state_key = ?event.state_key, "Member event with an invalid state key");
            return Ok(());
        };

        let content: RoomMemberEventContent = event.parse_content()?;

        self.inner
            .room_members
            .write()
            .unwrap()
            .entry(room_id.to_owned())
            .or_default()
            .insert(user_id.clone(), content.membership);

        if !self.is_room_encrypted(room_id).await? {
            return Ok(());
        }

        let should_track = match content.membership {
            MembershipState::Join => true,
            MembershipState::Invite => self.should_encrypt_for_invited_members(room_id).await?,
            _ => false,
        };

        if should_track {
            self.track_users(&[user_id]).await?;
        }

        Ok(())
    }

    async fn on_history_visibility_event(
        &self,
        room_id: &RoomId,
        history_visibility: HistoryVisibility,
    ) -> Result<()> {
        let store = self.store()?;

        self.inner
            .history_visibility
            .write()
            .unwrap()
            .insert(room_id.to_owned(), history_visibility);

        store
            .set_should_encrypt_for_invited_members(
                room_id,
                history_visibility != HistoryVisibility::Joined,
            )
            .await?;

        // Members that are already invited start receiving room keys now, we
        // need their devices.
        if self.is_room_encrypted(room_id).await?
            && self.should_encrypt_for_invited_members(room_id).await?
        {
            let members = self.encryption_targets(room_id).await?;
            self.track_users(&members).await?;
        }

        Ok(())
    }

    /// Add the given users to the set of tracked users.
    ///
    /// Only users that weren't tracked before are passed on to the Olm
    /// machine, which queues a keys query for them.
    pub(crate) async fn track_users(&self, users: &[OwnedUserId]) -> Result<()> {
        let machine = self.olm_machine()?;

        let new_users: Vec<OwnedUserId> = {
            let mut tracked = self.inner.tracked_users.write().unwrap();
            users.iter().filter(|u| tracked.insert((*u).clone())).cloned().collect()
        };

        if new_users.is_empty() {
            return Ok(());
        }

        debug!(user_count = new_users.len(), "Tracking the devices of new users");

        if let Err(e) = machine.update_tracked_users(&new_users).await {
            let mut tracked = self.inner.tracked_users.write().unwrap();

            for user in &new_users {
                tracked.remove(user);
            }

            return Err(e.into());
        }

        Ok(())
    }

    /// The users whose device lists we are tracking.
    pub fn tracked_users(&self) -> BTreeSet<OwnedUserId> {
        self.inner.tracked_users.read().unwrap().clone()
    }

    /// Is the room encrypted.
    pub async fn is_room_encrypted(&self, room_id: &RoomId) -> Result<bool> {
        Ok(self.get_encryption_algorithm(room_id).await?.is_some())
    }

    /// The encryption algorithm of the room, `None` if the room isn't
    /// encrypted.
    pub async fn get_encryption_algorithm(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<EventEncryptionAlgorithm>> {
        Ok(self.store()?.get_room_algorithm(room_id).await?)
    }

    /// Do invited members of the room receive room keys.
    ///
    /// Both the config of the service and the history visibility of the room
    /// need to allow it.
    pub async fn should_encrypt_for_invited_members(&self, room_id: &RoomId) -> Result<bool> {
        Ok(self.inner.config.encrypt_for_invited_members
            && self.store()?.should_encrypt_for_invited_members(room_id).await?)
    }

    /// The users a room key of the room needs to be shared with.
    async fn encryption_targets(&self, room_id: &RoomId) -> Result<Vec<OwnedUserId>> {
        let include_invited = self.should_encrypt_for_invited_members(room_id).await?;

        let members = self.inner.room_members.read().unwrap();

        Ok(members
            .get(room_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, membership)| match membership {
                        MembershipState::Join => true,
                        MembershipState::Invite => include_invited,
                        _ => false,
                    })
                    .map(|(user_id, _)| user_id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// The settings of the next group session of the room.
    async fn encryption_settings(&self, room_id: &RoomId) -> Result<EncryptionSettings> {
        let store = self.store()?;

        let only_allow_trusted_devices = store.get_global_blacklist_unverified_devices().await?
            || self.is_room_blacklist_unverified_devices(room_id).await?;

        let mut settings = EncryptionSettings {
            history_visibility: self
                .inner
                .history_visibility
                .read()
                .unwrap()
                .get(room_id)
                .copied()
                .unwrap_or(HistoryVisibility::Shared),
            only_allow_trusted_devices,
            ..Default::default()
        };

        if let Some(content) = self.inner.room_settings.read().unwrap().get(room_id) {
            if let Some(period) = content.rotation_period_ms {
                settings.rotation_period = Duration::from_millis(period);
            }

            if let Some(messages) = content.rotation_period_msgs {
                settings.rotation_period_msgs = messages;
            }
        }

        Ok(settings)
    }

    /// Encrypt a room event content.
    ///
    /// Makes sure that every member of the room that should be able to read
    /// the event has the current room key, then encrypts the content.
    ///
    /// # Arguments
    ///
    /// * `content` - The plaintext content of the event.
    ///
    /// * `event_type` - The plaintext type of the event.
    ///
    /// * `room_id` - The room the event is going to be sent to.
    ///
    /// # Errors
    ///
    /// Fails with [`EncryptionError::MissingAlgorithm`] if the room isn't
    /// encrypted, the content must not be sent in this case.
    #[instrument(skip_all, fields(room_id = ?room_id, event_type = event_type))]
    pub async fn encrypt_event_content(
        &self,
        content: &Value,
        event_type: &str,
        room_id: &RoomId,
    ) -> Result<EncryptedContent> {
        let machine = self.olm_machine()?;

        self.ensure_room_can_be_encrypted(room_id).await?;

        let users = self.encryption_targets(room_id).await?;
        self.preshare_room_key(room_id, &users).await?;

        let content = machine
            .encrypt_room_event_raw(room_id, event_type, content)
            .await
            .map_err(EncryptionError::from)?;

        Ok(EncryptedContent { event_type: ROOM_ENCRYPTED.to_owned(), content })
    }

    async fn ensure_room_can_be_encrypted(&self, room_id: &RoomId) -> Result<()> {
        let algorithm = {
            let _guard = self.inner.encryption_state_lock.lock().await;
            self.get_encryption_algorithm(room_id).await?
        };

        match algorithm {
            Some(EventEncryptionAlgorithm::MegolmV1AesSha2) => Ok(()),
            Some(algorithm) => Err(EncryptionError::UnsupportedAlgorithm(algorithm).into()),
            None => Err(EncryptionError::MissingAlgorithm(room_id.to_owned()).into()),
        }
    }

    /// Share the current room key of the room with its members, without
    /// encrypting anything.
    ///
    /// Useful to hide the latency of the key share, e.g. while the user is
    /// typing.
    pub async fn prepare_to_encrypt(&self, room_id: &RoomId) -> Result<()> {
        self.ensure_room_can_be_encrypted(room_id).await?;

        let users = self.encryption_targets(room_id).await?;
        self.preshare_room_key(room_id, &users).await
    }

    /// Discard the current outbound group session of the room, the next
    /// message creates and shares a new one.
    ///
    /// Returns `true` if a session was discarded.
    pub async fn discard_outbound_session(&self, room_id: &RoomId) -> Result<bool> {
        Ok(self.olm_machine()?.discard_room_key(room_id).await?)
    }

    /// Decrypt a `m.room.encrypted` event.
    ///
    /// # Arguments
    ///
    /// * `event` - The raw encrypted event.
    ///
    /// * `room_id` - The room the event was sent in.
    ///
    /// * `timeline_id` - An identifier of the timeline the event belongs to,
    ///   only used for logging.
    #[instrument(skip_all, fields(room_id = ?room_id, timeline_id = ?timeline_id))]
    pub async fn decrypt_event(
        &self,
        event: &Value,
        room_id: &RoomId,
        timeline_id: Option<&str>,
    ) -> Result<DecryptedRoomEvent, DecryptionError> {
        let machine = self.olm_machine().map_err(|e| match e {
            Error::Closed => DecryptionError::Closed,
            _ => DecryptionError::NotStarted,
        })?;

        machine.decrypt_room_event(event, room_id).await.map_err(|e| {
            let e = DecryptionError::from(e);
            debug!(error = ?e, retryable = e.is_retryable(), "Failed to decrypt a room event");
            e
        })
    }

    /// Get a device of a user, as we know it from the last keys query.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceInfo>> {
        Ok(self.olm_machine()?.get_device(user_id, device_id).await?)
    }

    /// Get all the known devices of a user.
    pub async fn get_user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceInfo>> {
        Ok(self.olm_machine()?.get_user_devices(user_id).await?)
    }

    /// Get our own device.
    pub async fn get_my_device(&self) -> Result<Option<DeviceInfo>> {
        self.get_device(&self.inner.user_id, &self.inner.device_id).await
    }

    /// Set the local trust of a device, e.g. after a manual verification.
    pub async fn set_local_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> Result<()> {
        self.olm_machine()?.set_local_trust(user_id, device_id, trust).await?;
        self.notify_devices_updated(vec![user_id.to_owned()]);

        Ok(())
    }

    /// Download the device keys of the given users.
    ///
    /// The users get tracked. With `force` set, a keys query is sent right
    /// away, otherwise the query goes out with the next drain of the outgoing
    /// requests.
    #[instrument(skip(self))]
    pub async fn download_keys(&self, users: &[OwnedUserId], force: bool) -> Result<()> {
        let machine = self.olm_machine()?;

        self.track_users(users).await?;

        if force {
            let request = machine.query_keys_for_users(users);
            self.send_outgoing_request(&*machine, &request).await?;
        }

        Ok(())
    }

    /// List the devices of our account, as the homeserver knows them.
    pub async fn fetch_devices_list(&self) -> Result<Vec<ServerDevice>> {
        Ok(self.inner.api.get_devices().await?)
    }

    /// Get a single device of our account from the homeserver.
    pub async fn fetch_device_info(&self, device_id: &DeviceId) -> Result<ServerDevice> {
        Ok(self.inner.api.get_device(device_id).await?)
    }

    /// Rename a device of our account.
    ///
    /// Our device list is refreshed in the background afterwards.
    pub async fn set_device_name(&self, device_id: &DeviceId, display_name: &str) -> Result<()> {
        self.inner.api.set_device_name(device_id, display_name).await?;

        if self.is_started() {
            self.spawn_own_devices_refresh();
        }

        Ok(())
    }

    /// Delete a device of our account.
    ///
    /// The homeserver will most likely ask for user-interactive
    /// authentication first, see [`HttpError::is_uia_required()`], retry with
    /// the `auth` data filled in.
    ///
    /// [`HttpError::is_uia_required()`]: crate::HttpError::is_uia_required
    pub async fn delete_device(&self, device_id: &DeviceId, auth: Option<Value>) -> Result<()> {
        Ok(self.inner.api.delete_device(device_id, auth).await?)
    }

    /// Should room keys only be shared with verified devices in all rooms.
    pub async fn get_global_blacklist_unverified_devices(&self) -> Result<bool> {
        Ok(self.store()?.get_global_blacklist_unverified_devices().await?)
    }

    /// Set whether room keys are only shared with verified devices in all
    /// rooms.
    pub async fn set_global_blacklist_unverified_devices(&self, block: bool) -> Result<()> {
        Ok(self.store()?.set_global_blacklist_unverified_devices(block).await?)
    }

    /// Are room keys of the room only shared with verified devices.
    ///
    /// This is the per-room flag, the global one applies on top of it.
    pub async fn is_room_blacklist_unverified_devices(&self, room_id: &RoomId) -> Result<bool> {
        Ok(self.blacklisted_rooms().await?.iter().any(|r| &**r == room_id))
    }

    /// Set whether room keys of the room are only shared with verified
    /// devices.
    pub async fn set_room_blacklist_unverified_devices(
        &self,
        room_id: &RoomId,
        block: bool,
    ) -> Result<()> {
        Ok(self.store()?.set_room_blacklist_unverified_devices(room_id, block).await?)
    }

    /// The rooms that only share room keys with verified devices.
    pub async fn blacklisted_rooms(&self) -> Result<Vec<OwnedRoomId>> {
        Ok(self.store()?.get_rooms_blacklisting_unverified_devices().await?)
    }

    /// Register a listener that gets notified when a new room key arrives.
    pub fn register_new_session_listener(
        &self,
        listener: Arc<dyn NewSessionListener>,
    ) -> ListenerHandle {
        self.inner.new_session_listeners.add(listener)
    }

    /// Unregister a listener, returns `false` if it wasn't registered.
    pub fn unregister_new_session_listener(&self, handle: ListenerHandle) -> bool {
        self.inner.new_session_listeners.remove(handle)
    }

    /// Register a listener that gets notified when the devices of some users
    /// change.
    pub fn register_device_update_listener(
        &self,
        listener: Arc<dyn DeviceUpdateListener>,
    ) -> ListenerHandle {
        self.inner.device_update_listeners.add(listener)
    }

    /// Unregister a listener, returns `false` if it wasn't registered.
    pub fn unregister_device_update_listener(&self, handle: ListenerHandle) -> bool {
        self.inner.device_update_listeners.remove(handle)
    }

    /// A stream of the room keys we receive, either over to-device messages
    /// or from a key import.
    ///
    /// A slow consumer will see a [`BroadcastStreamRecvError::Lagged`] and
    /// miss some keys.
    pub fn room_keys_received_stream(
        &self,
    ) -> impl Stream<Item = Result<Vec<RoomKeyInfo>, BroadcastStreamRecvError>> {
        BroadcastStream::new(self.inner.room_keys_sender.subscribe())
    }

    /// A stream of the users whose devices changed.
    pub fn device_updates_stream(
        &self,
    ) -> impl Stream<Item = Result<Vec<OwnedUserId>, BroadcastStreamRecvError>> {
        BroadcastStream::new(self.inner.device_updates_sender.subscribe())
    }

    pub(crate) fn notify_room_keys(&self, room_keys: Vec<RoomKeyInfo>) {
        if room_keys.is_empty() {
            return;
        }

        for key in &room_keys {
            self.inner
                .new_session_listeners
                .notify(|listener| listener.on_new_session(&key.room_id, &key.session_id));
        }

        // No receivers isn't an error.
        let _ = self.inner.room_keys_sender.send(room_keys);
    }

    pub(crate) fn notify_devices_updated(&self, users: Vec<OwnedUserId>) {
        if users.is_empty() {
            return;
        }

        self.inner.device_update_listeners.notify(|listener| listener.on_devices_updated(&users));
        let _ = self.inner.device_updates_sender.send(users);
    }

    /// Export all the room keys we have, encrypted with the given passphrase.
    ///
    /// The export can be imported by any Matrix client.
    #[instrument(skip_all)]
    pub async fn export_room_keys(&self, passphrase: &str) -> Result<Vec<u8>> {
        let keys = self.olm_machine()?.export_room_keys().await?;

        debug!(key_count = keys.len(), "Exporting room keys");

        let export =
            encrypt_room_key_export(&keys, passphrase, self.inner.config.key_export_rounds)?;

        Ok(export.into_bytes())
    }

    /// Import room keys from an export created by
    /// [`CryptoService::export_room_keys()`] or by another Matrix client.
    ///
    /// The listeners registered with
    /// [`CryptoService::register_new_session_listener()`] learn about every
    /// imported session.
    ///
    /// # Arguments
    ///
    /// * `export` - The armored export.
    ///
    /// * `passphrase` - The passphrase the export was encrypted with.
    ///
    /// * `progress_listener` - Called with the number of processed keys and
    ///   the total number of keys.
    #[instrument(skip_all)]
    pub async fn import_room_keys(
        &self,
        export: &[u8],
        passphrase: &str,
        progress_listener: impl Fn(usize, usize) + Send + Sync,
    ) -> Result<RoomKeyImportResult, KeyImportError> {
        let machine = self.olm_machine().map_err(|_| KeyImportError::NotStarted)?;

        let keys = decrypt_room_key_export(export, passphrase)?;
        let result = machine.import_room_keys(keys, &progress_listener).await?;

        info!(
            imported = result.imported_count,
            total = result.total_count,
            "Imported room keys from an export"
        );

        let room_keys = result
            .keys
            .iter()
            .flat_map(|(room_id, senders)| {
                senders.values().flatten().map(|session_id| RoomKeyInfo {
                    room_id: room_id.clone(),
                    session_id: session_id.clone(),
                })
            })
            .collect();

        self.notify_room_keys(room_keys);

        Ok(result)
    }
}
