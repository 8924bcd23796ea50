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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_debug_implementations, missing_docs)]

mod api;
mod config;
mod engine;
mod error;
pub mod events;
mod key_export;
mod listeners;
pub mod requests;
mod service;
pub mod store;
#[cfg(test)]
mod testing;

pub use api::{CryptoApi, HttpError, HttpResult, ServerDevice};
pub use config::CryptoServiceConfig;
pub use engine::{
    CryptoEngine, CryptoEngineBuilder, DecryptedRoomEvent, DeviceInfo, DeviceLists,
    EncryptionSettings, EncryptionSyncChanges, ExportedRoomKey, IdentityKeys, LocalTrust,
    RoomKeyImportResult, RoomKeyInfo, WithheldCode,
};
pub use error::{
    DecryptionError, EncryptionError, EngineError, EngineResult, Error, KeyImportError,
    MegolmError, Result,
};
pub use key_export::{decrypt_room_key_export, encrypt_room_key_export, KeyExportError};
pub use listeners::{DeviceUpdateListener, ListenerHandle, NewSessionListener};
pub use service::{CryptoService, EncryptedContent, ServiceState};
pub use store::{CryptoStore, CryptoStoreError, MemoryStore};
pub use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
