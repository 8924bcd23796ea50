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

//! Error conditions.

use ruma::{EventEncryptionAlgorithm, OwnedRoomId, OwnedTransactionId};
use serde_json::Error as JsonError;
use thiserror::Error;

pub use crate::{api::HttpError, key_export::KeyExportError, store::CryptoStoreError};
use crate::engine::WithheldCode;

/// Result type of the [`CryptoService`](crate::CryptoService).
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Result type of the operations a [`CryptoEngine`](crate::CryptoEngine)
/// performs.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Internal representation of errors.
#[derive(Error, Debug)]
pub enum Error {
    /// The operation needs an Olm machine but the service hasn't been started
    /// yet, or starting it failed.
    #[error("the crypto service hasn't been started")]
    NotStarted,

    /// The service was closed, no further E2EE operations are possible.
    #[error("the crypto service has been closed")]
    Closed,

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// The cryptographic engine returned an error.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// An error occurred while talking to the homeserver.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// An event couldn't be encrypted, it must not be sent.
    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    /// A room key export couldn't be created or read.
    #[error(transparent)]
    KeyExport(#[from] KeyExportError),

    /// An error de/serializing a JSON payload.
    #[error(transparent)]
    Json(#[from] JsonError),
}

/// Error type describing why an event couldn't be encrypted.
#[derive(Error, Debug)]
pub enum EncryptionError {
    /// No encryption algorithm has been configured for the room, we refuse to
    /// guess one.
    #[error("unable to encrypt, no algorithm is configured for the room {0}")]
    MissingAlgorithm(OwnedRoomId),

    /// The room uses an algorithm we can't encrypt with.
    #[error("unable to encrypt, the algorithm {0} isn't supported")]
    UnsupportedAlgorithm(EventEncryptionAlgorithm),

    /// The engine failed to encrypt the content.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors the [`CryptoEngine`](crate::CryptoEngine) reports for everything
/// besides room event decryption.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// A response or an event couldn't be de/serialized.
    #[error(transparent)]
    Json(#[from] JsonError),

    /// A response was passed back for a request the engine doesn't know about.
    #[error("the outgoing request {0} is unknown")]
    UnknownRequest(OwnedTransactionId),

    /// The engine has no outbound group session for the room, a room key needs
    /// to be shared first.
    #[error("no outbound group session exists for the room {0}")]
    MissingSession(OwnedRoomId),

    /// Any other failure inside the Olm machine.
    #[error("{0}")]
    Olm(String),
}

/// Error representing a failure during a group decryption operation, as
/// reported by the [`CryptoEngine`](crate::CryptoEngine).
#[derive(Error, Debug)]
pub enum MegolmError {
    /// Decryption failed because we're missing the room key that was used to
    /// encrypt the event.
    #[error("Can't find the room key to decrypt the event, withheld code: {0:?}")]
    MissingRoomKey(Option<WithheldCode>),

    /// We have the room key but it doesn't go back far enough to decrypt this
    /// message.
    #[error("the room key doesn't cover the message index of the event")]
    UnknownMessageIndex,

    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    JsonError(#[from] JsonError),

    /// The ciphertext couldn't be decrypted.
    #[error("{0}")]
    Decryption(String),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error type describing why an event couldn't be decrypted.
///
/// Callers can tell apart a decryption that is worth retrying once more keys
/// arrive from one that will never succeed using
/// [`DecryptionError::is_retryable()`].
#[derive(Error, Debug)]
pub enum DecryptionError {
    /// The room key is missing, if the sender withheld the key on purpose the
    /// code tells us why.
    #[error("the room key is missing, withheld code: {withheld_code:?}")]
    MissingRoomKey {
        /// The reason the sender gave for not sharing the key with us.
        withheld_code: Option<WithheldCode>,
    },

    /// We have a room key but it was ratcheted past the message.
    #[error("the room key doesn't cover the message index of the event")]
    UnknownMessageIndex,

    /// The ciphertext was rejected by the Megolm session.
    #[error("megolm decryption failed: {0}")]
    Megolm(String),

    /// The event doesn't look like an encrypted event.
    #[error("the encrypted event is malformed: {0}")]
    Malformed(#[from] JsonError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// The service isn't running.
    #[error("the crypto service hasn't been started")]
    NotStarted,

    /// The service has been closed, it won't decrypt anything anymore.
    #[error("the crypto service has been closed")]
    Closed,
}

impl DecryptionError {
    /// Is it worth trying to decrypt the event again later, i.e. once we
    /// received more room keys.
    pub fn is_retryable(&self) -> bool {
        match self {
            DecryptionError::MissingRoomKey { withheld_code } => withheld_code.is_none(),
            DecryptionError::UnknownMessageIndex
            | DecryptionError::Store(_)
            | DecryptionError::NotStarted => true,
            DecryptionError::Megolm(_)
            | DecryptionError::Malformed(_)
            | DecryptionError::Closed => false,
        }
    }
}

impl From<MegolmError> for DecryptionError {
    fn from(value: MegolmError) -> Self {
        match value {
            MegolmError::MissingRoomKey(withheld_code) => Self::MissingRoomKey { withheld_code },
            MegolmError::UnknownMessageIndex => Self::UnknownMessageIndex,
            MegolmError::JsonError(e) => Self::Malformed(e),
            MegolmError::Decryption(e) => Self::Megolm(e),
            MegolmError::Store(e) => Self::Store(e),
        }
    }
}

/// Error type for the room key import.
#[derive(Error, Debug)]
pub enum KeyImportError {
    /// The export couldn't be decrypted or parsed.
    #[error(transparent)]
    Export(#[from] KeyExportError),

    /// The decrypted export isn't a valid list of room keys.
    #[error(transparent)]
    Json(#[from] JsonError),

    /// The engine refused the keys.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The service isn't running.
    #[error("the crypto service hasn't been started")]
    NotStarted,
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;

    use super::*;

    #[test]
    fn test_withheld_error_mapping() {
        let inner_error = MegolmError::MissingRoomKey(Some(WithheldCode::Unverified));

        let error: DecryptionError = inner_error.into();

        assert_matches!(
            &error,
            DecryptionError::MissingRoomKey { withheld_code: Some(WithheldCode::Unverified) }
        );
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_missing_key_is_retryable() {
        let error: DecryptionError = MegolmError::MissingRoomKey(None).into();
        assert!(error.is_retryable());

        let error: DecryptionError = MegolmError::Decryption("bad mac".to_owned()).into();
        assert!(!error.is_retryable());
    }
}
