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

use std::num::NonZeroUsize;

/// The default number of requests a single drain of the outgoing request queue
/// sends out concurrently.
const MAX_CONCURRENT_REQUESTS: NonZeroUsize = match NonZeroUsize::new(20) {
    Some(n) => n,
    None => unreachable!(),
};

/// The number of PBKDF2 rounds used to protect room key exports.
const KEY_EXPORT_ROUNDS: u32 = 500_000;

/// Configuration for the [`CryptoService`](crate::CryptoService).
///
/// # Examples
///
/// ```
/// use std::num::NonZeroUsize;
///
/// use matrix_sdk_crypto_service::CryptoServiceConfig;
///
/// let config = CryptoServiceConfig::new()
///     .encrypt_for_invited_members(false)
///     .max_concurrent_requests(NonZeroUsize::new(5).unwrap());
/// ```
#[derive(Clone, Copy, Debug)]
pub struct CryptoServiceConfig {
    pub(crate) encrypt_for_invited_members: bool,
    pub(crate) max_concurrent_requests: NonZeroUsize,
    pub(crate) key_export_rounds: u32,
    pub(crate) refresh_own_devices_on_start: bool,
}

impl Default for CryptoServiceConfig {
    fn default() -> Self {
        Self {
            encrypt_for_invited_members: true,
            max_concurrent_requests: MAX_CONCURRENT_REQUESTS,
            key_export_rounds: KEY_EXPORT_ROUNDS,
            refresh_own_devices_on_start: true,
        }
    }
}

impl CryptoServiceConfig {
    /// Create a new default `CryptoServiceConfig`.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    /// Should room keys be shared with invited members, in rooms whose history
    /// visibility allows them to read the messages. Enabled by default.
    ///
    /// When disabled, invited members only get room keys once they join.
    #[must_use]
    pub fn encrypt_for_invited_members(mut self, enabled: bool) -> Self {
        self.encrypt_for_invited_members = enabled;
        self
    }

    /// The number of outgoing requests a single drain sends out concurrently.
    #[must_use]
    pub fn max_concurrent_requests(mut self, limit: NonZeroUsize) -> Self {
        self.max_concurrent_requests = limit;
        self
    }

    /// The number of PBKDF2 rounds used to expand the passphrase of a room key
    /// export.
    #[must_use]
    pub fn key_export_rounds(mut self, rounds: u32) -> Self {
        self.key_export_rounds = rounds;
        self
    }

    /// Should the service download our own device list right after it has
    /// been started. Enabled by default.
    #[must_use]
    pub fn refresh_own_devices_on_start(mut self, enabled: bool) -> Self {
        self.refresh_own_devices_on_start = enabled;
        self
    }
}
