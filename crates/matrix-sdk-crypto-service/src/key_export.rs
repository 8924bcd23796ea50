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

//! Passphrase protected room key exports.
//!
//! The format is the one described in the [key export] part of the Matrix
//! spec, so exports can be moved between clients.
//!
//! [key export]: https://spec.matrix.org/v1.8/client-server-api/#key-exports

use std::io::{Cursor, Read};

use aes::{
    cipher::{generic_array::GenericArray, KeyIvInit, StreamCipher},
    Aes256,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{BigEndian, ReadBytesExt};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac as _};
use pbkdf2::pbkdf2;
use rand::{thread_rng, RngCore};
use sha2::{Sha256, Sha512};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::engine::ExportedRoomKey;

const SALT_SIZE: usize = 16;
const IV_SIZE: usize = 16;
const MAC_SIZE: usize = 32;
const KEY_SIZE: usize = 32;
const VERSION: u8 = 1;

const HEADER: &str = "-----BEGIN MEGOLM SESSION DATA-----";
const FOOTER: &str = "-----END MEGOLM SESSION DATA-----";
const LINE_LENGTH: usize = 96;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Error representing a failure during key export or import.
#[derive(Error, Debug)]
pub enum KeyExportError {
    /// The key export doesn't contain valid headers.
    #[error("Invalid or missing key export headers.")]
    InvalidHeaders,
    /// The key export has been encrypted with an unsupported version.
    #[error("The key export has been encrypted with an unsupported version {0}.")]
    UnsupportedVersion(u8),
    /// The MAC of the encrypted payload is invalid, most likely the passphrase
    /// is wrong.
    #[error("The MAC of the encrypted payload is invalid.")]
    InvalidMac,
    /// The decrypted key export isn't valid UTF-8.
    #[error(transparent)]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    /// The key export isn't valid base64.
    #[error(transparent)]
    Decode(#[from] base64::DecodeError),
    /// The key export is truncated or couldn't be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The room keys couldn't be de/serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The AES-CTR-256 and HMAC-SHA-256 key pair a passphrase expands into.
#[derive(Zeroize, ZeroizeOnDrop)]
struct ExportKey {
    aes_key: Box<[u8; KEY_SIZE]>,
    mac_key: Box<[u8; KEY_SIZE]>,
}

impl ExportKey {
    fn from_passphrase(passphrase: &str, rounds: u32, salt: &[u8; SALT_SIZE]) -> Self {
        let mut expanded = Zeroizing::new([0u8; KEY_SIZE * 2]);

        pbkdf2::<Hmac<Sha512>>(passphrase.as_bytes(), salt, rounds, expanded.as_mut_slice())
            .expect(
                "We should be able to expand a passphrase of any length due to \
                 HMAC being able to be initialized with any input size",
            );

        let mut aes_key = Box::new([0u8; KEY_SIZE]);
        let mut mac_key = Box::new([0u8; KEY_SIZE]);

        aes_key.copy_from_slice(&expanded[..KEY_SIZE]);
        mac_key.copy_from_slice(&expanded[KEY_SIZE..]);

        Self { aes_key, mac_key }
    }

    fn apply_keystream(&self, data: &mut [u8], iv: &[u8; IV_SIZE]) {
        let mut cipher = Aes256Ctr::new(
            GenericArray::from_slice(self.aes_key.as_slice()),
            GenericArray::from_slice(iv),
        );
        cipher.apply_keystream(data);
    }

    fn hmac(&self) -> Hmac<Sha256> {
        Hmac::<Sha256>::new_from_slice(self.mac_key.as_slice())
            .expect("We should be able to create a new HMAC object from our 32 byte MAC key")
    }

    fn create_mac_tag(&self, message: &[u8]) -> [u8; MAC_SIZE] {
        let mut hmac = self.hmac();
        hmac.update(message);

        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&hmac.finalize().into_bytes());

        mac
    }

    fn verify_mac(&self, message: &[u8], mac: &[u8; MAC_SIZE]) -> Result<(), KeyExportError> {
        let mut hmac = self.hmac();
        hmac.update(message);
        hmac.verify_slice(mac).map_err(|_| KeyExportError::InvalidMac)
    }
}

/// Set bit 63 of the IV to 0, AES-CTR implementations differ in how they
/// handle a counter overflow.
fn clamp_iv(iv: [u8; IV_SIZE]) -> [u8; IV_SIZE] {
    let mut iv = u128::from_be_bytes(iv);
    iv &= !(1 << 63);
    iv.to_be_bytes()
}

/// Encrypt the given room keys with the passphrase and return the armored
/// export.
///
/// # Arguments
///
/// * `keys` - The room keys that should be exported.
///
/// * `passphrase` - The passphrase that will be used to encrypt the export.
///
/// * `rounds` - The number of PBKDF2 rounds used to expand the passphrase.
pub fn encrypt_room_key_export(
    keys: &[ExportedRoomKey],
    passphrase: &str,
    rounds: u32,
) -> Result<String, KeyExportError> {
    let plaintext = Zeroizing::new(serde_json::to_vec(keys)?);
    Ok(encrypt_payload(&plaintext, passphrase, rounds))
}

/// Decrypt an armored export created by [`encrypt_room_key_export()`], or by
/// any other Matrix client.
pub fn decrypt_room_key_export(
    export: impl Read,
    passphrase: &str,
) -> Result<Vec<ExportedRoomKey>, KeyExportError> {
    let payload = decrypt_payload(export, passphrase)?;
    Ok(serde_json::from_str(&payload)?)
}

fn encrypt_payload(plaintext: &[u8], passphrase: &str, rounds: u32) -> String {
    let mut rng = thread_rng();

    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];

    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    let iv = clamp_iv(iv);
    let key = ExportKey::from_passphrase(passphrase, rounds, &salt);

    let mut ciphertext = plaintext.to_vec();
    key.apply_keystream(&mut ciphertext, &iv);

    let mut payload = Vec::with_capacity(1 + SALT_SIZE + IV_SIZE + 4 + ciphertext.len() + MAC_SIZE);

    payload.push(VERSION);
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&iv);
    payload.extend_from_slice(&rounds.to_be_bytes());
    payload.extend_from_slice(&ciphertext);

    let mac = key.create_mac_tag(&payload);
    payload.extend_from_slice(&mac);

    let encoded = STANDARD.encode(payload);

    let mut armored = String::with_capacity(encoded.len() + encoded.len() / LINE_LENGTH + 80);
    armored.push_str(HEADER);
    armored.push('\n');

    for line in encoded.as_bytes().chunks(LINE_LENGTH) {
        // Base64 output is plain ASCII.
        armored.extend(line.iter().map(|b| *b as char));
        armored.push('\n');
    }

    armored.push_str(FOOTER);
    armored.push('\n');

    armored
}

fn decrypt_payload(mut export: impl Read, passphrase: &str) -> Result<String, KeyExportError> {
    let mut armored = String::new();
    export.read_to_string(&mut armored)?;

    let armored = armored.trim();

    let body = armored
        .strip_prefix(HEADER)
        .and_then(|rest| rest.strip_suffix(FOOTER))
        .ok_or(KeyExportError::InvalidHeaders)?;

    let encoded: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    let decoded = STANDARD.decode(encoded)?;

    if decoded.len() < 1 + SALT_SIZE + IV_SIZE + 4 + MAC_SIZE {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }

    let (message, mac) = decoded.split_at(decoded.len() - MAC_SIZE);

    let mut cursor = Cursor::new(message);

    let version = cursor.read_u8()?;

    if version != VERSION {
        return Err(KeyExportError::UnsupportedVersion(version));
    }

    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];

    cursor.read_exact(&mut salt)?;
    cursor.read_exact(&mut iv)?;

    let rounds = cursor.read_u32::<BigEndian>()?;
    let ciphertext_start = cursor.position() as usize;

    let mut mac_tag = [0u8; MAC_SIZE];
    mac_tag.copy_from_slice(mac);

    let key = ExportKey::from_passphrase(passphrase, rounds, &salt);
    key.verify_mac(message, &mac_tag)?;

    let mut plaintext = message[ciphertext_start..].to_vec();
    key.apply_keystream(&mut plaintext, &iv);

    Ok(String::from_utf8(plaintext)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use assert_matches2::assert_matches;
    use ruma::{owned_room_id, EventEncryptionAlgorithm};

    use super::*;

    const PASSPHRASE: &str = "1234";

    fn room_key(session_id: &str) -> ExportedRoomKey {
        ExportedRoomKey {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: owned_room_id!("!test:localhost"),
            sender_key: "FYOoKQSwe4d9jhTZ/LQCZFJINjPEqZ7Or4Z08reP92M".to_owned(),
            session_id: session_id.to_owned(),
            session_key: "AQAAAAC2XHVzsMBKs4QCRElJ92CJKyGtknCSC8HY7cQ7UYwndMKLQAejXLh5UA0l6s7"
                .to_owned(),
            sender_claimed_keys: BTreeMap::from([(
                "ed25519".to_owned(),
                "lij2YH5iVh6uO7ZSpE1e7MBSu2wVp9gP9K2UkBKp7bo".to_owned(),
            )]),
            forwarding_curve25519_key_chain: Vec::new(),
        }
    }

    #[test]
    fn test_clamp_iv() {
        let iv = [0xffu8; IV_SIZE];
        let clamped = clamp_iv(iv);

        assert_eq!(clamped[8], 0x7f);
        assert_eq!(&clamped[..8], &iv[..8]);
    }

    #[test]
    fn test_export_roundtrip() {
        let keys = vec![room_key("session1"), room_key("session2")];

        let export = encrypt_room_key_export(&keys, PASSPHRASE, 10).unwrap();

        assert!(export.starts_with(HEADER));
        assert!(export.trim_end().ends_with(FOOTER));
        assert!(export.lines().all(|line| line.len() <= LINE_LENGTH));

        let decrypted = decrypt_room_key_export(export.as_bytes(), PASSPHRASE).unwrap();

        assert_eq!(decrypted.len(), 2);
        assert_eq!(decrypted[0].session_id, "session1");
        assert_eq!(decrypted[1].session_key, keys[1].session_key);
    }

    #[test]
    fn test_wrong_passphrase() {
        let export = encrypt_room_key_export(&[room_key("session")], PASSPHRASE, 10).unwrap();

        assert_matches!(
            decrypt_room_key_export(export.as_bytes(), "wrong"),
            Err(KeyExportError::InvalidMac)
        );
    }

    #[test]
    fn test_invalid_headers() {
        assert_matches!(
            decrypt_room_key_export("not an export".as_bytes(), PASSPHRASE),
            Err(KeyExportError::InvalidHeaders)
        );
    }

    #[test]
    fn test_unsupported_version() {
        let export = encrypt_room_key_export(&[], PASSPHRASE, 10).unwrap();
        let body: String = export
            .lines()
            .filter(|line| !line.starts_with("-----"))
            .collect();

        let mut decoded = STANDARD.decode(body).unwrap();
        decoded[0] = 2;

        let export = format!("{HEADER}\n{}\n{FOOTER}\n", STANDARD.encode(decoded));

        assert_matches!(
            decrypt_room_key_export(export.as_bytes(), PASSPHRASE),
            Err(KeyExportError::UnsupportedVersion(2))
        );
    }
}
