//! The encryption envelope: hybrid per-message encryption.
//!
//! Sending encrypts the plaintext once with a fresh symmetric content key,
//! then wraps that key separately for every recipient:
//! 1. Generate a random 32-byte content key and 12-byte IV
//! 2. Encrypt the plaintext with ChaCha20-Poly1305 under the content key
//! 3. For each recipient public key: fresh ephemeral X25519 keypair → ECDH
//!    → HKDF-SHA256 → ChaCha20-Poly1305 over the content key
//! 4. Assemble ciphertext + IV + the per-recipient wrapped-key map
//!
//! Wrapped keys are stored under the *recipient's* username, plus one
//! reserved `"self"` entry wrapped under the sender's own key so the sender
//! can re-read its own messages. An envelope is immutable once built and
//! carries no plaintext; a recipient missing from the map at send time can
//! never decrypt it, there is no retroactive re-wrap.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;
use x25519_dalek::{PublicKey, StaticSecret};

use sotto_core::{ChatError, ChatResult};

use crate::directory::KeyDirectory;
use crate::keys::DeviceKeys;

/// Reserved wrapped-key slot for the sender's own copy.
pub const SELF_SLOT: &str = "self";

/// HKDF salt for content-key wrapping.
const WRAP_SALT: &[u8] = b"SOTTO-WRAP-V1";
/// HKDF info label for content-key wrapping.
const WRAP_INFO: &[u8] = b"content-key";

/// A content key wrapped for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKey {
    /// Ephemeral X25519 public key used for this recipient (base64, 32 bytes).
    pub ephemeral_public: String,
    /// Wrapped content key: nonce followed by AEAD ciphertext (base64).
    pub encrypted_key: String,
}

/// The bundle sent in place of plaintext, carried opaquely in
/// `encryptedMessage`. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// AEAD ciphertext of the plaintext (base64).
    pub ciphertext: String,
    /// Content-key nonce, unique per envelope (base64, 12 bytes).
    pub iv: String,
    /// Recipient identifier → wrapped content key.
    pub wrapped_keys: BTreeMap<String, WrappedKey>,
}

impl Envelope {
    pub fn to_json(&self) -> ChatResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> ChatResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Encrypt `plaintext` for every key in the directory plus the sender.
///
/// A recipient whose wrap fails is logged and omitted — it simply cannot
/// decrypt this envelope, same as a recipient whose key was never learned.
/// Failing to wrap for the sender itself is an error: an envelope the
/// author cannot re-read is useless.
pub fn seal(
    plaintext: &[u8],
    keys: &DeviceKeys,
    directory: &KeyDirectory,
) -> ChatResult<Envelope> {
    let mut content_key = [0u8; 32];
    OsRng.fill_bytes(&mut content_key);
    let mut iv = [0u8; 12];
    OsRng.fill_bytes(&mut iv);

    let cipher = ChaCha20Poly1305::new_from_slice(&content_key)
        .map_err(|_| ChatError::Crypto("invalid content key length".into()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| ChatError::Crypto(format!("content encryption failed: {e}")))?;

    let mut wrapped_keys = BTreeMap::new();
    for (username, public_key) in directory.iter() {
        match wrap_content_key(&content_key, public_key) {
            Ok(wrapped) => {
                wrapped_keys.insert(username.clone(), wrapped);
            }
            Err(e) => {
                warn!(recipient = %username, error = %e, "skipping recipient: wrap failed");
            }
        }
    }
    wrapped_keys.insert(
        SELF_SLOT.to_string(),
        wrap_content_key(&content_key, keys.public_key())?,
    );

    Ok(Envelope {
        ciphertext: BASE64.encode(&ciphertext),
        iv: BASE64.encode(iv),
        wrapped_keys,
    })
}

/// Decrypt an envelope using the wrapped key stored under `slot`.
pub fn open(envelope: &Envelope, slot: &str, keys: &DeviceKeys) -> ChatResult<Vec<u8>> {
    let wrapped = envelope
        .wrapped_keys
        .get(slot)
        .ok_or_else(|| ChatError::Crypto(format!("no wrapped key for recipient {slot:?}")))?;

    let content_key = unwrap_content_key(wrapped, keys)?;

    let iv = BASE64
        .decode(&envelope.iv)
        .map_err(|e| ChatError::Crypto(format!("iv is not valid base64: {e}")))?;
    if iv.len() != 12 {
        return Err(ChatError::Crypto("iv must be 12 bytes".into()));
    }
    let ciphertext = BASE64
        .decode(&envelope.ciphertext)
        .map_err(|e| ChatError::Crypto(format!("ciphertext is not valid base64: {e}")))?;

    let cipher = ChaCha20Poly1305::new_from_slice(&content_key)
        .map_err(|_| ChatError::Crypto("invalid content key length".into()))?;
    cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|e| ChatError::Crypto(format!("content decryption failed: {e}")))
}

/// Wrap a content key under one recipient public key.
fn wrap_content_key(content_key: &[u8; 32], recipient: &PublicKey) -> ChatResult<WrappedKey> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);

    let wrap_key = derive_wrap_key(shared.as_bytes())?;

    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new_from_slice(&wrap_key)
        .map_err(|_| ChatError::Crypto("invalid wrap key length".into()))?;
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), content_key.as_ref())
        .map_err(|e| ChatError::Crypto(format!("key wrap failed: {e}")))?;

    let mut encrypted_key = Vec::with_capacity(12 + sealed.len());
    encrypted_key.extend_from_slice(&nonce);
    encrypted_key.extend(sealed);

    Ok(WrappedKey {
        ephemeral_public: BASE64.encode(ephemeral_public.as_bytes()),
        encrypted_key: BASE64.encode(encrypted_key),
    })
}

/// Recover a content key wrapped for this device.
fn unwrap_content_key(wrapped: &WrappedKey, keys: &DeviceKeys) -> ChatResult<[u8; 32]> {
    let ephemeral_bytes = BASE64
        .decode(&wrapped.ephemeral_public)
        .map_err(|e| ChatError::Crypto(format!("ephemeral key is not valid base64: {e}")))?;
    let ephemeral_arr: [u8; 32] = ephemeral_bytes
        .try_into()
        .map_err(|_| ChatError::Crypto("ephemeral key must be 32 bytes".into()))?;
    let ephemeral_public = PublicKey::from(ephemeral_arr);

    let shared = keys.diffie_hellman(&ephemeral_public);
    let wrap_key = derive_wrap_key(shared.as_bytes())?;

    let sealed = BASE64
        .decode(&wrapped.encrypted_key)
        .map_err(|e| ChatError::Crypto(format!("wrapped key is not valid base64: {e}")))?;
    if sealed.len() < 12 {
        return Err(ChatError::Crypto("wrapped key too short".into()));
    }
    let (nonce, body) = sealed.split_at(12);

    let cipher = ChaCha20Poly1305::new_from_slice(&wrap_key)
        .map_err(|_| ChatError::Crypto("invalid wrap key length".into()))?;
    let unsealed = cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|e| ChatError::Crypto(format!("key unwrap failed: {e}")))?;

    let content_key: [u8; 32] = unsealed
        .try_into()
        .map_err(|_| ChatError::Crypto("content key must be 32 bytes".into()))?;
    Ok(content_key)
}

fn derive_wrap_key(shared_secret: &[u8]) -> ChatResult<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(WRAP_SALT), shared_secret);
    let mut key = [0u8; 32];
    hk.expand(WRAP_INFO, &mut key)
        .map_err(|_| ChatError::Crypto("HKDF expand failed".into()))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory_with(entries: &[(&str, &DeviceKeys)]) -> KeyDirectory {
        let mut dir = KeyDirectory::new();
        for (name, keys) in entries {
            dir.insert(name, &keys.export_public()).unwrap();
        }
        dir
    }

    #[test]
    fn sender_can_reopen_its_own_envelope() {
        let sender = DeviceKeys::generate();
        let envelope = seal(b"ciao a tutti", &sender, &KeyDirectory::new()).unwrap();

        let plaintext = open(&envelope, SELF_SLOT, &sender).unwrap();
        assert_eq!(plaintext, b"ciao a tutti");
    }

    #[test]
    fn each_listed_recipient_can_decrypt() {
        let sender = DeviceKeys::generate();
        let bob = DeviceKeys::generate();
        let cat = DeviceKeys::generate();
        let dir = directory_with(&[("Bob", &bob), ("Cat", &cat)]);

        let envelope = seal(b"group secret", &sender, &dir).unwrap();
        assert_eq!(envelope.wrapped_keys.len(), 3);

        assert_eq!(open(&envelope, "Bob", &bob).unwrap(), b"group secret");
        assert_eq!(open(&envelope, "Cat", &cat).unwrap(), b"group secret");
    }

    #[test]
    fn recipient_absent_at_send_time_can_never_decrypt() {
        let sender = DeviceKeys::generate();
        let bob = DeviceKeys::generate();
        let late = DeviceKeys::generate();
        let dir = directory_with(&[("Bob", &bob)]);

        let envelope = seal(b"too late", &sender, &dir).unwrap();

        // No slot exists for the latecomer, and no other slot unwraps
        // under its key.
        assert!(open(&envelope, "Late", &late).is_err());
        assert!(open(&envelope, "Bob", &late).is_err());
        assert!(open(&envelope, SELF_SLOT, &late).is_err());
    }

    #[test]
    fn wrong_slot_or_wrong_key_fails_closed() {
        let sender = DeviceKeys::generate();
        let bob = DeviceKeys::generate();
        let dir = directory_with(&[("Bob", &bob)]);

        let envelope = seal(b"secret", &sender, &dir).unwrap();
        // Bob cannot unwrap the sender's self slot.
        assert!(open(&envelope, SELF_SLOT, &bob).is_err());
        // The sender cannot unwrap Bob's slot.
        assert!(open(&envelope, "Bob", &sender).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let sender = DeviceKeys::generate();
        let mut envelope = seal(b"integrity", &sender, &KeyDirectory::new()).unwrap();

        let mut raw = BASE64.decode(&envelope.ciphertext).unwrap();
        raw[0] ^= 0xFF;
        envelope.ciphertext = BASE64.encode(&raw);

        assert!(open(&envelope, SELF_SLOT, &sender).is_err());
    }

    #[test]
    fn ivs_and_wrapped_keys_are_fresh_per_envelope() {
        let sender = DeviceKeys::generate();
        let bob = DeviceKeys::generate();
        let dir = directory_with(&[("Bob", &bob)]);

        let first = seal(b"one", &sender, &dir).unwrap();
        let second = seal(b"one", &sender, &dir).unwrap();

        assert_ne!(first.iv, second.iv);
        assert_ne!(first.ciphertext, second.ciphertext);
        assert_ne!(
            first.wrapped_keys["Bob"].ephemeral_public,
            second.wrapped_keys["Bob"].ephemeral_public
        );
    }

    #[test]
    fn envelope_json_round_trips() {
        let sender = DeviceKeys::generate();
        let envelope = seal(b"wire format", &sender, &KeyDirectory::new()).unwrap();

        let json = envelope.to_json().unwrap();
        assert!(json.contains("wrappedKeys"));
        assert!(json.contains("ephemeralPublic"));

        let parsed = Envelope::from_json(&json).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(open(&parsed, SELF_SLOT, &sender).unwrap(), b"wire format");
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let sender = DeviceKeys::generate();
        let envelope = seal(b"", &sender, &KeyDirectory::new()).unwrap();
        assert_eq!(open(&envelope, SELF_SLOT, &sender).unwrap(), b"");
    }
}
