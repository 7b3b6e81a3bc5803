//! The key directory: username → ready-to-wrap-with public key.
//!
//! Populated from the relay's presence broadcasts. Last writer wins: a
//! later broadcast for the same username silently overwrites the stored
//! key — the relay is not a trust authority and neither is this map.

use std::collections::HashMap;

use tracing::{debug, warn};
use x25519_dalek::PublicKey;

use sotto_core::messages::UserEntry;
use sotto_core::ChatResult;

use crate::keys::decode_public_key;

/// Public keys of the peers this client can currently encrypt for.
#[derive(Debug, Default)]
pub struct KeyDirectory {
    entries: HashMap<String, PublicKey>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Import and store a peer's key. Overwrites any previous entry.
    pub fn insert(&mut self, username: &str, encoded: &str) -> ChatResult<()> {
        let key = decode_public_key(encoded)?;
        debug!(username, "stored peer public key");
        self.entries.insert(username.to_string(), key);
        Ok(())
    }

    /// Ingest a presence snapshot, skipping this client's own entry.
    ///
    /// Entries without a key or with an un-importable key are skipped; a
    /// peer that never published a usable key simply cannot be encrypted
    /// for.
    pub fn ingest_roster(&mut self, users: &[UserEntry], own_username: &str) {
        for user in users {
            if user.username == own_username {
                continue;
            }
            let Some(encoded) = user.public_key.as_deref() else {
                continue;
            };
            if let Err(e) = self.insert(&user.username, encoded) {
                warn!(username = %user.username, error = %e, "ignoring unusable peer key");
            }
        }
    }

    pub fn get(&self, username: &str) -> Option<&PublicKey> {
        self.entries.get(username)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.entries.contains_key(username)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PublicKey)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything (session end).
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DeviceKeys;

    fn entry(username: &str, keys: Option<&DeviceKeys>) -> UserEntry {
        UserEntry {
            username: username.into(),
            public_key: keys.map(|k| k.export_public()),
        }
    }

    #[test]
    fn later_key_overwrites_earlier() {
        let first = DeviceKeys::generate();
        let second = DeviceKeys::generate();
        let mut dir = KeyDirectory::new();

        dir.insert("Bob", &first.export_public()).unwrap();
        dir.insert("Bob", &second.export_public()).unwrap();

        assert_eq!(dir.len(), 1);
        assert_eq!(
            dir.get("Bob").map(|k| *k.as_bytes()),
            Some(*second.public_key().as_bytes())
        );
    }

    #[test]
    fn roster_ingest_skips_self_and_keyless_entries() {
        let bob = DeviceKeys::generate();
        let own = DeviceKeys::generate();
        let mut dir = KeyDirectory::new();

        dir.ingest_roster(
            &[
                entry("Ana", Some(&own)),
                entry("Bob", Some(&bob)),
                entry("Cat", None),
            ],
            "Ana",
        );

        assert_eq!(dir.len(), 1);
        assert!(dir.contains("Bob"));
        assert!(!dir.contains("Ana"));
        assert!(!dir.contains("Cat"));
    }

    #[test]
    fn roster_ingest_survives_garbage_keys() {
        let bob = DeviceKeys::generate();
        let mut dir = KeyDirectory::new();

        dir.ingest_roster(
            &[
                UserEntry {
                    username: "Evil".into(),
                    public_key: Some("!!not-a-key!!".into()),
                },
                entry("Bob", Some(&bob)),
            ],
            "Ana",
        );

        assert_eq!(dir.len(), 1);
        assert!(dir.contains("Bob"));
    }

    #[test]
    fn bad_key_insert_is_an_error() {
        let mut dir = KeyDirectory::new();
        assert!(dir.insert("Bob", "short").is_err());
        assert!(dir.is_empty());
    }

    #[test]
    fn clear_forgets_everything() {
        let bob = DeviceKeys::generate();
        let mut dir = KeyDirectory::new();
        dir.insert("Bob", &bob.export_public()).unwrap();
        dir.clear();
        assert!(dir.is_empty());
    }
}
