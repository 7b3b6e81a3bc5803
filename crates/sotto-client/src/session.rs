//! The cipher session: keys + directory + username for one login.
//!
//! An explicit lifecycle object constructed at session start and cleared at
//! session end, passed by reference to whatever needs it — never a module
//! global — so multiple simulated users in one process stay independent.

use tokio::sync::RwLock;
use tracing::debug;

use sotto_core::messages::UserEntry;
use sotto_core::{ChatError, ChatResult};

use crate::directory::KeyDirectory;
use crate::envelope::{self, Envelope, SELF_SLOT};
use crate::keys::DeviceKeys;

/// What a message renders as when it cannot be decrypted. Crypto failures
/// are local: they never crash the session or reach other peers.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[encrypted message: unable to decrypt]";

/// Per-login encryption state.
pub struct CipherSession {
    username: String,
    keys: DeviceKeys,
    directory: RwLock<KeyDirectory>,
}

impl CipherSession {
    /// Start a session: generates the long-lived keypair for this login.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            keys: DeviceKeys::generate(),
            directory: RwLock::new(KeyDirectory::new()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Base64 public key to publish with the join request.
    pub fn export_public(&self) -> String {
        self.keys.export_public()
    }

    /// Learn one peer's key (from a join broadcast).
    pub async fn learn_key(&self, username: &str, encoded: &str) -> ChatResult<()> {
        if username == self.username {
            return Ok(());
        }
        self.directory.write().await.insert(username, encoded)
    }

    /// Learn every key in a presence snapshot.
    pub async fn ingest_roster(&self, users: &[UserEntry]) {
        self.directory.write().await.ingest_roster(users, &self.username);
    }

    /// Number of peers this session can currently encrypt for.
    pub async fn known_peers(&self) -> usize {
        self.directory.read().await.len()
    }

    /// Whether a specific peer's key is known.
    pub async fn knows(&self, username: &str) -> bool {
        self.directory.read().await.contains(username)
    }

    /// Encrypt a message for every known peer (and this session itself),
    /// returning the serialized envelope to put in `encryptedMessage`.
    pub async fn encrypt(&self, plaintext: &str) -> ChatResult<String> {
        let directory = self.directory.read().await;
        let envelope = envelope::seal(plaintext.as_bytes(), &self.keys, &directory)?;
        envelope.to_json()
    }

    /// Decrypt a received `encryptedMessage`, falling back to the opaque
    /// placeholder on any failure.
    pub async fn decrypt(&self, encrypted_message: &str, sender: &str) -> String {
        match self.try_decrypt(encrypted_message, sender) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                debug!(sender, error = %e, "message not decryptable");
                UNDECRYPTABLE_PLACEHOLDER.to_string()
            }
        }
    }

    /// Slot addressing: this session's own echoes open the reserved `self`
    /// entry; everything else opens the slot keyed by this session's own
    /// username.
    fn try_decrypt(&self, encrypted_message: &str, sender: &str) -> ChatResult<String> {
        let envelope = Envelope::from_json(encrypted_message)?;
        let slot = if sender == self.username {
            SELF_SLOT
        } else {
            self.username.as_str()
        };
        let plaintext = envelope::open(&envelope, slot, &self.keys)?;
        String::from_utf8(plaintext)
            .map_err(|_| ChatError::Crypto("decrypted payload is not UTF-8".into()))
    }

    /// End the session: forget every learned key.
    pub async fn forget_all(&self) {
        self.directory.write().await.clear();
        debug!(username = %self.username, "cipher session cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn own_echo_decrypts_via_self_slot() {
        let ana = CipherSession::new("Ana");
        let sealed = ana.encrypt("ciao").await.unwrap();
        assert_eq!(ana.decrypt(&sealed, "Ana").await, "ciao");
    }

    #[tokio::test]
    async fn peer_decrypts_via_its_own_username_slot() {
        let ana = CipherSession::new("Ana");
        let bob = CipherSession::new("Bob");
        ana.learn_key("Bob", &bob.export_public()).await.unwrap();

        let sealed = ana.encrypt("per Bob").await.unwrap();
        assert_eq!(bob.decrypt(&sealed, "Ana").await, "per Bob");
    }

    #[tokio::test]
    async fn unknown_recipient_gets_placeholder() {
        let ana = CipherSession::new("Ana");
        let cat = CipherSession::new("Cat");
        // Ana never learned Cat's key, so the envelope has no slot for Cat.
        let sealed = ana.encrypt("privato").await.unwrap();
        assert_eq!(cat.decrypt(&sealed, "Ana").await, UNDECRYPTABLE_PLACEHOLDER);
    }

    #[tokio::test]
    async fn late_key_learning_does_not_repair_old_envelopes() {
        let ana = CipherSession::new("Ana");
        let cat = CipherSession::new("Cat");

        let sealed = ana.encrypt("prima").await.unwrap();
        // Keys exchanged after the fact.
        ana.learn_key("Cat", &cat.export_public()).await.unwrap();

        assert_eq!(cat.decrypt(&sealed, "Ana").await, UNDECRYPTABLE_PLACEHOLDER);
    }

    #[tokio::test]
    async fn garbage_payload_gets_placeholder_not_a_panic() {
        let ana = CipherSession::new("Ana");
        assert_eq!(ana.decrypt("not json at all", "Bob").await, UNDECRYPTABLE_PLACEHOLDER);
        assert_eq!(ana.decrypt("{}", "Bob").await, UNDECRYPTABLE_PLACEHOLDER);
    }

    #[tokio::test]
    async fn roster_ingest_feeds_encryption() {
        let ana = CipherSession::new("Ana");
        let bob = CipherSession::new("Bob");
        ana.ingest_roster(&[
            UserEntry {
                username: "Ana".into(),
                public_key: Some(ana.export_public()),
            },
            UserEntry {
                username: "Bob".into(),
                public_key: Some(bob.export_public()),
            },
        ])
        .await;

        assert_eq!(ana.known_peers().await, 1);
        let sealed = ana.encrypt("dal roster").await.unwrap();
        assert_eq!(bob.decrypt(&sealed, "Ana").await, "dal roster");
    }

    #[tokio::test]
    async fn forget_all_stops_future_wraps() {
        let ana = CipherSession::new("Ana");
        let bob = CipherSession::new("Bob");
        ana.learn_key("Bob", &bob.export_public()).await.unwrap();
        ana.forget_all().await;

        let sealed = ana.encrypt("dopo il logout").await.unwrap();
        assert_eq!(bob.decrypt(&sealed, "Ana").await, UNDECRYPTABLE_PLACEHOLDER);
        // The author still has its own copy.
        assert_eq!(ana.decrypt(&sealed, "Ana").await, "dopo il logout");
    }
}
