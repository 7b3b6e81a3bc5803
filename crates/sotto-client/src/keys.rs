//! Long-lived X25519 device keys.
//!
//! One keypair per session, not per message: the public half is exported
//! with the join request so peers can wrap content keys for this device.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use sotto_core::{ChatError, ChatResult};

/// The session's asymmetric keypair.
#[derive(Clone)]
pub struct DeviceKeys {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for DeviceKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't expose private key in debug output
        f.debug_struct("DeviceKeys")
            .field("public", &BASE64.encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl DeviceKeys {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half, ready to wrap content keys with.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Base64 export of the public key, as published in the join request.
    pub fn export_public(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Diffie-Hellman with a peer public key, for unwrapping.
    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> x25519_dalek::SharedSecret {
        self.secret.diffie_hellman(peer)
    }
}

/// Import a base64-exported public key into ready-to-wrap-with form.
pub fn decode_public_key(encoded: &str) -> ChatResult<PublicKey> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| ChatError::Crypto(format!("public key is not valid base64: {e}")))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ChatError::Crypto("public key must be 32 bytes".into()))?;
    Ok(PublicKey::from(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_then_import_round_trips() {
        let keys = DeviceKeys::generate();
        let imported = decode_public_key(&keys.export_public()).unwrap();
        assert_eq!(imported.as_bytes(), keys.public_key().as_bytes());
    }

    #[test]
    fn keypairs_are_unique() {
        let a = DeviceKeys::generate();
        let b = DeviceKeys::generate();
        assert_ne!(a.public_key().as_bytes(), b.public_key().as_bytes());
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(decode_public_key("not base64!!").is_err());
        assert!(decode_public_key(&BASE64.encode([0u8; 16])).is_err());
    }

    #[test]
    fn debug_redacts_the_secret() {
        let keys = DeviceKeys::generate();
        let rendered = format!("{keys:?}");
        assert!(rendered.contains("[REDACTED]"));
    }
}
