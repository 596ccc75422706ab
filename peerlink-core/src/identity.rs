//! Peer identity and relay payload sealing: opaque peer IDs, secret-derived keys, AEAD with random nonces.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Nonce length prefixed to every sealed payload.
pub const NONCE_SIZE: usize = 12;

/// Opaque peer identity. Addressing key for the relay topics and the transport registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Random identity, unique per process instance.
    pub fn random() -> Self {
        PeerId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relay topic carrying this peer's presence notifications.
    pub fn notify_topic(&self) -> String {
        format!("{}:notify", self.0)
    }

    /// First 8 characters, for log lines.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// Symmetric key for sealing relay payloads. Every peer configured with the same secret derives the same key.
#[derive(Clone)]
pub struct SignalKey([u8; 32]);

impl SignalKey {
    /// Derive a 32-byte ChaCha20-Poly1305 key from a shared secret string.
    pub fn derive(secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"peerlink-signal-v1");
        hasher.update(secret.as_bytes());
        SignalKey(hasher.finalize().into())
    }

    /// Encrypt with a fresh random nonce. Output: nonce (12 bytes) || ciphertext.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| CryptoError::Key)?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a payload produced by [`SignalKey::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE {
            return Err(CryptoError::Truncated);
        }
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| CryptoError::Key)?;
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let nonce = chacha20poly1305::aead::Nonce::<ChaCha20Poly1305>::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl fmt::Debug for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SignalKey(..)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("sealed payload shorter than nonce")]
    Truncated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_distinct() {
        let a = PeerId::random();
        let b = PeerId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert_eq!(a.short().len(), 8);
    }

    #[test]
    fn notify_topic_format() {
        let id = PeerId::from("abc");
        assert_eq!(id.notify_topic(), "abc:notify");
        assert_eq!(id.short(), "abc");
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = SignalKey::derive("s3cret");
        let sealed = key.seal(b"hello relay").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + b"hello relay".len() + 16);
        let opened = SignalKey::derive("s3cret").open(&sealed).unwrap();
        assert_eq!(opened.as_slice(), b"hello relay");
    }

    #[test]
    fn fresh_nonce_per_seal() {
        let key = SignalKey::derive("k");
        let a = key.seal(b"same").unwrap();
        let b = key.seal(b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn wrong_secret_fails() {
        let sealed = SignalKey::derive("one").seal(b"payload").unwrap();
        assert!(matches!(
            SignalKey::derive("two").open(&sealed),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn truncated_payload_rejected() {
        let key = SignalKey::derive("k");
        assert!(matches!(key.open(&[0u8; 5]), Err(CryptoError::Truncated)));
    }
}
