//! Auth Module - Zulassung von Verbindungen am Presence Hub
//!
//! Der Hub lässt eine Verbindung erst zu, wenn eine [`IdentitySource`] die
//! Identität aus dem signierten `Hello` bestätigt hat:
//! - [`KeyRegistry`] prüft die Ed25519-Signatur gegen den registrierten Key
//! - [`ClaimedIdentity`] übernimmt die behauptete ID ungeprüft (nur Entwicklung)

mod keypair;

pub use keypair::{KeyPair, KeyPairError};

use crate::signaling::{Hello, UserId};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Unknown user: {0}")]
    UnknownUser(UserId),

    #[error("Public key does not match the registered key")]
    KeyMismatch,

    #[error("Malformed key or signature: {0}")]
    Malformed(String),

    #[error("Hello timestamp outside the accepted window ({skew_secs}s skew)")]
    StaleTimestamp { skew_secs: i64 },

    #[error("Invalid signature")]
    InvalidSignature,
}

// ============================================================================
// IDENTITY SOURCE
// ============================================================================

/// Liefert die verifizierte Identität einer neuen Verbindung
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn admit(&self, hello: &Hello) -> Result<UserId, AdmissionError>;
}

/// Registrierte Public Keys der Benutzer (vom User-Store befüllt)
pub struct KeyRegistry {
    keys: RwLock<HashMap<UserId, VerifyingKey>>,
    max_skew: Duration,
}

impl KeyRegistry {
    pub fn new(max_skew: Duration) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            max_skew,
        }
    }

    /// Registriert oder ersetzt den Key eines Benutzers
    pub fn register(&self, user_id: UserId, key: VerifyingKey) {
        self.keys.write().insert(user_id, key);
    }

    /// Registriert einen Key im Base64-Format des `Hello`
    pub fn register_base64(&self, user_id: UserId, public_key: &str) -> Result<(), AdmissionError> {
        let key = decode_verifying_key(public_key)?;
        self.register(user_id, key);
        Ok(())
    }

    pub fn unregister(&self, user_id: &UserId) {
        self.keys.write().remove(user_id);
    }

    fn verify(&self, hello: &Hello, now: i64) -> Result<UserId, AdmissionError> {
        let key = self
            .keys
            .read()
            .get(&hello.user_id)
            .copied()
            .ok_or_else(|| AdmissionError::UnknownUser(hello.user_id.clone()))?;

        if decode_verifying_key(&hello.public_key)? != key {
            return Err(AdmissionError::KeyMismatch);
        }

        let skew_secs = (now - hello.timestamp).abs();
        if skew_secs > self.max_skew.as_secs() as i64 {
            return Err(AdmissionError::StaleTimestamp { skew_secs });
        }

        let sig_bytes: [u8; 64] = BASE64
            .decode(&hello.signature)
            .map_err(|e| AdmissionError::Malformed(e.to_string()))?
            .try_into()
            .map_err(|_| AdmissionError::Malformed("signature length".to_string()))?;

        let payload = Hello::signing_payload(&hello.user_id, hello.timestamp);
        key.verify(payload.as_bytes(), &Signature::from_bytes(&sig_bytes))
            .map_err(|_| AdmissionError::InvalidSignature)?;

        Ok(hello.user_id.clone())
    }
}

#[async_trait]
impl IdentitySource for KeyRegistry {
    async fn admit(&self, hello: &Hello) -> Result<UserId, AdmissionError> {
        self.verify(hello, Utc::now().timestamp())
    }
}

/// Übernimmt die behauptete Identität ohne Prüfung
#[derive(Debug, Default, Clone, Copy)]
pub struct ClaimedIdentity;

#[async_trait]
impl IdentitySource for ClaimedIdentity {
    async fn admit(&self, hello: &Hello) -> Result<UserId, AdmissionError> {
        if hello.user_id.as_str().is_empty() {
            return Err(AdmissionError::Malformed("empty user id".to_string()));
        }
        Ok(hello.user_id.clone())
    }
}

fn decode_verifying_key(public_key: &str) -> Result<VerifyingKey, AdmissionError> {
    let bytes: [u8; 32] = BASE64
        .decode(public_key)
        .map_err(|e| AdmissionError::Malformed(e.to_string()))?
        .try_into()
        .map_err(|_| AdmissionError::Malformed("public key length".to_string()))?;

    VerifyingKey::from_bytes(&bytes).map_err(|e| AdmissionError::Malformed(e.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn registry_with(user: &str, keypair: &KeyPair) -> KeyRegistry {
        let registry = KeyRegistry::new(Duration::from_secs(60));
        registry.register(UserId::from(user), keypair.verifying_key());
        registry
    }

    #[test]
    fn test_valid_hello_is_admitted() {
        let keypair = KeyPair::generate();
        let registry = registry_with("alice", &keypair);

        let hello = keypair.hello_at(&UserId::from("alice"), NOW);
        assert_eq!(registry.verify(&hello, NOW + 5), Ok(UserId::from("alice")));
    }

    #[test]
    fn test_unknown_user_is_rejected() {
        let keypair = KeyPair::generate();
        let registry = registry_with("alice", &keypair);

        let hello = keypair.hello_at(&UserId::from("mallory"), NOW);
        assert_eq!(
            registry.verify(&hello, NOW),
            Err(AdmissionError::UnknownUser(UserId::from("mallory")))
        );
    }

    #[test]
    fn test_foreign_key_is_rejected() {
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();
        let registry = registry_with("alice", &alice);

        let hello = mallory.hello_at(&UserId::from("alice"), NOW);
        assert_eq!(registry.verify(&hello, NOW), Err(AdmissionError::KeyMismatch));
    }

    #[test]
    fn test_tampered_signature_is_rejected() {
        let keypair = KeyPair::generate();
        let registry = registry_with("alice", &keypair);

        let mut hello = keypair.hello_at(&UserId::from("alice"), NOW);
        hello.timestamp += 1;
        assert_eq!(
            registry.verify(&hello, NOW),
            Err(AdmissionError::InvalidSignature)
        );
    }

    #[test]
    fn test_stale_timestamp_is_rejected() {
        let keypair = KeyPair::generate();
        let registry = registry_with("alice", &keypair);

        let hello = keypair.hello_at(&UserId::from("alice"), NOW - 600);
        assert!(matches!(
            registry.verify(&hello, NOW),
            Err(AdmissionError::StaleTimestamp { skew_secs: 600 })
        ));
    }

    #[tokio::test]
    async fn test_claimed_identity_rejects_empty_id() {
        let keypair = KeyPair::generate();
        let hello = keypair.hello_at(&UserId::from(""), NOW);
        assert!(ClaimedIdentity.admit(&hello).await.is_err());

        let hello = keypair.hello_at(&UserId::from("bob"), NOW);
        assert_eq!(ClaimedIdentity.admit(&hello).await, Ok(UserId::from("bob")));
    }
}
