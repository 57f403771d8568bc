//! Ed25519 Key Pair Management
//!
//! Generiert, speichert und lädt das Schlüsselpaar, mit dem ein Client
//! seine Anmeldung (`Hello`) beim Presence Hub signiert.
//!
//! ## Verwendung
//! ```no_run
//! use callwire::auth::KeyPair;
//! use callwire::signaling::UserId;
//!
//! let keypair = KeyPair::load_or_create()?;
//! let hello = keypair.hello(&UserId::from("alice"));
//! # Ok::<(), callwire::auth::KeyPairError>(())
//! ```

use crate::signaling::{Hello, UserId};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum KeyPairError {
    #[error("Failed to access key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode private key: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Invalid private key length: expected 32, got {0}")]
    InvalidKeyLength(usize),
}

// ============================================================================
// KEYPAIR STRUCT
// ============================================================================

/// Ed25519 Schlüsselpaar für die Anmeldung am Hub
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Lädt ein existierendes Schlüsselpaar oder erstellt ein neues
    ///
    /// Der Key liegt im Datenverzeichnis der Plattform unter
    /// `callwire/keys/private.key`.
    pub fn load_or_create() -> Result<Self, KeyPairError> {
        let key_path = Self::default_key_path()?;
        Self::load_or_create_at(&key_path)
    }

    /// Wie [`KeyPair::load_or_create`], aber mit explizitem Pfad
    pub fn load_or_create_at(key_path: &Path) -> Result<Self, KeyPairError> {
        if key_path.exists() {
            tracing::info!("Loading existing keypair from {:?}", key_path);
            Self::load_from_file(key_path)
        } else {
            tracing::info!("Creating new keypair at {:?}", key_path);
            let keypair = Self::generate();
            keypair.save_to_file(key_path)?;
            Ok(keypair)
        }
    }

    /// Generiert ein neues zufälliges Schlüsselpaar
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        Self { signing_key }
    }

    fn load_from_file(path: &Path) -> Result<Self, KeyPairError> {
        let encoded = fs::read_to_string(path)?;
        let bytes = BASE64.decode(encoded.trim())?;

        let key_bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| KeyPairError::InvalidKeyLength(b.len()))?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    fn save_to_file(&self, path: &Path) -> Result<(), KeyPairError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let encoded = BASE64.encode(self.signing_key.to_bytes());
        fs::write(path, encoded)?;

        // Nur Owner darf lesen/schreiben
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    fn default_key_path() -> Result<PathBuf, KeyPairError> {
        let proj_dirs = directories::ProjectDirs::from("", "", "callwire").ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine app data directory",
            )
        })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("keys");
        path.push("private.key");
        Ok(path)
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Signiert Daten und gibt die Signatur als Base64 zurück
    pub fn sign_base64(&self, message: &[u8]) -> String {
        BASE64.encode(self.sign(message).to_bytes())
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Erstellt eine signierte Anmeldung mit aktuellem Timestamp
    pub fn hello(&self, user_id: &UserId) -> Hello {
        self.hello_at(user_id, Utc::now().timestamp())
    }

    /// Erstellt eine signierte Anmeldung für einen festen Timestamp (Sekunden)
    pub fn hello_at(&self, user_id: &UserId, timestamp: i64) -> Hello {
        let payload = Hello::signing_payload(user_id, timestamp);
        Hello {
            user_id: user_id.clone(),
            public_key: self.public_key_base64(),
            timestamp,
            signature: self.sign_base64(payload.as_bytes()),
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
