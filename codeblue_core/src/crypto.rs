//! Encryption at rest for the key-value store.
//!
//! Values are sealed with AES-256-GCM under a per-device key. Each stored
//! value is a small versioned JSON payload holding a fresh random nonce and
//! the ciphertext (which includes the authentication tag).

use crate::store::KeyValueStore;
use crate::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;

const NONCE_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;
const PAYLOAD_VERSION: u8 = 1;
const ALGORITHM: &str = "AES-256-GCM";

/// Stored form of an encrypted value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub version: u8,
    pub alg: String,
    /// Base64-encoded nonce
    pub nonce: String,
    /// Base64-encoded ciphertext (includes auth tag)
    pub ciphertext: String,
}

pub struct Cipher {
    inner: Aes256Gcm,
}

impl Cipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(Error::Crypto(format!(
                "key must be {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }
        let inner = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::Crypto(format!("failed to create cipher: {}", e)))?;
        Ok(Self { inner })
    }

    /// Seal `plaintext`, returning the JSON payload
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .inner
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::Crypto(format!("encryption failed: {}", e)))?;

        let payload = EncryptedPayload {
            version: PAYLOAD_VERSION,
            alg: ALGORITHM.to_string(),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        };
        Ok(serde_json::to_string(&payload)?)
    }

    pub fn decrypt(&self, payload_json: &str) -> Result<Vec<u8>> {
        let payload: EncryptedPayload = serde_json::from_str(payload_json)?;
        if payload.version != PAYLOAD_VERSION {
            return Err(Error::Crypto(format!(
                "unsupported payload version {}",
                payload.version
            )));
        }
        if payload.alg != ALGORITHM {
            return Err(Error::Crypto(format!("unsupported algorithm {}", payload.alg)));
        }

        let nonce_bytes = BASE64
            .decode(&payload.nonce)
            .map_err(|e| Error::Crypto(format!("invalid nonce: {}", e)))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(Error::Crypto(format!(
                "nonce must be {} bytes, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            )));
        }
        let ciphertext = BASE64
            .decode(&payload.ciphertext)
            .map_err(|e| Error::Crypto(format!("invalid ciphertext: {}", e)))?;

        self.inner
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| Error::Crypto("decryption failed".into()))
    }
}

/// Load the device key, generating and saving one on first use
pub fn load_or_create_device_key(path: &Path) -> Result<[u8; KEY_SIZE]> {
    if path.exists() {
        let encoded = std::fs::read_to_string(path)?;
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Crypto(format!("invalid device key in {:?}: {}", path, e)))?;
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::Crypto(format!("device key must be {} bytes, got {}", KEY_SIZE, b.len()))
        })?;
        return Ok(key);
    }

    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, BASE64.encode(key))?;
    tracing::info!("Generated device key at {:?}", path);
    Ok(key)
}

/// Store wrapper that encrypts every value
///
/// A value that fails to decrypt is an [`Error::Crypto`]; callers that only
/// read may treat it as absent, but nothing should overwrite it blindly.
pub struct EncryptedStore<S> {
    inner: S,
    cipher: Cipher,
}

impl<S: KeyValueStore> EncryptedStore<S> {
    pub fn new(inner: S, key: &[u8]) -> Result<Self> {
        Ok(Self {
            inner,
            cipher: Cipher::new(key)?,
        })
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: KeyValueStore> KeyValueStore for EncryptedStore<S> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(sealed) = self.inner.get(key)? else {
            return Ok(None);
        };
        let plain = self
            .cipher
            .decrypt(&sealed)
            .map_err(|e| Error::Crypto(format!("unable to decrypt '{}': {}", key, e)))?;
        String::from_utf8(plain)
            .map(Some)
            .map_err(|e| Error::Crypto(format!("decrypted '{}' is not UTF-8: {}", key, e)))
    }

    fn put(&mut self, key: &str, value: &str) -> Result<()> {
        let sealed = self.cipher.encrypt(value.as_bytes())?;
        self.inner.put(key, &sealed)
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.inner.remove(key)
    }
}
