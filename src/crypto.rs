//! At-rest encryption for `kv.value` bytes (see SPEC_FULL.md §9).
//!
//! The database file itself stays a plain, magic-byte-valid SQLite file;
//! only the value column is opaque. Key derivation is the Encrypt-keys
//! collaborator's concern — this module only consumes a ready-made key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::error::Error;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// A 256-bit symmetric key used to encrypt `kv` values at rest.
#[derive(Clone)]
pub struct EncryptKey([u8; KEY_LEN]);

impl EncryptKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != KEY_LEN {
            return Err(Error::InvalidConfig(format!(
                "encrypt key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut buf = [0u8; KEY_LEN];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for EncryptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptKey(..)")
    }
}

/// Encrypt `plaintext`, returning `nonce || ciphertext`.
pub fn encrypt(key: &EncryptKey, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::Other(format!("encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt bytes produced by [`encrypt`].
pub fn decrypt(key: &EncryptKey, sealed: &[u8]) -> Result<Vec<u8>, Error> {
    if sealed.len() < NONCE_LEN {
        return Err(Error::Other("ciphertext shorter than nonce".to_string()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    key.cipher()
        .decrypt(nonce, ciphertext)
        .map_err(|e| Error::Other(format!("decryption failed: {e}")))
}
