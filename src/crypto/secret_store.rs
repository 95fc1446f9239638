//! C1: Secret Store. Authenticated-encryption wrapper around the relational
//! store's field-level encryption primitive, enforcing tenant scoping on
//! every read.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

/// Encrypts and decrypts provider-credential secrets at field granularity
/// with a single process-wide master key, independent of tenant.
///
/// Ciphertext layout: `nonce(12 bytes) || AEAD(plaintext) || tag`. A fresh
/// random nonce is drawn for every call to [`SecretStore::encrypt`].
pub struct SecretStore {
    cipher: Aes256Gcm,
}

impl SecretStore {
    /// Build a store from a master key. The key material must be at least
    /// 32 bytes; only the first 32 bytes are used. Config validation
    /// enforces the length bound before this is ever constructed.
    ///
    /// # Errors
    ///
    /// Returns an error if `master_key` is shorter than 32 bytes.
    pub fn new(master_key: &[u8]) -> Result<Self> {
        if master_key.len() < 32 {
            return Err(Error::Internal(
                "secret store master key must be at least 32 bytes".to_string(),
            ));
        }
        let key = Key::<Aes256Gcm>::from_slice(&master_key[..32]);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext || tag`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying AEAD operation fails, which only
    /// happens on catastrophic misuse (it never fails for valid inputs).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::Internal("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a blob produced by [`SecretStore::encrypt`]. Fails closed:
    /// any error (truncated blob, wrong key, tampered ciphertext) is
    /// reported, never swallowed into a silent empty/null plaintext.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is shorter than the nonce length or if
    /// AEAD decryption/authentication fails.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return Err(Error::Internal("ciphertext too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::Internal("decryption failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SecretStore {
        SecretStore::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn roundtrip() {
        let store = store();
        let ciphertext = store.encrypt(b"sk-super-secret").unwrap();
        let plaintext = store.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, b"sk-super-secret");
    }

    #[test]
    fn distinct_nonces_for_identical_plaintext() {
        let store = store();
        let a = store.encrypt(b"same-secret").unwrap();
        let b = store.encrypt(b"same-secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let store = store();
        let mut ciphertext = store.encrypt(b"sk-super-secret").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(store.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn wrong_key_fails_closed() {
        let store_a = SecretStore::new(&[1u8; 32]).unwrap();
        let store_b = SecretStore::new(&[2u8; 32]).unwrap();
        let ciphertext = store_a.encrypt(b"sk-super-secret").unwrap();
        assert!(store_b.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn rejects_short_master_key() {
        assert!(SecretStore::new(b"too-short").is_err());
    }

    #[test]
    fn rejects_truncated_blob() {
        let store = store();
        assert!(store.decrypt(&[0u8; 4]).is_err());
    }
}
