//! Symmetric encryption of account secrets (user private keys, escrow
//! account private keys) using a key derived once at process start.
//!
//! The key derivation mirrors the Python source's Fernet setup exactly
//! (PBKDF2-HMAC-SHA256, 100_000 iterations, a fixed salt); the cipher itself
//! is AES-256-GCM rather than Fernet, since Fernet has no Rust crate in this
//! workspace's dependency stack and AES-GCM is the authenticated-encryption
//! primitive the rest of this codebase already uses.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::error::AppError;

const KDF_ITERATIONS: u32 = 100_000;
const KDF_SALT: &[u8] = b"chatpay_core_salt_v1";
const NONCE_LEN: usize = 12;

pub struct CryptoService {
    cipher: Aes256Gcm,
}

impl CryptoService {
    /// Derives the scoped encryption key from a process-wide secret. Call
    /// once at startup; the resulting service is cheap to clone/share.
    pub fn new(secret: &str) -> Self {
        let mut key_bytes = [0u8; 32];
        pbkdf2_hmac::<Sha256>(secret.as_bytes(), KDF_SALT, KDF_ITERATIONS, &mut key_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypts `plaintext`, returning a hex-encoded `nonce || ciphertext` blob.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, AppError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| AppError::Internal("encryption failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(hex::encode(blob))
    }

    /// Decrypts a blob produced by `encrypt`. Never logs plaintext or the
    /// blob itself; failures are reported generically.
    pub fn decrypt(&self, blob: &str) -> Result<String, AppError> {
        let bytes = hex::decode(blob).map_err(|_| AppError::Internal("decryption failed".into()))?;
        if bytes.len() < NONCE_LEN {
            return Err(AppError::Internal("decryption failed".into()));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| AppError::Internal("decryption failed".into()))?;

        String::from_utf8(plaintext).map_err(|_| AppError::Internal("decryption failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plaintext() {
        let svc = CryptoService::new("test-process-secret");
        let blob = svc.encrypt("super secret private key").unwrap();
        assert_eq!(svc.decrypt(&blob).unwrap(), "super secret private key");
    }

    #[test]
    fn ciphertext_varies_but_plaintext_agrees() {
        let svc = CryptoService::new("test-process-secret");
        let a = svc.encrypt("same plaintext").unwrap();
        let b = svc.encrypt("same plaintext").unwrap();
        assert_ne!(a, b);
        assert_eq!(svc.decrypt(&a).unwrap(), svc.decrypt(&b).unwrap());
    }

    #[test]
    fn rejects_tampered_blob() {
        let svc = CryptoService::new("test-process-secret");
        let mut blob = svc.encrypt("private key").unwrap();
        blob.push('0');
        assert!(svc.decrypt(&blob).is_err());
    }

    #[test]
    fn different_secrets_cannot_decrypt_each_other() {
        let a = CryptoService::new("secret-a");
        let b = CryptoService::new("secret-b");
        let blob = a.encrypt("private key").unwrap();
        assert!(b.decrypt(&blob).is_err());
    }
}
