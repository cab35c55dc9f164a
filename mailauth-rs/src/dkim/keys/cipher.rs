//! Private keys at rest: AES-256-GCM under a key-encryption key
//!
//! Sealed values are `nonce || ciphertext || tag` with a fresh random
//! 96-bit nonce per value.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{AuthError, Result};

pub struct KeyCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl KeyCipher {
    /// Raw 32-byte key-encryption key
    pub fn new(kek: &[u8]) -> Result<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, kek).map_err(|_| {
            AuthError::Config(format!(
                "key encryption key must be {} bytes, got {}",
                AES_256_GCM.key_len(),
                kek.len()
            ))
        })?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Key-encryption key as configured in `[keys] encryption_key`
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let kek = BASE64
            .decode(encoded.trim())
            .map_err(|e| AuthError::Config(format!("keys.encryption_key is not base64: {}", e)))?;
        Self::new(&kek)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| AuthError::Crypto("nonce generation failed".to_string()))?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| AuthError::Crypto("private key encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(AuthError::Crypto("sealed private key is truncated".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| AuthError::Crypto("invalid nonce".to_string()))?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| {
                AuthError::Crypto("private key decryption failed, wrong encryption key?".to_string())
            })?;
        Ok(plaintext.to_vec())
    }
}
