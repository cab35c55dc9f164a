//! DKIM key material and lifecycle
//!
//! Keys move through `generated -> published -> active -> deprecated ->
//! retired`. Private keys are held as PKCS#8 DER, sealed with
//! [`KeyCipher`] when a store has an encryption key. Public keys are
//! SubjectPublicKeyInfo DER for RSA and the raw 32 bytes for Ed25519.

pub mod cipher;
pub mod manager;
pub mod store;

pub use cipher::KeyCipher;
pub use manager::{KeyManager, RotatedKey};
pub use store::{KeyStore, MemoryKeyStore, SqliteKeyStore};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::Pkcs1v15Sign;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Serialize, Serializer};
use sha2::Sha256;
use std::fmt;
use uuid::Uuid;

use super::record::{DkimKeyRecord, PublicKey, MIN_RSA_BITS};
use super::Algorithm;
use crate::error::{AuthError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Generated,
    Published,
    Active,
    Deprecated,
    Retired,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Generated => "generated",
            KeyStatus::Published => "published",
            KeyStatus::Active => "active",
            KeyStatus::Deprecated => "deprecated",
            KeyStatus::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generated" => Some(KeyStatus::Generated),
            "published" => Some(KeyStatus::Published),
            "active" => Some(KeyStatus::Active),
            "deprecated" => Some(KeyStatus::Deprecated),
            "retired" => Some(KeyStatus::Retired),
            _ => None,
        }
    }

    /// Published, active and deprecated keys still verify signatures
    pub fn is_verifiable(&self) -> bool {
        matches!(
            self,
            KeyStatus::Published | KeyStatus::Active | KeyStatus::Deprecated
        )
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn serialize_b64<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}

/// One DKIM key for a (domain, selector)
#[derive(Clone, Serialize)]
pub struct SigningKey {
    pub id: String,
    pub domain: String,
    pub selector: String,
    pub algorithm: Algorithm,
    #[serde(skip)]
    pub(crate) private_key: Vec<u8>,
    #[serde(serialize_with = "serialize_b64")]
    pub public_key: Vec<u8>,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub deprecated_at: Option<DateTime<Utc>>,
    pub retired_at: Option<DateTime<Utc>>,
    /// No longer chosen for signing after this instant
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("selector", &self.selector)
            .field("algorithm", &self.algorithm)
            .field("private_key", &"[redacted]")
            .field("status", &self.status)
            .field("created_at", &self.created_at)
            .field("activated_at", &self.activated_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn rsa_key(domain: &str, selector: &str, private: &RsaPrivateKey) -> Result<SigningKey> {
    let private_der = private
        .to_pkcs8_der()
        .map_err(|e| AuthError::Crypto(format!("Failed to encode private key: {}", e)))?;
    let public_der = RsaPublicKey::from(private)
        .to_public_key_der()
        .map_err(|e| AuthError::Crypto(format!("Failed to encode public key: {}", e)))?;

    Ok(SigningKey::from_parts(
        domain,
        selector,
        Algorithm::RsaSha256,
        private_der.as_bytes().to_vec(),
        public_der.as_bytes().to_vec(),
    ))
}

impl SigningKey {
    /// Assemble a fresh `generated` key from encoded material
    pub fn from_parts(
        domain: &str,
        selector: &str,
        algorithm: Algorithm,
        private_key: Vec<u8>,
        public_key: Vec<u8>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            domain: domain.trim().trim_end_matches('.').to_ascii_lowercase(),
            selector: selector.trim().to_ascii_lowercase(),
            algorithm,
            private_key,
            public_key,
            status: KeyStatus::Generated,
            created_at: Utc::now(),
            activated_at: None,
            deprecated_at: None,
            retired_at: None,
            expires_at: None,
        }
    }

    /// Create new key material; RSA generation is slow, run it off the runtime
    pub fn generate(domain: &str, selector: &str, algorithm: Algorithm, rsa_bits: usize) -> Result<Self> {
        match algorithm {
            Algorithm::RsaSha256 => {
                if rsa_bits < MIN_RSA_BITS {
                    return Err(AuthError::Config(format!(
                        "RSA keys must be at least {} bits",
                        MIN_RSA_BITS
                    )));
                }
                let mut rng = rand::thread_rng();
                let private = RsaPrivateKey::new(&mut rng, rsa_bits)
                    .map_err(|e| AuthError::Crypto(format!("RSA key generation failed: {}", e)))?;
                rsa_key(domain, selector, &private)
            }
            Algorithm::Ed25519Sha256 => {
                let rng = SystemRandom::new();
                let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
                    .map_err(|e| AuthError::Crypto(format!("Ed25519 key generation failed: {}", e)))?;
                let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
                    .map_err(|e| AuthError::Crypto(format!("Ed25519 key rejected: {}", e)))?;
                Ok(Self::from_parts(
                    domain,
                    selector,
                    algorithm,
                    pkcs8.as_ref().to_vec(),
                    pair.public_key().as_ref().to_vec(),
                ))
            }
        }
    }

    /// Load an existing RSA private key (PKCS#8, falling back to PKCS#1)
    pub fn from_rsa_pem(domain: &str, selector: &str, pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| AuthError::Crypto(format!("Failed to parse DKIM private key: {}", e)))?;

        if private.size() * 8 < MIN_RSA_BITS {
            return Err(AuthError::Crypto(format!(
                "RSA key is {} bits, at least {} required",
                private.size() * 8,
                MIN_RSA_BITS
            )));
        }
        rsa_key(domain, selector, &private)
    }

    /// Sign a SHA-256 digest of the header data
    pub fn sign(&self, digest: &[u8]) -> Result<Vec<u8>> {
        match self.algorithm {
            Algorithm::RsaSha256 => {
                let private = RsaPrivateKey::from_pkcs8_der(&self.private_key)
                    .map_err(|e| AuthError::Crypto(format!("Corrupt private key {}: {}", self.id, e)))?;
                private
                    .sign(Pkcs1v15Sign::new::<Sha256>(), digest)
                    .map_err(|e| AuthError::Crypto(format!("DKIM signing failed: {}", e)))
            }
            Algorithm::Ed25519Sha256 => {
                let pair = Ed25519KeyPair::from_pkcs8(&self.private_key)
                    .map_err(|e| AuthError::Crypto(format!("Corrupt private key {}: {}", self.id, e)))?;
                Ok(pair.sign(digest).as_ref().to_vec())
            }
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    pub fn verification_key(&self) -> Result<PublicKey> {
        PublicKey::decode(self.algorithm.key_type(), &self.public_key)
            .map_err(|e| AuthError::Crypto(format!("Unusable public key {}: {}", self.id, e)))
    }

    /// Owner name of the TXT record
    pub fn dns_name(&self) -> String {
        format!("{}._domainkey.{}", self.selector, self.domain)
    }

    /// TXT record value (`v=DKIM1; k=...; p=...`)
    pub fn dns_record(&self) -> String {
        DkimKeyRecord::to_txt(self.algorithm, &self.public_key)
    }

    pub fn public_key_b64(&self) -> String {
        BASE64.encode(&self.public_key)
    }
}
