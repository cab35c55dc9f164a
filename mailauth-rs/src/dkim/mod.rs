//! DKIM (DomainKeys Identified Mail), RFC 6376 with RFC 8463 Ed25519
//!
//! - [`keys`]: key material, lifecycle and storage
//! - [`signer`]: DKIM-Signature generation for outbound mail
//! - [`verifier`]: signature validation for inbound mail
//!
//! # Example
//! ```no_run
//! use mailauth_rs::config::Config;
//! use mailauth_rs::crypto::CryptoPool;
//! use mailauth_rs::dkim::{Algorithm, DkimSigner, KeyManager, MemoryKeyStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let pool = CryptoPool::new(4);
//! let keys = Arc::new(KeyManager::new(
//!     Arc::new(MemoryKeyStore::new()),
//!     pool.clone(),
//!     config.dkim.clone(),
//! ));
//!
//! let rotated = keys.rotate("example.com", "mail").await?;
//! println!("Publish at {}: {}", rotated.key.dns_name(), rotated.dns_record);
//!
//! let signer = DkimSigner::new(keys.clone(), pool, config.dkim.clone());
//! let signed = signer
//!     .sign(b"From: a@example.com\r\n\r\nHello\r\n", "example.com", None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod canonicalize;
pub mod keys;
pub mod record;
pub mod signature;
pub mod signer;
pub mod verifier;

pub use keys::{
    KeyCipher, KeyManager, KeyStatus, KeyStore, MemoryKeyStore, RotatedKey, SigningKey, SqliteKeyStore,
};
pub use record::{DkimKeyRecord, PublicKey};
pub use signature::DkimSignature;
pub use signer::DkimSigner;
pub use verifier::DkimVerifier;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Signing algorithms accepted for new signatures and verification
///
/// `rsa-sha1` is deliberately absent (RFC 8301).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "rsa-sha256")]
    RsaSha256,
    #[serde(rename = "ed25519-sha256")]
    Ed25519Sha256,
}

impl Algorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rsa-sha256" => Some(Algorithm::RsaSha256),
            "ed25519-sha256" => Some(Algorithm::Ed25519Sha256),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RsaSha256 => "rsa-sha256",
            Algorithm::Ed25519Sha256 => "ed25519-sha256",
        }
    }

    /// Value of the `k=` tag in the key record
    pub fn key_type(&self) -> &'static str {
        match self {
            Algorithm::RsaSha256 => "rsa",
            Algorithm::Ed25519Sha256 => "ed25519",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Canonicalization {
    Simple,
    Relaxed,
}

impl Canonicalization {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Some(Canonicalization::Simple),
            "relaxed" => Some(Canonicalization::Relaxed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Canonicalization::Simple => "simple",
            Canonicalization::Relaxed => "relaxed",
        }
    }
}

/// Why a signature permanently failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DkimFailure {
    Syntax,
    UnsupportedAlgorithm,
    Expired,
    NoKey,
    Revoked,
    KeySyntax,
    InappropriateKey,
    WeakKey,
    DomainMismatch,
    BodyHash,
    BadSignature,
}

impl DkimFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            DkimFailure::Syntax => "syntax",
            DkimFailure::UnsupportedAlgorithm => "unsupported-algorithm",
            DkimFailure::Expired => "expired",
            DkimFailure::NoKey => "no-key",
            DkimFailure::Revoked => "revoked",
            DkimFailure::KeySyntax => "key-syntax",
            DkimFailure::InappropriateKey => "inappropriate-key",
            DkimFailure::WeakKey => "weak-key",
            DkimFailure::DomainMismatch => "domain-mismatch",
            DkimFailure::BodyHash => "body-hash",
            DkimFailure::BadSignature => "bad-signature",
        }
    }

    /// Result keyword used in Authentication-Results (RFC 8601)
    pub fn result_keyword(&self) -> &'static str {
        match self {
            DkimFailure::BodyHash | DkimFailure::BadSignature | DkimFailure::Expired => "fail",
            _ => "permerror",
        }
    }
}

impl fmt::Display for DkimFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of verifying one DKIM-Signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason")]
pub enum DkimResult {
    #[serde(rename = "pass")]
    Pass,
    /// DNS timeout or server failure while fetching the key
    #[serde(rename = "temperror")]
    TempFail(String),
    #[serde(rename = "permerror")]
    PermFail(DkimFailure),
}

impl DkimResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, DkimResult::Pass)
    }
}

impl fmt::Display for DkimResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DkimResult::Pass => write!(f, "pass"),
            DkimResult::TempFail(_) => write!(f, "temperror"),
            DkimResult::PermFail(failure) => write!(f, "{}", failure.result_keyword()),
        }
    }
}

/// Result for one signature, attributed to its signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkimOutcome {
    /// `d=`, empty when the header could not be parsed at all
    pub domain: String,
    pub selector: String,
    pub result: DkimResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_parse() {
        assert_eq!(Algorithm::parse("RSA-SHA256"), Some(Algorithm::RsaSha256));
        assert_eq!(Algorithm::parse("ed25519-sha256"), Some(Algorithm::Ed25519Sha256));
        assert_eq!(Algorithm::parse("rsa-sha1"), None);
        assert_eq!(Algorithm::Ed25519Sha256.key_type(), "ed25519");
    }

    #[test]
    fn test_result_display() {
        assert_eq!(DkimResult::Pass.to_string(), "pass");
        assert_eq!(DkimResult::TempFail("dns".into()).to_string(), "temperror");
        assert_eq!(DkimResult::PermFail(DkimFailure::BodyHash).to_string(), "fail");
        assert_eq!(DkimResult::PermFail(DkimFailure::Syntax).to_string(), "permerror");
    }

    #[test]
    fn test_result_serializes_with_reason() {
        let json = serde_json::to_string(&DkimResult::PermFail(DkimFailure::NoKey)).unwrap();
        assert_eq!(json, r#"{"status":"permerror","reason":"no-key"}"#);
    }
}
