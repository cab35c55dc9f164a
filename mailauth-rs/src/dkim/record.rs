//! DKIM key records (`selector._domainkey.domain` TXT)

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::signature::{UnparsedPublicKey, ED25519};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::Pkcs1v15Sign;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use sha2::Sha256;

use super::signature::parse_tags;
use super::{Algorithm, DkimFailure};

/// Smallest RSA modulus accepted for verification (RFC 8301)
pub const MIN_RSA_BITS: usize = 1024;

/// Parsed `v=DKIM1; k=...; p=...` record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimKeyRecord {
    /// `k=`, defaults to `rsa`
    pub key_type: String,
    /// `h=`, every hash allowed when absent
    pub hash_algorithms: Option<Vec<String>>,
    /// `s=`, defaults to `*`
    pub service_types: Vec<String>,
    /// `t=` flags (`y` testing, `s` strict)
    pub flags: Vec<String>,
    /// Decoded `p=`; empty means the key was revoked
    pub public_key: Vec<u8>,
}

fn colon_list(value: &str) -> Vec<String> {
    value
        .split(':')
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

impl DkimKeyRecord {
    pub fn parse(txt: &str) -> Result<Self, DkimFailure> {
        let tags = parse_tags(txt).ok_or(DkimFailure::KeySyntax)?;

        if let Some(v) = tags.get("v") {
            if v != "DKIM1" {
                return Err(DkimFailure::KeySyntax);
            }
        }

        let p = tags.get("p").ok_or(DkimFailure::KeySyntax)?;
        let p: String = p.chars().filter(|c| !c.is_whitespace()).collect();
        let public_key = BASE64.decode(p).map_err(|_| DkimFailure::KeySyntax)?;

        Ok(Self {
            key_type: tags
                .get("k")
                .map(|k| k.to_ascii_lowercase())
                .unwrap_or_else(|| "rsa".to_string()),
            hash_algorithms: tags.get("h").map(|h| colon_list(h)),
            service_types: tags
                .get("s")
                .map(|s| colon_list(s))
                .unwrap_or_else(|| vec!["*".to_string()]),
            flags: tags.get("t").map(|t| colon_list(t)).unwrap_or_default(),
            public_key,
        })
    }

    /// Record text to publish for a key
    pub fn to_txt(algorithm: Algorithm, public_key: &[u8]) -> String {
        format!(
            "v=DKIM1; k={}; p={}",
            algorithm.key_type(),
            BASE64.encode(public_key)
        )
    }

    pub fn is_revoked(&self) -> bool {
        self.public_key.is_empty()
    }

    pub fn is_testing(&self) -> bool {
        self.flags.iter().any(|f| f == "y")
    }

    /// `t=s`: the `i=` domain must equal `d=` exactly
    pub fn is_strict(&self) -> bool {
        self.flags.iter().any(|f| f == "s")
    }

    pub fn allows_sha256(&self) -> bool {
        self.hash_algorithms
            .as_ref()
            .map_or(true, |h| h.iter().any(|a| a == "sha256"))
    }

    pub fn allows_email(&self) -> bool {
        self.service_types.iter().any(|s| s == "*" || s == "email")
    }
}

/// Key usable for verification
#[derive(Debug, Clone)]
pub enum PublicKey {
    Rsa(RsaPublicKey),
    /// Raw 32-byte key (RFC 8463)
    Ed25519(Vec<u8>),
}

impl PublicKey {
    /// Decode key bytes of the given `k=` type
    pub fn decode(key_type: &str, bytes: &[u8]) -> Result<Self, DkimFailure> {
        match key_type {
            "rsa" => RsaPublicKey::from_public_key_der(bytes)
                .or_else(|_| RsaPublicKey::from_pkcs1_der(bytes))
                .map(PublicKey::Rsa)
                .map_err(|_| DkimFailure::KeySyntax),
            "ed25519" => {
                if bytes.len() == 32 {
                    Ok(PublicKey::Ed25519(bytes.to_vec()))
                } else {
                    Err(DkimFailure::KeySyntax)
                }
            }
            _ => Err(DkimFailure::InappropriateKey),
        }
    }

    pub fn from_record(record: &DkimKeyRecord) -> Result<Self, DkimFailure> {
        Self::decode(&record.key_type, &record.public_key)
    }

    pub fn suits(&self, algorithm: Algorithm) -> bool {
        matches!(
            (self, algorithm),
            (PublicKey::Rsa(_), Algorithm::RsaSha256) | (PublicKey::Ed25519(_), Algorithm::Ed25519Sha256)
        )
    }

    /// Modulus size for RSA, 256 for Ed25519
    pub fn bits(&self) -> usize {
        match self {
            PublicKey::Rsa(key) => key.size() * 8,
            PublicKey::Ed25519(_) => 256,
        }
    }

    pub fn is_weak(&self) -> bool {
        matches!(self, PublicKey::Rsa(_)) && self.bits() < MIN_RSA_BITS
    }

    /// Check `signature` over a SHA-256 `digest`
    pub fn verify(&self, digest: &[u8], signature: &[u8]) -> bool {
        match self {
            PublicKey::Rsa(key) => key
                .verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
                .is_ok(),
            PublicKey::Ed25519(key) => UnparsedPublicKey::new(&ED25519, key)
                .verify(digest, signature)
                .is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let record = DkimKeyRecord::parse("p=dGVzdA==").unwrap();
        assert_eq!(record.key_type, "rsa");
        assert!(record.allows_sha256());
        assert!(record.allows_email());
        assert!(!record.is_revoked());
        assert!(!record.is_strict());
    }

    #[test]
    fn test_parse_full_record() {
        let record =
            DkimKeyRecord::parse("v=DKIM1; k=ed25519; h=sha256; s=email; t=y:s; p=dGVz dA==")
                .unwrap();
        assert_eq!(record.key_type, "ed25519");
        assert!(record.is_testing());
        assert!(record.is_strict());
        assert_eq!(record.public_key, b"test");
    }

    #[test]
    fn test_revoked_record() {
        let record = DkimKeyRecord::parse("v=DKIM1; k=rsa; p=").unwrap();
        assert!(record.is_revoked());
    }

    #[test]
    fn test_record_errors() {
        assert_eq!(DkimKeyRecord::parse("v=DKIM1; k=rsa"), Err(DkimFailure::KeySyntax));
        assert_eq!(DkimKeyRecord::parse("v=DKIM2; p=dGVzdA=="), Err(DkimFailure::KeySyntax));
        assert_eq!(DkimKeyRecord::parse("p=!!!"), Err(DkimFailure::KeySyntax));
    }

    #[test]
    fn test_hash_restriction() {
        let record = DkimKeyRecord::parse("h=sha1; p=dGVzdA==").unwrap();
        assert!(!record.allows_sha256());
    }

    #[test]
    fn test_to_txt() {
        assert_eq!(
            DkimKeyRecord::to_txt(Algorithm::Ed25519Sha256, b"test"),
            "v=DKIM1; k=ed25519; p=dGVzdA=="
        );
    }

    #[test]
    fn test_decode_rejects_bad_keys() {
        assert_eq!(
            PublicKey::decode("ed25519", &[0u8; 31]).unwrap_err(),
            DkimFailure::KeySyntax
        );
        assert_eq!(
            PublicKey::decode("rsa", b"not a key").unwrap_err(),
            DkimFailure::KeySyntax
        );
        assert_eq!(
            PublicKey::decode("dsa", b"x").unwrap_err(),
            DkimFailure::InappropriateKey
        );
    }
}
