use crate::error::{AuthError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub dkim: DkimConfig,
    #[serde(default)]
    pub spf: SpfConfig,
    #[serde(default)]
    pub dmarc: DmarcConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// Upper bound for a single lookup
    #[serde(default = "default_dns_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_min_ttl")]
    pub min_ttl_secs: u64,
    #[serde(default = "default_max_ttl")]
    pub max_ttl_secs: u64,
    /// How long NXDOMAIN / empty answers are remembered
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DkimConfig {
    /// Algorithm used by `generate`/`rotate` when none is given
    #[serde(default = "default_algorithm")]
    pub default_algorithm: String,
    #[serde(default = "default_rsa_bits")]
    pub rsa_key_bits: usize,
    #[serde(default = "default_canonicalization")]
    pub header_canonicalization: String,
    #[serde(default = "default_canonicalization")]
    pub body_canonicalization: String,
    #[serde(default = "default_signed_headers")]
    pub signed_headers: Vec<String>,
    /// Signature lifetime (x= tag); 0 disables expiration
    #[serde(default = "default_expire_after")]
    pub expire_after_secs: u64,
    /// Body length limit (l= tag); unset signs the whole body
    pub body_length_limit: Option<u64>,
    /// New keys expire this many days after creation; unset never expires
    pub key_lifetime_days: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpfConfig {
    #[serde(default = "default_max_lookups")]
    pub max_lookups: u32,
    #[serde(default = "default_max_void_lookups")]
    pub max_void_lookups: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DmarcConfig {
    /// authserv-id written into Authentication-Results
    #[serde(default = "default_authserv_id")]
    pub authserv_id: String,
    /// Collect aggregate report entries
    #[serde(default = "default_true")]
    pub reporting_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CryptoConfig {
    /// Concurrent RSA/Ed25519 sign or verify operations
    #[serde(default = "default_max_concurrent_ops")]
    pub max_concurrent_ops: usize,
}

#[derive(Clone, Deserialize, Serialize, Default)]
pub struct KeysConfig {
    /// SQLite URL for the key store; in-memory store when unset
    pub database_url: Option<String>,
    /// Base64 AES-256 key sealing private keys in the database
    #[serde(skip_serializing)]
    pub encryption_key: Option<String>,
}

impl fmt::Debug for KeysConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeysConfig")
            .field("database_url", &self.database_url)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

fn default_dns_timeout() -> u64 {
    5
}

fn default_min_ttl() -> u64 {
    60
}

fn default_max_ttl() -> u64 {
    3600
}

fn default_negative_ttl() -> u64 {
    300
}

fn default_algorithm() -> String {
    "rsa-sha256".to_string()
}

fn default_rsa_bits() -> usize {
    2048
}

fn default_canonicalization() -> String {
    "relaxed".to_string()
}

fn default_signed_headers() -> Vec<String> {
    [
        "from",
        "to",
        "cc",
        "subject",
        "date",
        "message-id",
        "reply-to",
        "references",
        "in-reply-to",
        "content-type",
        "mime-version",
    ]
    .iter()
    .map(|h| h.to_string())
    .collect()
}

fn default_expire_after() -> u64 {
    7 * 24 * 3600
}

fn default_max_lookups() -> u32 {
    10
}

fn default_max_void_lookups() -> u32 {
    2
}

fn default_authserv_id() -> String {
    "localhost".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_ops() -> usize {
    4
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_dns_timeout(),
            min_ttl_secs: default_min_ttl(),
            max_ttl_secs: default_max_ttl(),
            negative_ttl_secs: default_negative_ttl(),
        }
    }
}

impl DnsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            default_algorithm: default_algorithm(),
            rsa_key_bits: default_rsa_bits(),
            header_canonicalization: default_canonicalization(),
            body_canonicalization: default_canonicalization(),
            signed_headers: default_signed_headers(),
            expire_after_secs: default_expire_after(),
            body_length_limit: None,
            key_lifetime_days: None,
        }
    }
}

impl Default for SpfConfig {
    fn default() -> Self {
        Self {
            max_lookups: default_max_lookups(),
            max_void_lookups: default_max_void_lookups(),
        }
    }
}

impl Default for DmarcConfig {
    fn default() -> Self {
        Self {
            authserv_id: default_authserv_id(),
            reporting_enabled: true,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            max_concurrent_ops: default_max_concurrent_ops(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AuthError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make every evaluation fail
    pub fn validate(&self) -> Result<()> {
        if self.dns.timeout_secs == 0 {
            return Err(AuthError::Config("dns.timeout_secs must be > 0".to_string()));
        }
        if self.dns.min_ttl_secs > self.dns.max_ttl_secs {
            return Err(AuthError::Config(
                "dns.min_ttl_secs must not exceed dns.max_ttl_secs".to_string(),
            ));
        }
        if self.crypto.max_concurrent_ops == 0 {
            return Err(AuthError::Config(
                "crypto.max_concurrent_ops must be > 0".to_string(),
            ));
        }
        if self.dkim.rsa_key_bits < 1024 {
            return Err(AuthError::Config(
                "dkim.rsa_key_bits must be at least 1024".to_string(),
            ));
        }
        crate::dkim::Algorithm::parse(&self.dkim.default_algorithm).ok_or_else(|| {
            AuthError::Config(format!(
                "unsupported dkim.default_algorithm: {}",
                self.dkim.default_algorithm
            ))
        })?;
        for mode in [
            &self.dkim.header_canonicalization,
            &self.dkim.body_canonicalization,
        ] {
            crate::dkim::Canonicalization::parse(mode).ok_or_else(|| {
                AuthError::Config(format!("unsupported canonicalization: {}", mode))
            })?;
        }
        if !self
            .dkim
            .signed_headers
            .iter()
            .any(|h| h.eq_ignore_ascii_case("from"))
        {
            return Err(AuthError::Config(
                "dkim.signed_headers must include from".to_string(),
            ));
        }
        if self.dkim.key_lifetime_days == Some(0) {
            return Err(AuthError::Config(
                "dkim.key_lifetime_days must be > 0".to_string(),
            ));
        }
        if let Some(encoded) = &self.keys.encryption_key {
            crate::dkim::KeyCipher::from_base64(encoded)?;
        }
        Ok(())
    }
}
