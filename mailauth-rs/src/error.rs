use thiserror::Error;

use crate::dns::DnsError;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Key {0} is not published")]
    NotPublished(String),

    #[error("Invalid key transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: String,
        to: String,
    },

    #[error("No active DKIM key for domain {0}")]
    NoActiveKey(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl AuthError {
    /// Missing signing material is an operator problem, not a message problem
    pub fn is_config_error(&self) -> bool {
        matches!(self, AuthError::NoActiveKey(_) | AuthError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
