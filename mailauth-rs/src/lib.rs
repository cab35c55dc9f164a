//! mailauth-rs: email authentication engine
//!
//! Signs outbound mail with DKIM and checks inbound mail with DKIM, SPF and
//! DMARC, for use by an SMTP server on either side of delivery.
//!
//! # Features
//!
//! - **DKIM**: RSA-SHA256 and Ed25519-SHA256 signing and verification (RFC 6376, RFC 8463)
//! - **Key lifecycle**: generate, publish, activate, rotate and retire signing keys
//! - **SPF**: full `check_host()` with lookup limits and macros (RFC 7208)
//! - **DMARC**: alignment, policy discovery and aggregate reports (RFC 7489)
//! - **DNS**: TTL-aware cache with single-flight refresh
//!
//! # Example
//!
//! ```no_run
//! use mailauth_rs::authentication::{AuthEngine, Envelope};
//! use mailauth_rs::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = AuthEngine::from_config(Config::default()).await?;
//!
//!     let raw = std::fs::read("message.eml")?;
//!     let envelope = Envelope::new("192.0.2.1".parse()?, "mx.example.com", "sender@example.com");
//!     let result = engine.verify_inbound(&raw, &envelope).await;
//!
//!     println!("Authentication-Results: {}", engine.results_header(&result));
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`authentication`]: the engine facade used by SMTP ingress and egress
//! - [`config`]: Configuration management
//! - [`error`]: Error types and handling
//! - [`dns`]: resolver trait, system resolver and cache
//! - [`dkim`]: keys, signer and verifier
//! - [`spf`]: SPF records and evaluation
//! - [`dmarc`]: DMARC records, evaluation and reporting

pub mod authentication;
pub mod config;
pub mod crypto;
pub mod dkim;
pub mod dmarc;
pub mod dns;
pub mod error;
pub mod spf;
pub mod utils;

// Re-export commonly used types
pub use authentication::{AuthEngine, AuthResult, Envelope, OutboundMessage};
pub use config::Config;
pub use error::{AuthError, Result};
