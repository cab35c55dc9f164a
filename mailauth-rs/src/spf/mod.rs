//! SPF (Sender Policy Framework), RFC 7208
//!
//! SPF lets a domain list the hosts allowed to use it in the SMTP envelope.
//! [`SpfEvaluator`] checks a connecting client against the MAIL FROM domain
//! (or the HELO domain for bounces).
//!
//! # Example
//! ```no_run
//! use mailauth_rs::config::SpfConfig;
//! use mailauth_rs::dns::TrustDnsResolver;
//! use mailauth_rs::spf::{SpfEvaluator, SpfResult};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let evaluator = SpfEvaluator::new(Arc::new(TrustDnsResolver::from_system_conf()), SpfConfig::default());
//! let outcome = evaluator
//!     .evaluate("192.0.2.1".parse().unwrap(), "mail.example.com", "sender@example.com")
//!     .await;
//!
//! match outcome.result {
//!     SpfResult::Pass => println!("authorized"),
//!     SpfResult::Fail => println!("not authorized"),
//!     other => println!("spf={}", other),
//! }
//! # }
//! ```

pub mod evaluator;
pub mod macros;
pub mod record;

pub use evaluator::{SpfEvaluator, SpfOutcome, SpfScope};
pub use record::{Directive, Mechanism, Qualifier, SpfRecord};

use serde::Serialize;
use std::fmt;

/// Why an SPF evaluation ended in `permerror`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpfError {
    Syntax,
    MultipleRecords,
    /// `include` or `redirect` target publishes no SPF record
    MissingRecord,
    TooManyLookups,
    TooManyVoidLookups,
    Loop,
}

impl SpfError {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpfError::Syntax => "syntax",
            SpfError::MultipleRecords => "multiple-records",
            SpfError::MissingRecord => "missing-record",
            SpfError::TooManyLookups => "too-many-lookups",
            SpfError::TooManyVoidLookups => "too-many-void-lookups",
            SpfError::Loop => "loop",
        }
    }
}

impl fmt::Display for SpfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SPF check result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum SpfResult {
    /// No SPF record published
    None,
    Neutral,
    Pass,
    Fail,
    SoftFail,
    /// Transient DNS problem, retrying later may succeed
    #[serde(rename = "temperror")]
    TempFail(String),
    #[serde(rename = "permerror")]
    PermFail(SpfError),
}

impl SpfResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, SpfResult::Pass)
    }

    /// Keyword used in Authentication-Results and Received-SPF
    pub fn as_str(&self) -> &'static str {
        match self {
            SpfResult::None => "none",
            SpfResult::Neutral => "neutral",
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::TempFail(_) => "temperror",
            SpfResult::PermFail(_) => "permerror",
        }
    }
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
