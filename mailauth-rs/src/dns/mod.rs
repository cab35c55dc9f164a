//! DNS access for DKIM, SPF and DMARC lookups
//!
//! Everything that touches the network goes through the [`DnsResolver`]
//! trait so evaluators can run against a real resolver, a static in-memory
//! zone, or a [`DnsCache`] wrapping either.
//!
//! # Example
//! ```no_run
//! use mailauth_rs::config::DnsConfig;
//! use mailauth_rs::dns::{DnsCache, DnsResolver, TrustDnsResolver};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = Arc::new(TrustDnsResolver::from_system_conf());
//! let cache = DnsCache::new(resolver, &DnsConfig::default());
//!
//! let answer = cache.txt_lookup("_dmarc.example.com").await?;
//! for record in &answer.records {
//!     println!("{}", record);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod resolver;

pub use cache::DnsCache;
pub use resolver::{DnsResolver, MemoryResolver, TrustDnsResolver};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Records returned by a lookup together with their remaining lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer<T> {
    pub records: Vec<T>,
    pub ttl: Duration,
}

impl<T> Answer<T> {
    pub fn new(records: Vec<T>, ttl: Duration) -> Self {
        Self { records, ttl }
    }
}

/// One MX target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MxHost {
    pub preference: u16,
    pub exchange: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// NXDOMAIN
    #[error("domain not found: {0}")]
    NotFound(String),

    /// The name exists but has no records of the requested type
    #[error("no records for {0}")]
    NoRecords(String),

    #[error("lookup timed out: {0}")]
    Timeout(String),

    #[error("server failure: {0}")]
    ServFail(String),
}

impl DnsError {
    /// Timeouts and server failures may succeed on retry
    pub fn is_temporary(&self) -> bool {
        matches!(self, DnsError::Timeout(_) | DnsError::ServFail(_))
    }

    /// NXDOMAIN or NODATA, the "void lookup" of RFC 7208
    pub fn is_void(&self) -> bool {
        matches!(self, DnsError::NotFound(_) | DnsError::NoRecords(_))
    }
}

/// Lowercase and strip the root dot so cache keys and zone entries agree
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(DnsError::Timeout("a".into()).is_temporary());
        assert!(DnsError::ServFail("a".into()).is_temporary());
        assert!(!DnsError::NotFound("a".into()).is_temporary());
        assert!(DnsError::NoRecords("a".into()).is_void());
        assert!(!DnsError::Timeout("a".into()).is_void());
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Example.COM."), "example.com");
        assert_eq!(normalize_name(" _dmarc.example.com "), "_dmarc.example.com");
    }
}
