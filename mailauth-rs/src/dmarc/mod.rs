//! DMARC (Domain-based Message Authentication, Reporting & Conformance)
//!
//! This module implements DMARC policy evaluation according to RFC 7489.
//! DMARC ties SPF and DKIM results to the domain in the `From:` header and
//! tells receivers what to do with mail that fails.
//!
//! # Example
//! ```no_run
//! use mailauth_rs::dmarc::{DmarcEvaluator, DmarcInput, DmarcStatus};
//! use mailauth_rs::dns::TrustDnsResolver;
//! use mailauth_rs::spf::{SpfOutcome, SpfResult, SpfScope};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let evaluator = DmarcEvaluator::new(Arc::new(TrustDnsResolver::from_system_conf()));
//! let spf = SpfOutcome {
//!     result: SpfResult::Pass,
//!     domain: "example.com".to_string(),
//!     scope: SpfScope::MailFrom,
//! };
//!
//! let outcome = evaluator
//!     .evaluate(DmarcInput {
//!         from_domain: "example.com",
//!         spf: &spf,
//!         dkim: &[],
//!         client_ip: "192.0.2.1".parse().unwrap(),
//!         raw: b"From: a@example.com\r\n\r\nHi\r\n",
//!     })
//!     .await;
//!
//! if outcome.status == DmarcStatus::Fail {
//!     println!("apply {}", outcome.disposition);
//! }
//! # }
//! ```

pub mod evaluator;
pub mod record;
pub mod report;

pub use evaluator::{DmarcEvaluator, DmarcInput, DmarcOutcome};
pub use record::DmarcRecord;
pub use report::{AggregateReport, AggregateReporter, ReportEntry};

use serde::Serialize;
use std::fmt;

/// Requested handling of failing mail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    None,
    Quarantine,
    Reject,
}

impl Policy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Policy::None),
            "quarantine" => Some(Policy::Quarantine),
            "reject" => Some(Policy::Reject),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::None => "none",
            Policy::Quarantine => "quarantine",
            Policy::Reject => "reject",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier alignment mode (`adkim` / `aspf`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    Relaxed,
    Strict,
}

impl Alignment {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "r" | "R" => Some(Alignment::Relaxed),
            "s" | "S" => Some(Alignment::Strict),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Alignment::Relaxed => 'r',
            Alignment::Strict => 's',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DmarcStatus {
    /// No usable policy was published (or it could not be fetched)
    NoPolicy,
    Pass,
    Fail,
}

impl DmarcStatus {
    /// Keyword used in Authentication-Results
    pub fn as_str(&self) -> &'static str {
        match self {
            DmarcStatus::NoPolicy => "none",
            DmarcStatus::Pass => "pass",
            DmarcStatus::Fail => "fail",
        }
    }
}

impl fmt::Display for DmarcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Organizational domain per the public suffix list
///
/// Names the list cannot place (like `localhost`) are their own
/// organizational domain.
pub fn organizational_domain(domain: &str) -> String {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    psl::domain_str(&domain)
        .map(|d| d.to_string())
        .unwrap_or(domain)
}

/// Whether `identifier` aligns with the `From:` domain under `mode`
pub fn is_aligned(identifier: &str, from_domain: &str, mode: Alignment) -> bool {
    let identifier = identifier.trim().trim_end_matches('.');
    let from_domain = from_domain.trim().trim_end_matches('.');
    if identifier.is_empty() || from_domain.is_empty() {
        return false;
    }
    match mode {
        Alignment::Strict => identifier.eq_ignore_ascii_case(from_domain),
        Alignment::Relaxed => organizational_domain(identifier) == organizational_domain(from_domain),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_organizational_domain() {
        assert_eq!(organizational_domain("mail.example.com"), "example.com");
        assert_eq!(organizational_domain("Example.COM."), "example.com");
        assert_eq!(organizational_domain("a.b.example.co.uk"), "example.co.uk");
    }

    #[test]
    fn test_alignment_modes() {
        assert!(is_aligned("example.com", "example.com", Alignment::Strict));
        assert!(!is_aligned("example.com", "mail.example.com", Alignment::Strict));
        assert!(is_aligned("example.com", "mail.example.com", Alignment::Relaxed));
        assert!(is_aligned("bounce.example.com", "news.example.com", Alignment::Relaxed));
        assert!(!is_aligned("example.net", "example.com", Alignment::Relaxed));
        assert!(!is_aligned("", "example.com", Alignment::Relaxed));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(Policy::parse("Reject"), Some(Policy::Reject));
        assert_eq!(Policy::parse("bounce"), None);
        assert_eq!(Alignment::parse("s"), Some(Alignment::Strict));
        assert_eq!(Alignment::parse("x"), None);
    }
}
