use serde::Serialize;
use std::net::IpAddr;

use crate::dkim::{DkimOutcome, DkimResult};
use crate::dmarc::{DmarcOutcome, DmarcStatus};
use crate::spf::{SpfOutcome, SpfResult, SpfScope};

/// SMTP envelope of an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Connecting client
    pub client_ip: IpAddr,
    /// HELO/EHLO name
    pub helo: String,
    /// MAIL FROM address, empty for the null sender
    pub mail_from: String,
}

impl Envelope {
    pub fn new(client_ip: IpAddr, helo: impl Into<String>, mail_from: impl Into<String>) -> Self {
        Self {
            client_ip,
            helo: helo.into(),
            mail_from: mail_from.into(),
        }
    }
}

/// Combined authentication results for one inbound message
///
/// Built once per message and never changed afterwards. Carries no
/// timestamps, so identical input and DNS state give an identical value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthResult {
    pub spf: SpfOutcome,
    /// One entry per DKIM-Signature, in header order
    pub dkim: Vec<DkimOutcome>,
    pub dmarc: DmarcOutcome,
}

impl AuthResult {
    /// Generate an Authentication-Results header value (RFC 8601)
    pub fn to_header(&self, authserv_id: &str) -> String {
        let mut parts = vec![authserv_id.to_string()];

        let spf_reason = match &self.spf.result {
            SpfResult::PermFail(error) => format!(" ({})", error),
            SpfResult::TempFail(reason) => format!(" ({})", reason),
            _ => String::new(),
        };
        let spf_property = match self.spf.scope {
            SpfScope::MailFrom => "smtp.mailfrom",
            SpfScope::Helo => "smtp.helo",
        };
        parts.push(format!(
            "spf={}{} {}={}",
            self.spf.result, spf_reason, spf_property, self.spf.domain
        ));

        if self.dkim.is_empty() {
            parts.push("dkim=none".to_string());
        }
        for outcome in &self.dkim {
            let mut part = format!("dkim={}", outcome.result);
            match &outcome.result {
                DkimResult::PermFail(failure) => part.push_str(&format!(" ({})", failure)),
                DkimResult::TempFail(reason) => part.push_str(&format!(" ({})", reason)),
                DkimResult::Pass => {}
            }
            if !outcome.domain.is_empty() {
                part.push_str(&format!(" header.d={}", outcome.domain));
            }
            if !outcome.selector.is_empty() {
                part.push_str(&format!(" header.s={}", outcome.selector));
            }
            parts.push(part);
        }

        let mut dmarc = format!("dmarc={}", self.dmarc.status);
        if self.dmarc.status != DmarcStatus::NoPolicy {
            if let Some(policy) = self.dmarc.policy {
                dmarc.push_str(&format!(" (p={})", policy));
            }
        }
        if !self.dmarc.from_domain.is_empty() {
            dmarc.push_str(&format!(" header.from={}", self.dmarc.from_domain));
        }
        parts.push(dmarc);

        parts.join("; ")
    }
}

/// Who signed an outbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedBy {
    pub domain: String,
    pub selector: String,
    pub key_id: String,
}

/// Outbound message after the signing step
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub bytes: Vec<u8>,
    /// `None` when the message passed through unsigned
    pub signed_by: Option<SignedBy>,
}

impl OutboundMessage {
    pub fn is_signed(&self) -> bool {
        self.signed_by.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkim::DkimFailure;
    use crate::dmarc::Policy;
    use crate::spf::SpfError;

    fn dmarc(status: DmarcStatus, policy: Option<Policy>) -> DmarcOutcome {
        DmarcOutcome {
            status,
            aligned: status == DmarcStatus::Pass,
            spf_aligned: false,
            dkim_aligned: status == DmarcStatus::Pass,
            disposition: Policy::None,
            sampled_out: false,
            policy_domain: policy.map(|_| "example.com".to_string()),
            policy,
            from_domain: "example.com".to_string(),
        }
    }

    fn spf(result: SpfResult) -> SpfOutcome {
        SpfOutcome {
            result,
            domain: "example.com".to_string(),
            scope: SpfScope::MailFrom,
        }
    }

    #[test]
    fn test_header_all_pass() {
        let results = AuthResult {
            spf: spf(SpfResult::Pass),
            dkim: vec![DkimOutcome {
                domain: "example.com".to_string(),
                selector: "mail".to_string(),
                result: DkimResult::Pass,
            }],
            dmarc: dmarc(DmarcStatus::Pass, Some(Policy::Reject)),
        };

        assert_eq!(
            results.to_header("mx.example.org"),
            "mx.example.org; spf=pass smtp.mailfrom=example.com; \
             dkim=pass header.d=example.com header.s=mail; \
             dmarc=pass (p=reject) header.from=example.com"
        );
    }

    #[test]
    fn test_header_failures() {
        let results = AuthResult {
            spf: spf(SpfResult::PermFail(SpfError::TooManyLookups)),
            dkim: vec![
                DkimOutcome {
                    domain: "example.com".to_string(),
                    selector: "mail".to_string(),
                    result: DkimResult::PermFail(DkimFailure::BodyHash),
                },
                DkimOutcome {
                    domain: "example.net".to_string(),
                    selector: "s1".to_string(),
                    result: DkimResult::TempFail("dns: timeout".to_string()),
                },
            ],
            dmarc: dmarc(DmarcStatus::Fail, Some(Policy::Quarantine)),
        };

        let header = results.to_header("mx.example.org");
        assert!(header.contains("spf=permerror (too-many-lookups) smtp.mailfrom=example.com"));
        assert!(header.contains("dkim=fail (body-hash) header.d=example.com header.s=mail"));
        assert!(header.contains("dkim=temperror (dns: timeout) header.d=example.net"));
        assert!(header.contains("dmarc=fail (p=quarantine) header.from=example.com"));
    }

    #[test]
    fn test_header_unsigned_helo() {
        let results = AuthResult {
            spf: SpfOutcome {
                result: SpfResult::None,
                domain: "relay.example.com".to_string(),
                scope: SpfScope::Helo,
            },
            dkim: Vec::new(),
            dmarc: dmarc(DmarcStatus::NoPolicy, None),
        };

        assert_eq!(
            results.to_header("mx"),
            "mx; spf=none smtp.helo=relay.example.com; dkim=none; dmarc=none header.from=example.com"
        );
    }

    #[test]
    fn test_serialization() {
        let results = AuthResult {
            spf: spf(SpfResult::SoftFail),
            dkim: Vec::new(),
            dmarc: dmarc(DmarcStatus::NoPolicy, None),
        };

        let json = serde_json::to_value(&results).unwrap();
        assert_eq!(json["spf"]["scope"], "mailfrom");
        assert_eq!(json["dmarc"]["status"], "nopolicy");
        assert_eq!(json["dmarc"]["sampledOut"], false);
    }
}
