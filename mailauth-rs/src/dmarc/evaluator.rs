//! DMARC policy discovery and evaluation

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::record::DmarcRecord;
use super::report::{AggregateReporter, AlignedResult, PublishedPolicy, RawResult, ReportEntry};
use super::{is_aligned, organizational_domain, DmarcStatus, Policy};
use crate::dkim::DkimOutcome;
use crate::dns::DnsResolver;
use crate::spf::SpfOutcome;

/// Everything DMARC needs to know about one message
#[derive(Debug, Clone, Copy)]
pub struct DmarcInput<'a> {
    /// Domain of the `From:` header
    pub from_domain: &'a str,
    pub spf: &'a SpfOutcome,
    pub dkim: &'a [DkimOutcome],
    pub client_ip: IpAddr,
    /// Message bytes, used for deterministic `pct` sampling
    pub raw: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DmarcOutcome {
    pub status: DmarcStatus,
    /// SPF or DKIM passed in alignment
    pub aligned: bool,
    pub spf_aligned: bool,
    pub dkim_aligned: bool,
    /// What the receiver should do with the message
    pub disposition: Policy,
    pub sampled_out: bool,
    /// Domain whose `_dmarc` record applied
    pub policy_domain: Option<String>,
    /// Requested policy before `pct` sampling
    pub policy: Option<Policy>,
    pub from_domain: String,
}

impl DmarcOutcome {
    fn no_policy(from_domain: &str) -> Self {
        Self {
            status: DmarcStatus::NoPolicy,
            aligned: false,
            spf_aligned: false,
            dkim_aligned: false,
            disposition: Policy::None,
            sampled_out: false,
            policy_domain: None,
            policy: None,
            from_domain: from_domain.to_string(),
        }
    }

    /// `From:` fields naming more than one domain (RFC 7489 section 6.6.1)
    ///
    /// No single policy can be applied, so the message fails and is
    /// rejected. The topmost domain is reported.
    pub fn multiple_authors(domains: &[String]) -> Self {
        Self {
            status: DmarcStatus::Fail,
            disposition: Policy::Reject,
            ..Self::no_policy(domains.first().map_or("", String::as_str))
        }
    }
}

/// A record together with where it was found
struct FoundPolicy {
    record: DmarcRecord,
    domain: String,
    at_org_domain: bool,
}

enum Lookup {
    Found(DmarcRecord),
    Absent,
    /// DNS could not answer; evaluation degrades to no policy
    Failed,
}

/// Bucket 0-99 for `pct` sampling, stable for identical message bytes
pub fn sampling_bucket(raw: &[u8]) -> u8 {
    let digest = Sha256::digest(raw);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % 100) as u8
}

pub struct DmarcEvaluator {
    resolver: Arc<dyn DnsResolver>,
    reporter: Option<Arc<AggregateReporter>>,
}

impl DmarcEvaluator {
    pub fn new(resolver: Arc<dyn DnsResolver>) -> Self {
        Self {
            resolver,
            reporter: None,
        }
    }

    /// Record an aggregate report entry for every evaluated policy
    pub fn with_reporter(mut self, reporter: Arc<AggregateReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Evaluate against every distinct `From:` domain of the message
    ///
    /// `input.from_domain` is ignored in favour of `authors`.
    pub async fn evaluate_authors(&self, authors: &[String], input: DmarcInput<'_>) -> DmarcOutcome {
        match authors {
            [] => self.evaluate(DmarcInput { from_domain: "", ..input }).await,
            [author] => self.evaluate(DmarcInput { from_domain: author, ..input }).await,
            _ => {
                warn!(authors = %authors.join(","), "Multiple From domains, rejecting");
                DmarcOutcome::multiple_authors(authors)
            }
        }
    }

    pub async fn evaluate(&self, input: DmarcInput<'_>) -> DmarcOutcome {
        let from_domain = input.from_domain.trim().trim_end_matches('.').to_ascii_lowercase();
        if from_domain.is_empty() {
            debug!("No From domain, DMARC not applicable");
            return DmarcOutcome::no_policy(&from_domain);
        }

        let found = match self.fetch_policy(&from_domain).await {
            Some(found) => found,
            None => return DmarcOutcome::no_policy(&from_domain),
        };
        let record = &found.record;

        let spf_aligned = input.spf.result.is_pass() && is_aligned(&input.spf.domain, &from_domain, record.aspf);
        let dkim_aligned = input
            .dkim
            .iter()
            .any(|d| d.result.is_pass() && is_aligned(&d.domain, &from_domain, record.adkim));
        let aligned = spf_aligned || dkim_aligned;

        let requested = if found.at_org_domain && from_domain != found.domain {
            record.subdomain_policy()
        } else {
            record.policy
        };

        let (status, disposition, sampled_out) = if aligned {
            (DmarcStatus::Pass, Policy::None, false)
        } else if sampling_bucket(input.raw) >= record.pct {
            (DmarcStatus::Fail, Policy::None, true)
        } else {
            (DmarcStatus::Fail, requested, false)
        };

        match status {
            DmarcStatus::Pass => info!(
                domain = %from_domain,
                spf_aligned,
                dkim_aligned,
                "DMARC pass"
            ),
            _ => warn!(
                domain = %from_domain,
                policy = %requested,
                disposition = %disposition,
                sampled_out,
                "DMARC fail"
            ),
        }

        let outcome = DmarcOutcome {
            status,
            aligned,
            spf_aligned,
            dkim_aligned,
            disposition,
            sampled_out,
            policy_domain: Some(found.domain.clone()),
            policy: Some(requested),
            from_domain,
        };

        if let Some(reporter) = &self.reporter {
            reporter.record(report_entry(&found, &input, &outcome)).await;
        }

        outcome
    }

    /// Exact domain first, then the organizational domain
    async fn fetch_policy(&self, from_domain: &str) -> Option<FoundPolicy> {
        match self.lookup(from_domain).await {
            Lookup::Found(record) => {
                return Some(FoundPolicy {
                    record,
                    domain: from_domain.to_string(),
                    at_org_domain: false,
                })
            }
            Lookup::Failed => return None,
            Lookup::Absent => {}
        }

        let org = organizational_domain(from_domain);
        if org == from_domain {
            return None;
        }
        match self.lookup(&org).await {
            Lookup::Found(record) => Some(FoundPolicy {
                record,
                domain: org,
                at_org_domain: true,
            }),
            _ => None,
        }
    }

    async fn lookup(&self, domain: &str) -> Lookup {
        let name = format!("_dmarc.{}", domain);
        let answer = match self.resolver.txt_lookup(&name).await {
            Ok(answer) => answer,
            Err(e) if e.is_temporary() => {
                warn!(name = %name, error = %e, "DMARC lookup failed, treating as no policy");
                return Lookup::Failed;
            }
            Err(_) => return Lookup::Absent,
        };

        let candidates: Vec<&String> = answer
            .records
            .iter()
            .filter(|txt| DmarcRecord::is_dmarc(txt))
            .collect();
        match candidates.as_slice() {
            [txt] => match DmarcRecord::parse(txt) {
                Ok(record) => {
                    debug!(name = %name, record = %txt, "DMARC record");
                    Lookup::Found(record)
                }
                Err(e) => {
                    debug!(name = %name, error = %e, "Discarding DMARC record");
                    Lookup::Absent
                }
            },
            [] => Lookup::Absent,
            _ => {
                warn!(name = %name, count = candidates.len(), "Multiple DMARC records, ignoring all");
                Lookup::Absent
            }
        }
    }
}

fn report_entry(found: &FoundPolicy, input: &DmarcInput<'_>, outcome: &DmarcOutcome) -> ReportEntry {
    ReportEntry {
        policy: PublishedPolicy {
            domain: found.domain.clone(),
            adkim: found.record.adkim,
            aspf: found.record.aspf,
            p: found.record.policy,
            sp: found.record.subdomain_policy(),
            pct: found.record.pct,
        },
        source_ip: input.client_ip,
        header_from: outcome.from_domain.clone(),
        disposition: outcome.disposition,
        dkim_aligned: AlignedResult::from_bool(outcome.dkim_aligned),
        spf_aligned: AlignedResult::from_bool(outcome.spf_aligned),
        dkim: input
            .dkim
            .iter()
            .map(|d| RawResult {
                domain: d.domain.clone(),
                selector: Some(d.selector.clone()),
                result: d.result.to_string(),
            })
            .collect(),
        spf: RawResult {
            domain: input.spf.domain.clone(),
            selector: None,
            result: input.spf.result.to_string(),
        },
    }
}
