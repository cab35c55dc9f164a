//! DMARC aggregate reporting (RFC 7489 section 7.2)
//!
//! Every evaluation that found a policy is recorded here. Identical rows
//! are counted rather than stored twice; [`AggregateReporter::drain`] turns
//! the accumulated rows into one report per policy domain.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Alignment, Policy};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignedResult {
    Pass,
    Fail,
}

impl AlignedResult {
    pub fn from_bool(pass: bool) -> Self {
        if pass {
            AlignedResult::Pass
        } else {
            AlignedResult::Fail
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlignedResult::Pass => "pass",
            AlignedResult::Fail => "fail",
        }
    }
}

/// One underlying SPF or DKIM result, before alignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawResult {
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    pub result: String,
}

/// Policy as found in DNS, echoed back in reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedPolicy {
    pub domain: String,
    pub adkim: Alignment,
    pub aspf: Alignment,
    pub p: Policy,
    pub sp: Policy,
    pub pct: u8,
}

/// What one evaluation contributes to the aggregate
#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub policy: PublishedPolicy,
    pub source_ip: IpAddr,
    pub header_from: String,
    pub disposition: Policy,
    pub dkim_aligned: AlignedResult,
    pub spf_aligned: AlignedResult,
    pub dkim: Vec<RawResult>,
    pub spf: RawResult,
}

/// Accumulated row: identical evaluations share one row
#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub source_ip: IpAddr,
    pub count: u64,
    pub disposition: Policy,
    pub dkim_aligned: AlignedResult,
    pub spf_aligned: AlignedResult,
    pub header_from: String,
    pub dkim: Vec<RawResult>,
    pub spf: RawResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RowKey {
    policy_domain: String,
    source_ip: IpAddr,
    header_from: String,
    disposition: Policy,
    dkim_aligned: AlignedResult,
    spf_aligned: AlignedResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateReport {
    pub org_name: String,
    pub email: String,
    pub report_id: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub policy: PublishedPolicy,
    pub records: Vec<ReportRow>,
}

#[derive(Default)]
struct Accumulator {
    rows: HashMap<RowKey, ReportRow>,
    policies: HashMap<String, PublishedPolicy>,
}

/// Thread-safe collector of report entries
#[derive(Default)]
pub struct AggregateReporter {
    inner: Mutex<Accumulator>,
}

impl AggregateReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, entry: ReportEntry) {
        let key = RowKey {
            policy_domain: entry.policy.domain.clone(),
            source_ip: entry.source_ip,
            header_from: entry.header_from.clone(),
            disposition: entry.disposition,
            dkim_aligned: entry.dkim_aligned,
            spf_aligned: entry.spf_aligned,
        };

        let mut inner = self.inner.lock().await;
        inner
            .policies
            .insert(entry.policy.domain.clone(), entry.policy.clone());
        inner
            .rows
            .entry(key)
            .and_modify(|row| row.count += 1)
            .or_insert_with(|| ReportRow {
                source_ip: entry.source_ip,
                count: 1,
                disposition: entry.disposition,
                dkim_aligned: entry.dkim_aligned,
                spf_aligned: entry.spf_aligned,
                header_from: entry.header_from,
                dkim: entry.dkim,
                spf: entry.spf,
            });
        debug!(domain = %entry.policy.domain, "Recorded DMARC report entry");
    }

    /// Current rows grouped by policy domain, without resetting
    pub async fn snapshot(&self) -> BTreeMap<String, Vec<ReportRow>> {
        let inner = self.inner.lock().await;
        group(inner.rows.iter().map(|(k, row)| (k.policy_domain.clone(), row.clone())))
    }

    /// Number of distinct rows held
    pub async fn len(&self) -> usize {
        self.inner.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Build one report per policy domain and start over
    pub async fn drain(
        &self,
        org_name: &str,
        email: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<AggregateReport> {
        let (rows, policies) = {
            let mut inner = self.inner.lock().await;
            let taken = std::mem::take(&mut *inner);
            (taken.rows, taken.policies)
        };

        let reports: Vec<AggregateReport> = group(rows.into_iter().map(|(k, row)| (k.policy_domain, row)))
            .into_iter()
            .filter_map(|(domain, records)| {
                let policy = policies.get(&domain)?.clone();
                Some(AggregateReport {
                    org_name: org_name.to_string(),
                    email: email.to_string(),
                    report_id: Uuid::new_v4().to_string(),
                    begin,
                    end,
                    policy,
                    records,
                })
            })
            .collect();

        info!("Drained {} DMARC aggregate report(s)", reports.len());
        reports
    }
}

fn group<I>(rows: I) -> BTreeMap<String, Vec<ReportRow>>
where
    I: Iterator<Item = (String, ReportRow)>,
{
    let mut grouped: BTreeMap<String, Vec<ReportRow>> = BTreeMap::new();
    for (domain, row) in rows {
        grouped.entry(domain).or_default().push(row);
    }
    for rows in grouped.values_mut() {
        rows.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.source_ip.cmp(&b.source_ip))
                .then_with(|| a.header_from.cmp(&b.header_from))
        });
    }
    grouped
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn element(out: &mut String, depth: usize, name: &str, value: &str) {
    out.push_str(&"  ".repeat(depth));
    out.push_str(&format!("<{0}>{1}</{0}>\n", name, xml_escape(value)));
}

fn open(out: &mut String, depth: usize, name: &str) {
    out.push_str(&format!("{}<{}>\n", "  ".repeat(depth), name));
}

fn close(out: &mut String, depth: usize, name: &str) {
    out.push_str(&format!("{}</{}>\n", "  ".repeat(depth), name));
}

impl AggregateReport {
    /// RFC 7489 Appendix C `feedback` document
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<feedback>\n");

        open(&mut out, 1, "report_metadata");
        element(&mut out, 2, "org_name", &self.org_name);
        element(&mut out, 2, "email", &self.email);
        element(&mut out, 2, "report_id", &self.report_id);
        open(&mut out, 2, "date_range");
        element(&mut out, 3, "begin", &self.begin.timestamp().to_string());
        element(&mut out, 3, "end", &self.end.timestamp().to_string());
        close(&mut out, 2, "date_range");
        close(&mut out, 1, "report_metadata");

        open(&mut out, 1, "policy_published");
        element(&mut out, 2, "domain", &self.policy.domain);
        element(&mut out, 2, "adkim", &self.policy.adkim.as_char().to_string());
        element(&mut out, 2, "aspf", &self.policy.aspf.as_char().to_string());
        element(&mut out, 2, "p", self.policy.p.as_str());
        element(&mut out, 2, "sp", self.policy.sp.as_str());
        element(&mut out, 2, "pct", &self.policy.pct.to_string());
        close(&mut out, 1, "policy_published");

        for row in &self.records {
            open(&mut out, 1, "record");
            open(&mut out, 2, "row");
            element(&mut out, 3, "source_ip", &row.source_ip.to_string());
            element(&mut out, 3, "count", &row.count.to_string());
            open(&mut out, 3, "policy_evaluated");
            element(&mut out, 4, "disposition", row.disposition.as_str());
            element(&mut out, 4, "dkim", row.dkim_aligned.as_str());
            element(&mut out, 4, "spf", row.spf_aligned.as_str());
            close(&mut out, 3, "policy_evaluated");
            close(&mut out, 2, "row");

            open(&mut out, 2, "identifiers");
            element(&mut out, 3, "header_from", &row.header_from);
            close(&mut out, 2, "identifiers");

            open(&mut out, 2, "auth_results");
            for dkim in &row.dkim {
                open(&mut out, 3, "dkim");
                element(&mut out, 4, "domain", &dkim.domain);
                if let Some(selector) = &dkim.selector {
                    element(&mut out, 4, "selector", selector);
                }
                element(&mut out, 4, "result", &dkim.result);
                close(&mut out, 3, "dkim");
            }
            open(&mut out, 3, "spf");
            element(&mut out, 4, "domain", &row.spf.domain);
            element(&mut out, 4, "result", &row.spf.result);
            close(&mut out, 3, "spf");
            close(&mut out, 2, "auth_results");
            close(&mut out, 1, "record");
        }

        out.push_str("</feedback>\n");
        out
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(domain: &str) -> PublishedPolicy {
        PublishedPolicy {
            domain: domain.to_string(),
            adkim: Alignment::Relaxed,
            aspf: Alignment::Strict,
            p: Policy::Reject,
            sp: Policy::Reject,
            pct: 100,
        }
    }

    fn entry(domain: &str, ip: &str, from: &str, pass: bool) -> ReportEntry {
        ReportEntry {
            policy: policy(domain),
            source_ip: ip.parse().unwrap(),
            header_from: from.to_string(),
            disposition: if pass { Policy::None } else { Policy::Reject },
            dkim_aligned: AlignedResult::from_bool(pass),
            spf_aligned: AlignedResult::Fail,
            dkim: vec![RawResult {
                domain: domain.to_string(),
                selector: Some("mail".to_string()),
                result: if pass { "pass" } else { "fail" }.to_string(),
            }],
            spf: RawResult {
                domain: domain.to_string(),
                selector: None,
                result: "softfail".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_identical_entries_are_counted() {
        let reporter = AggregateReporter::new();
        for _ in 0..3 {
            reporter.record(entry("example.com", "192.0.2.1", "example.com", true)).await;
        }
        reporter.record(entry("example.com", "192.0.2.1", "example.com", false)).await;
        reporter.record(entry("example.org", "198.51.100.7", "example.org", false)).await;

        let snapshot = reporter.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        let rows = &snapshot["example.com"];
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].count, 3);
        assert_eq!(reporter.len().await, 3);
    }

    #[tokio::test]
    async fn test_drain_builds_reports_and_resets() {
        let reporter = AggregateReporter::new();
        reporter.record(entry("example.com", "192.0.2.1", "example.com", true)).await;
        reporter.record(entry("example.org", "192.0.2.2", "example.org", false)).await;

        let end = Utc::now();
        let begin = end - chrono::Duration::days(1);
        let reports = reporter.drain("Receiver Inc", "dmarc@receiver.example", begin, end).await;

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].policy.domain, "example.com");
        assert_eq!(reports[1].records[0].disposition, Policy::Reject);
        assert!(reporter.is_empty().await);
    }

    #[tokio::test]
    async fn test_xml_is_escaped_and_shaped() {
        let reporter = AggregateReporter::new();
        reporter.record(entry("example.com", "192.0.2.1", "a<b>&c.example", false)).await;

        let end = Utc::now();
        let reports = reporter
            .drain("R & D <Mail>", "dmarc@receiver.example", end - chrono::Duration::hours(1), end)
            .await;
        let xml = reports[0].to_xml();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<feedback>"));
        assert!(xml.contains("<org_name>R &amp; D &lt;Mail&gt;</org_name>"));
        assert!(xml.contains("<header_from>a&lt;b&gt;&amp;c.example</header_from>"));
        assert!(xml.contains("<aspf>s</aspf>"));
        assert!(xml.contains("<disposition>reject</disposition>"));
        assert!(xml.contains("<selector>mail</selector>"));
        assert!(xml.trim_end().ends_with("</feedback>"));
    }

    #[tokio::test]
    async fn test_json_report() {
        let reporter = AggregateReporter::new();
        reporter.record(entry("example.com", "192.0.2.1", "example.com", true)).await;

        let end = Utc::now();
        let reports = reporter.drain("Receiver", "r@example.net", end, end).await;
        let json: serde_json::Value = serde_json::from_str(&reports[0].to_json().unwrap()).unwrap();

        assert_eq!(json["policy"]["domain"], "example.com");
        assert_eq!(json["records"][0]["count"], 1);
        assert_eq!(json["records"][0]["dkim_aligned"], "pass");
    }
}
