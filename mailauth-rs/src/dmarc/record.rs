//! `_dmarc` TXT record parsing and generation

use std::fmt;

use super::{Alignment, Policy};
use crate::error::{AuthError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmarcRecord {
    /// `p=`
    pub policy: Policy,
    /// `sp=`, falls back to `p=` for subdomains when absent
    pub subdomain_policy: Option<Policy>,
    pub adkim: Alignment,
    pub aspf: Alignment,
    /// `pct=`, share of failing mail the policy applies to
    pub pct: u8,
    /// Aggregate report URIs, `!size` limits removed
    pub rua: Vec<String>,
    /// Failure report URIs
    pub ruf: Vec<String>,
    pub fo: String,
    pub rf: String,
    /// Requested aggregate report interval in seconds
    pub ri: u32,
}

impl Default for DmarcRecord {
    fn default() -> Self {
        Self {
            policy: Policy::None,
            subdomain_policy: None,
            adkim: Alignment::Relaxed,
            aspf: Alignment::Relaxed,
            pct: 100,
            rua: Vec::new(),
            ruf: Vec::new(),
            fo: "0".to_string(),
            rf: "afrf".to_string(),
            ri: 86400,
        }
    }
}

fn uri_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|uri| uri.trim())
        .filter(|uri| !uri.is_empty())
        .map(|uri| match uri.find('!') {
            Some(idx) => uri[..idx].to_string(),
            None => uri.to_string(),
        })
        .collect()
}

impl DmarcRecord {
    /// Whether a TXT string claims to be a DMARC record
    pub fn is_dmarc(txt: &str) -> bool {
        txt.trim_start()
            .split(';')
            .next()
            .and_then(|first| first.split_once('='))
            .map_or(false, |(k, v)| k.trim() == "v" && v.trim() == "DMARC1")
    }

    pub fn parse(txt: &str) -> Result<Self> {
        if !Self::is_dmarc(txt) {
            return Err(AuthError::Parse(
                "DMARC record must start with v=DMARC1".to_string(),
            ));
        }

        let mut record = DmarcRecord::default();
        let mut policy = None;

        for tag in txt.split(';').skip(1) {
            let (key, value) = match tag.split_once('=') {
                Some((k, v)) => (k.trim().to_ascii_lowercase(), v.trim()),
                None => continue,
            };

            match key.as_str() {
                "p" => policy = Policy::parse(value),
                "sp" => record.subdomain_policy = Policy::parse(value),
                "adkim" => record.adkim = Alignment::parse(value).unwrap_or(Alignment::Relaxed),
                "aspf" => record.aspf = Alignment::parse(value).unwrap_or(Alignment::Relaxed),
                "pct" => {
                    if let Ok(pct) = value.parse::<u8>() {
                        if pct <= 100 {
                            record.pct = pct;
                        }
                    }
                }
                "rua" => record.rua = uri_list(value),
                "ruf" => record.ruf = uri_list(value),
                "fo" => record.fo = value.to_string(),
                "rf" => record.rf = value.to_string(),
                "ri" => {
                    if let Ok(ri) = value.parse::<u32>() {
                        if ri > 0 {
                            record.ri = ri;
                        }
                    }
                }
                _ => {}
            }
        }

        record.policy = match policy {
            Some(p) => p,
            // A record that only asks for reports is treated as monitoring
            None if !record.rua.is_empty() => Policy::None,
            None => {
                return Err(AuthError::Parse(
                    "DMARC record has no valid p= tag".to_string(),
                ))
            }
        };

        Ok(record)
    }

    /// Policy for mail from a strict subdomain of the policy domain
    pub fn subdomain_policy(&self) -> Policy {
        self.subdomain_policy.unwrap_or(self.policy)
    }

    /// Record text to publish at `_dmarc.<domain>`
    pub fn generate(
        policy: Policy,
        subdomain_policy: Option<Policy>,
        adkim: Alignment,
        aspf: Alignment,
        pct: u8,
        rua: &[&str],
    ) -> String {
        DmarcRecord {
            policy,
            subdomain_policy,
            adkim,
            aspf,
            pct: pct.min(100),
            rua: rua.iter().map(|u| u.to_string()).collect(),
            ..DmarcRecord::default()
        }
        .to_string()
    }
}

/// Canonical text; tags at their default value are left out
impl fmt::Display for DmarcRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=DMARC1; p={}", self.policy)?;
        if let Some(sp) = self.subdomain_policy {
            if sp != self.policy {
                write!(f, "; sp={}", sp)?;
            }
        }
        if self.adkim != Alignment::Relaxed {
            write!(f, "; adkim={}", self.adkim.as_char())?;
        }
        if self.aspf != Alignment::Relaxed {
            write!(f, "; aspf={}", self.aspf.as_char())?;
        }
        if self.pct != 100 {
            write!(f, "; pct={}", self.pct)?;
        }
        if !self.rua.is_empty() {
            write!(f, "; rua={}", self.rua.join(","))?;
        }
        if !self.ruf.is_empty() {
            write!(f, "; ruf={}", self.ruf.join(","))?;
        }
        if self.fo != "0" {
            write!(f, "; fo={}", self.fo)?;
        }
        if self.ri != 86400 {
            write!(f, "; ri={}", self.ri)?;
        }
        Ok(())
    }
}
