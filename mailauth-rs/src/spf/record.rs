//! SPF record parsing and generation

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::macros;
use super::{SpfError, SpfResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Qualifier::Pass),
            '-' => Some(Qualifier::Fail),
            '~' => Some(Qualifier::SoftFail),
            '?' => Some(Qualifier::Neutral),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Qualifier::Pass => '+',
            Qualifier::Fail => '-',
            Qualifier::SoftFail => '~',
            Qualifier::Neutral => '?',
        }
    }

    /// Result when a mechanism with this qualifier matches
    pub fn result(&self) -> SpfResult {
        match self {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }
}

/// Domain-specs are kept unexpanded; macros are resolved per evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    All,
    Include(String),
    A {
        domain: Option<String>,
        v4_prefix: u8,
        v6_prefix: u8,
    },
    Mx {
        domain: Option<String>,
        v4_prefix: u8,
        v6_prefix: u8,
    },
    Ptr(Option<String>),
    Ip4 { network: Ipv4Addr, prefix: u8 },
    Ip6 { network: Ipv6Addr, prefix: u8 },
    Exists(String),
}

impl Mechanism {
    /// Mechanisms that cost one DNS query against the lookup limit
    pub fn needs_lookup(&self) -> bool {
        !matches!(self, Mechanism::All | Mechanism::Ip4 { .. } | Mechanism::Ip6 { .. })
    }
}

/// True when `ip` lies inside `network/prefix` (same family only)
pub fn in_network(ip: IpAddr, network: IpAddr, prefix: u8) -> bool {
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix.min(32)))
            };
            u32::from(ip) & mask == u32::from(net) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix.min(128)))
            };
            u128::from(ip) & mask == u128::from(net) & mask
        }
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpfRecord {
    pub directives: Vec<Directive>,
    pub redirect: Option<String>,
    /// `exp=` domain-spec; explanation text is never fetched
    pub explanation: Option<String>,
}

fn domain_spec(value: &str) -> Result<String, SpfError> {
    if value.is_empty() {
        return Err(SpfError::Syntax);
    }
    macros::validate(value)?;
    Ok(value.to_string())
}

fn prefix(value: &str, max: u8) -> Result<u8, SpfError> {
    // Leading zeros are not allowed in CIDR lengths
    if value.is_empty() || (value.len() > 1 && value.starts_with('0')) {
        return Err(SpfError::Syntax);
    }
    match value.parse::<u8>() {
        Ok(n) if n <= max => Ok(n),
        _ => Err(SpfError::Syntax),
    }
}

/// Split `domain/v4//v6` on the first `/` outside a macro
fn split_cidr(arg: &str) -> (&str, Option<&str>) {
    let mut depth = 0;
    for (i, c) in arg.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            '/' if depth == 0 => return (&arg[..i], Some(&arg[i..])),
            _ => {}
        }
    }
    (arg, None)
}

fn dual_cidr(cidr: Option<&str>) -> Result<(u8, u8), SpfError> {
    let cidr = match cidr {
        None => return Ok((32, 128)),
        Some(c) => c,
    };
    if let Some(v6) = cidr.strip_prefix("//") {
        return Ok((32, prefix(v6, 128)?));
    }
    let body = cidr.strip_prefix('/').ok_or(SpfError::Syntax)?;
    match body.split_once("//") {
        Some((v4, v6)) => Ok((prefix(v4, 32)?, prefix(v6, 128)?)),
        None => Ok((prefix(body, 32)?, 128)),
    }
}

/// `a` and `mx` share the `[:domain][/v4][//v6]` shape
fn host_args(rest: &str) -> Result<(Option<String>, u8, u8), SpfError> {
    let (domain, cidr) = match rest.strip_prefix(':') {
        Some(arg) => {
            let (domain, cidr) = split_cidr(arg);
            (Some(domain_spec(domain)?), cidr)
        }
        None if rest.is_empty() => (None, None),
        None if rest.starts_with('/') => (None, Some(rest)),
        None => return Err(SpfError::Syntax),
    };
    let (v4, v6) = dual_cidr(cidr)?;
    Ok((domain, v4, v6))
}

fn parse_mechanism(term: &str) -> Result<Mechanism, SpfError> {
    let name_end = term.find(|c| c == ':' || c == '/').unwrap_or(term.len());
    let name = term[..name_end].to_ascii_lowercase();
    let rest = &term[name_end..];

    let required_arg = || rest.strip_prefix(':').ok_or(SpfError::Syntax);

    match name.as_str() {
        "all" if rest.is_empty() => Ok(Mechanism::All),
        "include" => Ok(Mechanism::Include(domain_spec(required_arg()?)?)),
        "exists" => Ok(Mechanism::Exists(domain_spec(required_arg()?)?)),
        "a" => {
            let (domain, v4_prefix, v6_prefix) = host_args(rest)?;
            Ok(Mechanism::A {
                domain,
                v4_prefix,
                v6_prefix,
            })
        }
        "mx" => {
            let (domain, v4_prefix, v6_prefix) = host_args(rest)?;
            Ok(Mechanism::Mx {
                domain,
                v4_prefix,
                v6_prefix,
            })
        }
        "ptr" => match rest.strip_prefix(':') {
            Some(arg) => Ok(Mechanism::Ptr(Some(domain_spec(arg)?))),
            None if rest.is_empty() => Ok(Mechanism::Ptr(None)),
            None => Err(SpfError::Syntax),
        },
        "ip4" => {
            let arg = required_arg()?;
            let (addr, len) = match arg.split_once('/') {
                Some((addr, len)) => (addr, prefix(len, 32)?),
                None => (arg, 32),
            };
            let network = addr.parse::<Ipv4Addr>().map_err(|_| SpfError::Syntax)?;
            Ok(Mechanism::Ip4 {
                network,
                prefix: len,
            })
        }
        "ip6" => {
            let arg = required_arg()?;
            let (addr, len) = match arg.split_once('/') {
                Some((addr, len)) => (addr, prefix(len, 128)?),
                None => (arg, 128),
            };
            let network = addr.parse::<Ipv6Addr>().map_err(|_| SpfError::Syntax)?;
            Ok(Mechanism::Ip6 {
                network,
                prefix: len,
            })
        }
        _ => Err(SpfError::Syntax),
    }
}

/// Modifier names are alphanumeric and followed directly by `=`
fn as_modifier(term: &str) -> Option<(&str, &str)> {
    let (name, value) = term.split_once('=')?;
    let first = name.chars().next()?;
    if first.is_ascii_alphabetic()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        Some((name, value))
    } else {
        None
    }
}

impl SpfRecord {
    /// Whether a TXT string is an SPF version 1 record
    pub fn is_spf(txt: &str) -> bool {
        let txt = txt.trim_start();
        match txt.get(..6) {
            Some(version) if version.eq_ignore_ascii_case("v=spf1") => {
                txt.len() == 6 || txt[6..].starts_with(' ')
            }
            _ => false,
        }
    }

    pub fn parse(txt: &str) -> Result<Self, SpfError> {
        if !Self::is_spf(txt) {
            return Err(SpfError::Syntax);
        }

        let mut record = SpfRecord::default();
        for term in txt.trim_start()[6..].split_whitespace() {
            if let Some((name, value)) = as_modifier(term) {
                match name.to_ascii_lowercase().as_str() {
                    "redirect" => {
                        if record.redirect.is_some() {
                            return Err(SpfError::Syntax);
                        }
                        record.redirect = Some(domain_spec(value)?);
                    }
                    "exp" => {
                        if record.explanation.is_some() {
                            return Err(SpfError::Syntax);
                        }
                        record.explanation = Some(domain_spec(value)?);
                    }
                    // Unknown modifiers are ignored
                    _ => {}
                }
                continue;
            }

            let mut chars = term.chars();
            let (qualifier, body) = match chars.next().and_then(Qualifier::from_char) {
                Some(q) => (q, chars.as_str()),
                None => (Qualifier::Pass, term),
            };
            record.directives.push(Directive {
                qualifier,
                mechanism: parse_mechanism(body)?,
            });
        }

        Ok(record)
    }

    /// Build record text for a sending domain
    ///
    /// `policy` is the qualifier on the final `all`.
    pub fn generate(includes: &[&str], ip4s: &[&str], ip6s: &[&str], mx: bool, policy: Qualifier) -> String {
        let mut terms = vec!["v=spf1".to_string()];
        if mx {
            terms.push("mx".to_string());
        }
        terms.extend(ip4s.iter().map(|ip| format!("ip4:{}", ip)));
        terms.extend(ip6s.iter().map(|ip| format!("ip6:{}", ip)));
        terms.extend(includes.iter().map(|d| format!("include:{}", d)));
        terms.push(format!("{}all", policy.as_char()));
        terms.join(" ")
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn cidr(f: &mut fmt::Formatter<'_>, v4: u8, v6: u8) -> fmt::Result {
            if v4 != 32 {
                write!(f, "/{}", v4)?;
            }
            if v6 != 128 {
                write!(f, "//{}", v6)?;
            }
            Ok(())
        }

        match self {
            Mechanism::All => write!(f, "all"),
            Mechanism::Include(d) => write!(f, "include:{}", d),
            Mechanism::Exists(d) => write!(f, "exists:{}", d),
            Mechanism::A {
                domain,
                v4_prefix,
                v6_prefix,
            }
            | Mechanism::Mx {
                domain,
                v4_prefix,
                v6_prefix,
            } => {
                f.write_str(if matches!(self, Mechanism::A { .. }) { "a" } else { "mx" })?;
                if let Some(d) = domain {
                    write!(f, ":{}", d)?;
                }
                cidr(f, *v4_prefix, *v6_prefix)
            }
            Mechanism::Ptr(None) => write!(f, "ptr"),
            Mechanism::Ptr(Some(d)) => write!(f, "ptr:{}", d),
            Mechanism::Ip4 { network, prefix } if *prefix == 32 => write!(f, "ip4:{}", network),
            Mechanism::Ip4 { network, prefix } => write!(f, "ip4:{}/{}", network, prefix),
            Mechanism::Ip6 { network, prefix } if *prefix == 128 => write!(f, "ip6:{}", network),
            Mechanism::Ip6 { network, prefix } => write!(f, "ip6:{}/{}", network, prefix),
        }
    }
}

impl fmt::Display for SpfRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=spf1")?;
        for d in &self.directives {
            match d.qualifier {
                Qualifier::Pass => write!(f, " {}", d.mechanism)?,
                q => write!(f, " {}{}", q.as_char(), d.mechanism)?,
            }
        }
        if let Some(r) = &self.redirect {
            write!(f, " redirect={}", r)?;
        }
        if let Some(e) = &self.explanation {
            write!(f, " exp={}", e)?;
        }
        Ok(())
    }
}
