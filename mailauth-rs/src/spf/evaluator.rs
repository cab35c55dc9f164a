//! `check_host()` evaluation (RFC 7208 section 4)

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::macros::{self, MacroContext};
use super::record::{in_network, Mechanism, SpfRecord};
use super::{SpfError, SpfResult};
use crate::config::SpfConfig;
use crate::dns::{DnsError, DnsResolver};

/// MX and PTR answers beyond this many names are not examined
const MAX_NAME_LOOKUPS: usize = 10;

/// Which identity was checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfScope {
    MailFrom,
    Helo,
}

impl SpfScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpfScope::MailFrom => "mailfrom",
            SpfScope::Helo => "helo",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpfOutcome {
    pub result: SpfResult,
    /// Domain the policy was looked up for
    pub domain: String,
    pub scope: SpfScope,
}

/// Limits shared by every nested `include` and `redirect` of one check
struct EvalBudget {
    lookups: u32,
    max_lookups: u32,
    void_lookups: u32,
    max_void_lookups: u32,
    /// Domains on the current include/redirect chain
    chain: HashSet<String>,
}

impl EvalBudget {
    fn new(config: &SpfConfig) -> Self {
        Self {
            lookups: 0,
            max_lookups: config.max_lookups,
            void_lookups: 0,
            max_void_lookups: config.max_void_lookups,
            chain: HashSet::new(),
        }
    }

    fn charge(&mut self) -> Result<(), SpfResult> {
        self.lookups += 1;
        if self.lookups > self.max_lookups {
            return Err(SpfResult::PermFail(SpfError::TooManyLookups));
        }
        Ok(())
    }

    fn void(&mut self) -> Result<(), SpfResult> {
        self.void_lookups += 1;
        if self.void_lookups > self.max_void_lookups {
            return Err(SpfResult::PermFail(SpfError::TooManyVoidLookups));
        }
        Ok(())
    }
}

/// Per-check identity, fixed for the whole evaluation
struct Request {
    ip: IpAddr,
    sender: String,
    helo: String,
}

impl Request {
    fn macros<'a>(&'a self, domain: &'a str) -> MacroContext<'a> {
        MacroContext {
            sender: &self.sender,
            domain,
            ip: self.ip,
            helo: &self.helo,
        }
    }
}

fn temp_fail(err: &DnsError) -> SpfResult {
    SpfResult::TempFail(format!("dns: {}", err))
}

/// Evaluates SPF policies through a [`DnsResolver`]
pub struct SpfEvaluator {
    resolver: Arc<dyn DnsResolver>,
    config: SpfConfig,
}

impl SpfEvaluator {
    pub fn new(resolver: Arc<dyn DnsResolver>, config: SpfConfig) -> Self {
        Self { resolver, config }
    }

    /// Check `client_ip` against the MAIL FROM identity
    ///
    /// A null reverse-path (empty or `<>`) checks `postmaster@<helo>`
    /// instead.
    pub async fn evaluate(&self, client_ip: IpAddr, helo: &str, mail_from: &str) -> SpfOutcome {
        let ip = match client_ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(client_ip),
            v4 => v4,
        };
        let helo = helo.trim().trim_end_matches('.').to_ascii_lowercase();
        let mail_from = mail_from.trim().trim_start_matches('<').trim_end_matches('>').trim();

        let (sender, domain, scope) = if mail_from.is_empty() {
            (format!("postmaster@{}", helo), helo.clone(), SpfScope::Helo)
        } else {
            match mail_from.rsplit_once('@') {
                Some((local, domain)) => {
                    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                    let local = if local.is_empty() { "postmaster" } else { local };
                    (format!("{}@{}", local, domain), domain, SpfScope::MailFrom)
                }
                None => {
                    let domain = mail_from.trim_end_matches('.').to_ascii_lowercase();
                    (format!("postmaster@{}", domain), domain, SpfScope::MailFrom)
                }
            }
        };

        debug!(ip = %ip, domain = %domain, scope = scope.as_str(), "SPF check");

        let result = if !is_checkable(&domain) {
            SpfResult::None
        } else {
            let request = Request { ip, sender, helo };
            let mut budget = EvalBudget::new(&self.config);
            self.check_host(&request, domain.clone(), &mut budget).await
        };

        match &result {
            SpfResult::Pass => info!(ip = %ip, domain = %domain, "SPF pass"),
            SpfResult::TempFail(_) | SpfResult::PermFail(_) => {
                warn!(ip = %ip, domain = %domain, result = ?result, "SPF error")
            }
            other => info!(ip = %ip, domain = %domain, "SPF {}", other),
        }

        SpfOutcome {
            result,
            domain,
            scope,
        }
    }

    /// Fetch and parse the single SPF record of `domain`
    ///
    /// `Ok(None)` means the domain publishes no SPF record.
    async fn fetch_record(&self, domain: &str) -> Result<Option<SpfRecord>, SpfResult> {
        let answer = match self.resolver.txt_lookup(domain).await {
            Ok(answer) => answer,
            Err(e) if e.is_temporary() => return Err(temp_fail(&e)),
            Err(_) => return Ok(None),
        };

        let mut candidates = answer.records.iter().filter(|txt| SpfRecord::is_spf(txt));
        let txt = match (candidates.next(), candidates.next()) {
            (None, _) => return Ok(None),
            (Some(txt), None) => txt,
            (Some(_), Some(_)) => return Err(SpfResult::PermFail(SpfError::MultipleRecords)),
        };

        debug!(domain = %domain, record = %txt, "SPF record");
        SpfRecord::parse(txt)
            .map(Some)
            .map_err(SpfResult::PermFail)
    }

    fn check_host<'a>(
        &'a self,
        request: &'a Request,
        domain: String,
        budget: &'a mut EvalBudget,
    ) -> BoxFuture<'a, SpfResult> {
        async move {
            if !budget.chain.insert(domain.clone()) {
                warn!(domain = %domain, "SPF include loop");
                return SpfResult::PermFail(SpfError::Loop);
            }
            let result = self.check_record(request, &domain, budget).await;
            budget.chain.remove(&domain);
            result
        }
        .boxed()
    }

    async fn check_record(&self, request: &Request, domain: &str, budget: &mut EvalBudget) -> SpfResult {
        let record = match self.fetch_record(domain).await {
            Ok(Some(record)) => record,
            Ok(None) => return SpfResult::None,
            Err(result) => return result,
        };

        for directive in &record.directives {
            match self.matches(request, domain, &directive.mechanism, budget).await {
                Ok(true) => {
                    debug!(domain = %domain, mechanism = %directive.mechanism, "SPF mechanism matched");
                    return directive.qualifier.result();
                }
                Ok(false) => {}
                Err(result) => return result,
            }
        }

        if let Some(redirect) = &record.redirect {
            if let Err(result) = budget.charge() {
                return result;
            }
            let target = match macros::expand(redirect, &request.macros(domain)) {
                Ok(target) => target,
                Err(e) => return SpfResult::PermFail(e),
            };
            return match self.check_host(request, target, budget).await {
                SpfResult::None => SpfResult::PermFail(SpfError::MissingRecord),
                other => other,
            };
        }

        SpfResult::Neutral
    }

    /// Whether one mechanism matches; `Err` carries a result that ends the check
    async fn matches(
        &self,
        request: &Request,
        domain: &str,
        mechanism: &Mechanism,
        budget: &mut EvalBudget,
    ) -> Result<bool, SpfResult> {
        if mechanism.needs_lookup() {
            budget.charge()?;
        }

        let target = |spec: &Option<String>| -> Result<String, SpfResult> {
            match spec {
                Some(spec) => macros::expand(spec, &request.macros(domain)).map_err(SpfResult::PermFail),
                None => Ok(domain.to_string()),
            }
        };

        match mechanism {
            Mechanism::All => Ok(true),
            Mechanism::Ip4 { network, prefix } => Ok(in_network(request.ip, IpAddr::V4(*network), *prefix)),
            Mechanism::Ip6 { network, prefix } => Ok(in_network(request.ip, IpAddr::V6(*network), *prefix)),
            Mechanism::A {
                domain: spec,
                v4_prefix,
                v6_prefix,
            } => {
                let host = target(spec)?;
                self.host_matches(request.ip, &host, *v4_prefix, *v6_prefix, budget)
                    .await
            }
            Mechanism::Mx {
                domain: spec,
                v4_prefix,
                v6_prefix,
            } => {
                let name = target(spec)?;
                let hosts = match self.resolver.mx_lookup(&name).await {
                    Ok(answer) => answer.records,
                    Err(e) if e.is_temporary() => return Err(temp_fail(&e)),
                    Err(_) => {
                        budget.void()?;
                        return Ok(false);
                    }
                };
                if hosts.len() > MAX_NAME_LOOKUPS {
                    return Err(SpfResult::PermFail(SpfError::TooManyLookups));
                }
                for mx in &hosts {
                    if self
                        .host_matches(request.ip, &mx.exchange, *v4_prefix, *v6_prefix, budget)
                        .await?
                    {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Mechanism::Ptr(spec) => {
                let wanted = target(spec)?;
                self.ptr_matches(request.ip, &wanted, budget).await
            }
            Mechanism::Include(spec) => {
                let name = target(&Some(spec.clone()))?;
                match self.check_host(request, name, budget).await {
                    SpfResult::Pass => Ok(true),
                    SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => Ok(false),
                    SpfResult::None => Err(SpfResult::PermFail(SpfError::MissingRecord)),
                    err @ (SpfResult::TempFail(_) | SpfResult::PermFail(_)) => Err(err),
                }
            }
            Mechanism::Exists(spec) => {
                let name = target(&Some(spec.clone()))?;
                match self.resolver.ip_lookup(&name).await {
                    Ok(answer) => Ok(answer.records.iter().any(|ip| ip.is_ipv4())),
                    Err(e) if e.is_temporary() => Err(temp_fail(&e)),
                    Err(_) => {
                        budget.void()?;
                        Ok(false)
                    }
                }
            }
        }
    }

    async fn host_matches(
        &self,
        ip: IpAddr,
        host: &str,
        v4_prefix: u8,
        v6_prefix: u8,
        budget: &mut EvalBudget,
    ) -> Result<bool, SpfResult> {
        let addrs = match self.resolver.ip_lookup(host).await {
            Ok(answer) => answer.records,
            Err(e) if e.is_temporary() => return Err(temp_fail(&e)),
            Err(_) => {
                budget.void()?;
                return Ok(false);
            }
        };

        Ok(addrs.iter().any(|addr| {
            let prefix = if addr.is_ipv4() { v4_prefix } else { v6_prefix };
            in_network(ip, *addr, prefix)
        }))
    }

    /// Validated reverse names of `ip` that equal or sit under `wanted`
    async fn ptr_matches(&self, ip: IpAddr, wanted: &str, budget: &mut EvalBudget) -> Result<bool, SpfResult> {
        let names = match self.resolver.ptr_lookup(ip).await {
            Ok(answer) => answer.records,
            Err(e) if e.is_void() => {
                budget.void()?;
                return Ok(false);
            }
            // A failed reverse lookup is a non-match, not an error
            Err(_) => return Ok(false),
        };

        let wanted = wanted.to_ascii_lowercase();
        for name in names.iter().take(MAX_NAME_LOOKUPS) {
            let name = name.to_ascii_lowercase();
            if name != wanted && !name.ends_with(&format!(".{}", wanted)) {
                continue;
            }
            if let Ok(answer) = self.resolver.ip_lookup(&name).await {
                if answer.records.contains(&ip) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// Names SPF can be checked for: dotted, with sane label lengths
fn is_checkable(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && domain.contains('.')
        && domain
            .split('.')
            .all(|label| !label.is_empty() && label.len() <= 63)
}
