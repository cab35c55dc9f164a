use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::proto::op::ResponseCode;
use trust_dns_resolver::TokioAsyncResolver;

use super::{normalize_name, Answer, DnsError, MxHost};

/// Record lookups needed by the authentication evaluators
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// TXT records, each with its character-strings concatenated
    async fn txt_lookup(&self, name: &str) -> Result<Answer<String>, DnsError>;

    /// A and AAAA records
    async fn ip_lookup(&self, name: &str) -> Result<Answer<IpAddr>, DnsError>;

    async fn mx_lookup(&self, name: &str) -> Result<Answer<MxHost>, DnsError>;

    /// PTR names for an address, without the trailing dot
    async fn ptr_lookup(&self, ip: IpAddr) -> Result<Answer<String>, DnsError>;
}

/// Resolver backed by `trust-dns-resolver`
pub struct TrustDnsResolver {
    resolver: TokioAsyncResolver,
}

impl TrustDnsResolver {
    pub fn new(config: ResolverConfig, opts: ResolverOpts) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }

    /// Use /etc/resolv.conf, falling back to the library defaults
    pub fn from_system_conf() -> Self {
        match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => Self { resolver },
            Err(e) => {
                warn!("Failed to read system resolver config, using defaults: {}", e);
                Self::new(ResolverConfig::default(), ResolverOpts::default())
            }
        }
    }
}

impl Default for TrustDnsResolver {
    fn default() -> Self {
        Self::from_system_conf()
    }
}

/// Absolute form so search domains are never appended
fn fqdn(name: &str) -> String {
    format!("{}.", normalize_name(name))
}

fn remaining(valid_until: Instant) -> Duration {
    valid_until.saturating_duration_since(Instant::now())
}

fn classify(name: &str, err: ResolveError) -> DnsError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => {
            if *response_code == ResponseCode::NXDomain {
                DnsError::NotFound(name.to_string())
            } else {
                DnsError::NoRecords(name.to_string())
            }
        }
        ResolveErrorKind::Timeout => DnsError::Timeout(name.to_string()),
        _ => DnsError::ServFail(format!("{}: {}", name, err)),
    }
}

#[async_trait]
impl DnsResolver for TrustDnsResolver {
    async fn txt_lookup(&self, name: &str) -> Result<Answer<String>, DnsError> {
        debug!("TXT lookup: {}", name);
        let lookup = self
            .resolver
            .txt_lookup(fqdn(name))
            .await
            .map_err(|e| classify(name, e))?;

        let records = lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                    .collect::<String>()
            })
            .collect();

        Ok(Answer::new(records, remaining(lookup.valid_until())))
    }

    async fn ip_lookup(&self, name: &str) -> Result<Answer<IpAddr>, DnsError> {
        debug!("A/AAAA lookup: {}", name);
        let lookup = self
            .resolver
            .lookup_ip(fqdn(name))
            .await
            .map_err(|e| classify(name, e))?;

        let records: Vec<IpAddr> = lookup.iter().collect();
        Ok(Answer::new(records, remaining(lookup.valid_until())))
    }

    async fn mx_lookup(&self, name: &str) -> Result<Answer<MxHost>, DnsError> {
        debug!("MX lookup: {}", name);
        let lookup = self
            .resolver
            .mx_lookup(fqdn(name))
            .await
            .map_err(|e| classify(name, e))?;

        let mut records: Vec<MxHost> = lookup
            .iter()
            .map(|mx| MxHost {
                preference: mx.preference(),
                exchange: mx.exchange().to_string().trim_end_matches('.').to_string(),
            })
            .collect();
        records.sort_by_key(|mx| mx.preference);

        Ok(Answer::new(records, remaining(lookup.valid_until())))
    }

    async fn ptr_lookup(&self, ip: IpAddr) -> Result<Answer<String>, DnsError> {
        debug!("PTR lookup: {}", ip);
        let lookup = self
            .resolver
            .reverse_lookup(ip)
            .await
            .map_err(|e| classify(&ip.to_string(), e))?;

        let records = lookup
            .iter()
            .map(|ptr| ptr.to_string().trim_end_matches('.').to_string())
            .collect();

        Ok(Answer::new(records, remaining(lookup.valid_until())))
    }
}

#[derive(Debug, Clone, Default)]
struct Node {
    txt: Vec<String>,
    ips: Vec<IpAddr>,
    mx: Vec<MxHost>,
    ptr: Vec<String>,
}

#[derive(Debug, Default)]
struct Zone {
    nodes: HashMap<String, Node>,
    failures: HashMap<String, DnsError>,
    delay: Option<Duration>,
}

/// Static in-memory zone
///
/// Used for embedding and for deterministic tests. Failures can be
/// injected per name, and every query is counted.
pub struct MemoryResolver {
    zone: RwLock<Zone>,
    ttl: Duration,
    queries: AtomicUsize,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self {
            zone: RwLock::new(Zone::default()),
            ttl: Duration::from_secs(300),
            queries: AtomicUsize::new(0),
        }
    }

    /// TTL reported with every answer
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_txt(mut self, name: &str, record: &str) -> Self {
        self.zone
            .get_mut()
            .nodes
            .entry(normalize_name(name))
            .or_default()
            .txt
            .push(record.to_string());
        self
    }

    pub fn with_ip(mut self, name: &str, ip: IpAddr) -> Self {
        self.zone
            .get_mut()
            .nodes
            .entry(normalize_name(name))
            .or_default()
            .ips
            .push(ip);
        self
    }

    pub fn with_mx(mut self, name: &str, preference: u16, exchange: &str) -> Self {
        self.zone
            .get_mut()
            .nodes
            .entry(normalize_name(name))
            .or_default()
            .mx
            .push(MxHost {
                preference,
                exchange: normalize_name(exchange),
            });
        self
    }

    pub fn with_ptr(mut self, ip: IpAddr, name: &str) -> Self {
        self.zone
            .get_mut()
            .nodes
            .entry(ip.to_string())
            .or_default()
            .ptr
            .push(normalize_name(name));
        self
    }

    pub async fn add_txt(&self, name: &str, record: &str) {
        let mut zone = self.zone.write().await;
        zone.nodes
            .entry(normalize_name(name))
            .or_default()
            .txt
            .push(record.to_string());
    }

    /// Drop every record held for `name`
    pub async fn remove(&self, name: &str) {
        let mut zone = self.zone.write().await;
        zone.nodes.remove(&normalize_name(name));
    }

    /// Make every lookup of `name` fail with `error`
    pub async fn fail(&self, name: &str, error: DnsError) {
        let mut zone = self.zone.write().await;
        zone.failures.insert(normalize_name(name), error);
    }

    /// Delay every answer, for exercising timeouts and in-flight sharing
    pub async fn set_delay(&self, delay: Duration) {
        self.zone.write().await.delay = Some(delay);
    }

    /// Number of lookups answered so far
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    async fn lookup<T, F>(&self, key: String, select: F) -> Result<Answer<T>, DnsError>
    where
        F: FnOnce(&Node) -> Vec<T>,
    {
        self.queries.fetch_add(1, Ordering::SeqCst);

        let delay = self.zone.read().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let zone = self.zone.read().await;
        if let Some(err) = zone.failures.get(&key) {
            return Err(err.clone());
        }

        match zone.nodes.get(&key) {
            None => Err(DnsError::NotFound(key)),
            Some(node) => {
                let records = select(node);
                if records.is_empty() {
                    Err(DnsError::NoRecords(key))
                } else {
                    Ok(Answer::new(records, self.ttl))
                }
            }
        }
    }
}

impl Default for MemoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsResolver for MemoryResolver {
    async fn txt_lookup(&self, name: &str) -> Result<Answer<String>, DnsError> {
        self.lookup(normalize_name(name), |node| node.txt.clone())
            .await
    }

    async fn ip_lookup(&self, name: &str) -> Result<Answer<IpAddr>, DnsError> {
        self.lookup(normalize_name(name), |node| node.ips.clone())
            .await
    }

    async fn mx_lookup(&self, name: &str) -> Result<Answer<MxHost>, DnsError> {
        self.lookup(normalize_name(name), |node| {
            let mut mx = node.mx.clone();
            mx.sort_by_key(|m| m.preference);
            mx
        })
        .await
    }

    async fn ptr_lookup(&self, ip: IpAddr) -> Result<Answer<String>, DnsError> {
        self.lookup(ip.to_string(), |node| node.ptr.clone()).await
    }
}
