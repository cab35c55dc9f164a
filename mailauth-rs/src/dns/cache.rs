use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use super::resolver::DnsResolver;
use super::{normalize_name, Answer, DnsError, MxHost};
use crate::config::DnsConfig;

type Lookup<T> = Result<Answer<T>, DnsError>;
type InFlight<T> = Shared<BoxFuture<'static, Lookup<T>>>;

#[derive(Debug, Clone, Copy)]
struct CacheSettings {
    min_ttl: Duration,
    max_ttl: Duration,
    negative_ttl: Duration,
    timeout: Duration,
}

impl CacheSettings {
    /// How long an outcome may be served from cache; `None` means never cache it
    fn lifetime<T>(&self, outcome: &Lookup<T>) -> Option<Duration> {
        match outcome {
            Ok(answer) => Some(answer.ttl.clamp(self.min_ttl, self.max_ttl)),
            Err(e) if e.is_void() => Some(self.negative_ttl),
            Err(_) => None,
        }
    }
}

struct Entry<T> {
    outcome: Lookup<T>,
    expires_at: Instant,
}

/// A query shared by every caller waiting on the same name
struct Pending<T> {
    id: u64,
    query: InFlight<T>,
    waiters: usize,
}

/// Cache for one record type
struct Lane<T> {
    entries: RwLock<HashMap<String, Entry<T>>>,
    /// Never held across an await
    inflight: Mutex<HashMap<String, Pending<T>>>,
    next_id: AtomicU64,
}

impl<T> Lane<T> {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, Pending<T>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the in-flight entry for `key` if it is still query `id`
    fn finish(&self, key: &str, id: u64) {
        let mut inflight = self.pending();
        if inflight.get(key).map_or(false, |p| p.id == id) {
            inflight.remove(key);
        }
    }
}

/// One caller's claim on an in-flight query
///
/// When the last waiter goes away before the query completes, the entry
/// is removed and the query is dropped with it.
struct Waiter<T> {
    lane: Arc<Lane<T>>,
    key: String,
    id: u64,
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        let mut inflight = self.lane.pending();
        let abandoned = match inflight.get_mut(&self.key) {
            Some(pending) if pending.id == self.id => {
                pending.waiters -= 1;
                pending.waiters == 0
            }
            _ => false,
        };
        if abandoned {
            debug!("Abandoned DNS query: {}", self.key);
            inflight.remove(&self.key);
        }
    }
}

impl<T> Lane<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    async fn cached(&self, key: &str) -> Option<Lookup<T>> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        let now = Instant::now();
        if entry.expires_at <= now {
            return None;
        }
        Some(match &entry.outcome {
            Ok(answer) => Ok(Answer::new(
                answer.records.clone(),
                entry.expires_at.duration_since(now),
            )),
            Err(e) => Err(e.clone()),
        })
    }

    async fn resolve<F>(self: &Arc<Self>, key: String, settings: CacheSettings, query: F) -> Lookup<T>
    where
        F: FnOnce() -> BoxFuture<'static, Lookup<T>>,
    {
        if let Some(hit) = self.cached(&key).await {
            debug!("DNS cache hit: {}", key);
            return hit;
        }

        let (shared, _waiter) = {
            let mut inflight = self.pending();
            let (id, shared) = match inflight.get_mut(&key) {
                Some(pending) => {
                    debug!("Joining in-flight DNS query: {}", key);
                    pending.waiters += 1;
                    (pending.id, pending.query.clone())
                }
                None => {
                    debug!("DNS cache miss: {}", key);
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let lane = Arc::clone(self);
                    let name = key.clone();
                    let query = query();
                    let shared = async move {
                        let outcome = match tokio::time::timeout(settings.timeout, query).await {
                            Ok(outcome) => outcome,
                            Err(_) => Err(DnsError::Timeout(name.clone())),
                        };

                        if let Some(lifetime) = settings.lifetime(&outcome) {
                            let outcome = match &outcome {
                                Ok(answer) => Ok(Answer::new(answer.records.clone(), lifetime)),
                                Err(e) => Err(e.clone()),
                            };
                            lane.entries.write().await.insert(
                                name.clone(),
                                Entry {
                                    outcome,
                                    expires_at: Instant::now() + lifetime,
                                },
                            );
                        }
                        lane.finish(&name, id);

                        match outcome {
                            Ok(answer) => {
                                let ttl = answer.ttl.clamp(settings.min_ttl, settings.max_ttl);
                                Ok(Answer::new(answer.records, ttl))
                            }
                            Err(e) => Err(e),
                        }
                    }
                    .boxed()
                    .shared();
                    inflight.insert(
                        key.clone(),
                        Pending {
                            id,
                            query: shared.clone(),
                            waiters: 1,
                        },
                    );
                    (id, shared)
                }
            };
            let waiter = Waiter {
                lane: Arc::clone(self),
                key,
                id,
            };
            (shared, waiter)
        };

        shared.await
    }

    async fn invalidate(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

/// TTL-respecting cache in front of any [`DnsResolver`]
///
/// Positive answers live for their TTL clamped to `[min_ttl, max_ttl]`.
/// NXDOMAIN and NODATA live for `negative_ttl`. Timeouts and server
/// failures are never stored. Concurrent lookups of the same record share
/// one query, and the cache is written only when that query completes. A
/// query whose callers have all gone away is cancelled.
#[derive(Clone)]
pub struct DnsCache {
    inner: Arc<dyn DnsResolver>,
    settings: CacheSettings,
    txt: Arc<Lane<String>>,
    ip: Arc<Lane<IpAddr>>,
    mx: Arc<Lane<MxHost>>,
    ptr: Arc<Lane<String>>,
}

impl DnsCache {
    pub fn new(inner: Arc<dyn DnsResolver>, config: &DnsConfig) -> Self {
        Self {
            inner,
            settings: CacheSettings {
                min_ttl: Duration::from_secs(config.min_ttl_secs),
                max_ttl: Duration::from_secs(config.max_ttl_secs.max(config.min_ttl_secs)),
                negative_ttl: Duration::from_secs(config.negative_ttl_secs),
                timeout: config.timeout(),
            },
            txt: Arc::new(Lane::new()),
            ip: Arc::new(Lane::new()),
            mx: Arc::new(Lane::new()),
            ptr: Arc::new(Lane::new()),
        }
    }

    /// Forget every cached record for `name`
    pub async fn invalidate(&self, name: &str) {
        let key = normalize_name(name);
        self.txt.invalidate(&key).await;
        self.ip.invalidate(&key).await;
        self.mx.invalidate(&key).await;
        self.ptr.invalidate(&key).await;
    }

    pub async fn clear(&self) {
        self.txt.clear().await;
        self.ip.clear().await;
        self.mx.clear().await;
        self.ptr.clear().await;
    }
}

#[async_trait]
impl DnsResolver for DnsCache {
    async fn txt_lookup(&self, name: &str) -> Result<Answer<String>, DnsError> {
        let key = normalize_name(name);
        let inner = Arc::clone(&self.inner);
        let query_name = key.clone();
        self.txt
            .resolve(key, self.settings, move || {
                async move { inner.txt_lookup(&query_name).await }.boxed()
            })
            .await
    }

    async fn ip_lookup(&self, name: &str) -> Result<Answer<IpAddr>, DnsError> {
        let key = normalize_name(name);
        let inner = Arc::clone(&self.inner);
        let query_name = key.clone();
        self.ip
            .resolve(key, self.settings, move || {
                async move { inner.ip_lookup(&query_name).await }.boxed()
            })
            .await
    }

    async fn mx_lookup(&self, name: &str) -> Result<Answer<MxHost>, DnsError> {
        let key = normalize_name(name);
        let inner = Arc::clone(&self.inner);
        let query_name = key.clone();
        self.mx
            .resolve(key, self.settings, move || {
                async move { inner.mx_lookup(&query_name).await }.boxed()
            })
            .await
    }

    async fn ptr_lookup(&self, ip: IpAddr) -> Result<Answer<String>, DnsError> {
        let inner = Arc::clone(&self.inner);
        self.ptr
            .resolve(ip.to_string(), self.settings, move || {
                async move { inner.ptr_lookup(ip).await }.boxed()
            })
            .await
    }
}
