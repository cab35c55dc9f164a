//! Key lifecycle: generation, publication, activation and rotation
//!
//! Reads go straight to the store. Writes for one (domain, selector) are
//! serialized through a per-selector async mutex, so a rotation never
//! interleaves with another write for the same selector and never blocks
//! other domains.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::store::KeyStore;
use super::{KeyStatus, SigningKey};
use crate::config::DkimConfig;
use crate::crypto::CryptoPool;
use crate::dkim::Algorithm;
use crate::error::{AuthError, Result};

/// Outcome of [`KeyManager::rotate`]
#[derive(Debug, Clone, Serialize)]
pub struct RotatedKey {
    pub key: SigningKey,
    /// TXT record text for the new key
    pub dns_record: String,
    /// Ids of keys moved from active to deprecated
    pub demoted: Vec<String>,
}

type SelectorLock = Arc<Mutex<()>>;

/// Active keys this close to expiry are due for rotation
const EXPIRY_NOTICE_DAYS: i64 = 7;

pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    pool: CryptoPool,
    config: DkimConfig,
    locks: Mutex<HashMap<(String, String), SelectorLock>>,
}

fn normalize(domain: &str, selector: &str) -> (String, String) {
    (
        domain.trim().trim_end_matches('.').to_ascii_lowercase(),
        selector.trim().to_ascii_lowercase(),
    )
}

fn invalid(key: &SigningKey, to: KeyStatus) -> AuthError {
    AuthError::InvalidTransition {
        key: key.id.clone(),
        from: key.status.to_string(),
        to: to.to_string(),
    }
}

impl KeyManager {
    pub fn new(store: Arc<dyn KeyStore>, pool: CryptoPool, config: DkimConfig) -> Self {
        Self {
            store,
            pool,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn KeyStore> {
        Arc::clone(&self.store)
    }

    async fn selector_lock(&self, domain: &str, selector: &str) -> SelectorLock {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry((domain.to_string(), selector.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn default_algorithm(&self) -> Algorithm {
        Algorithm::parse(&self.config.default_algorithm).unwrap_or(Algorithm::RsaSha256)
    }

    fn stamp_expiry(&self, key: &mut SigningKey) {
        key.expires_at = self
            .config
            .key_lifetime_days
            .map(|days| key.created_at + Duration::days(days as i64));
    }

    async fn load(&self, id: &str) -> Result<SigningKey> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AuthError::KeyNotFound(id.to_string()))
    }

    /// Create key material in status `generated`
    pub async fn generate(&self, domain: &str, selector: &str, algorithm: Algorithm) -> Result<SigningKey> {
        let (domain, selector) = normalize(domain, selector);
        let bits = self.config.rsa_key_bits;
        let (d, s) = (domain.clone(), selector.clone());
        let mut key = self
            .pool
            .run(move || SigningKey::generate(&d, &s, algorithm, bits))
            .await??;
        self.stamp_expiry(&mut key);

        self.store.insert(&key).await?;
        info!(
            key_id = %key.id,
            domain = %domain,
            selector = %selector,
            algorithm = %algorithm,
            "Generated DKIM key"
        );
        Ok(key)
    }

    /// Import an RSA private key in PEM form, status `generated`
    pub async fn import_rsa_pem(&self, domain: &str, selector: &str, pem: &str) -> Result<SigningKey> {
        let (domain, selector) = normalize(domain, selector);
        let mut key = SigningKey::from_rsa_pem(&domain, &selector, pem)?;
        self.stamp_expiry(&mut key);
        self.store.insert(&key).await?;
        info!(key_id = %key.id, domain = %domain, selector = %selector, "Imported DKIM key");
        Ok(key)
    }

    /// Mark a key published and return the TXT record text to create
    pub async fn publish(&self, id: &str) -> Result<String> {
        let key = self.load(id).await?;
        let lock = self.selector_lock(&key.domain, &key.selector).await;
        let _guard = lock.lock().await;

        let mut key = self.load(id).await?;
        match key.status {
            KeyStatus::Published => return Ok(key.dns_record()),
            KeyStatus::Generated => {}
            _ => return Err(invalid(&key, KeyStatus::Published)),
        }

        key.status = KeyStatus::Published;
        self.store.update(&key).await?;
        info!(key_id = %key.id, name = %key.dns_name(), "DKIM key published");
        Ok(key.dns_record())
    }

    /// Start signing with a published key; other active keys stay active
    pub async fn activate(&self, id: &str) -> Result<SigningKey> {
        let key = self.load(id).await?;
        let lock = self.selector_lock(&key.domain, &key.selector).await;
        let _guard = lock.lock().await;
        self.activate_locked(id).await
    }

    async fn activate_locked(&self, id: &str) -> Result<SigningKey> {
        let mut key = self.load(id).await?;
        match key.status {
            KeyStatus::Active => return Ok(key),
            KeyStatus::Published => {}
            _ => return Err(AuthError::NotPublished(key.id.clone())),
        }

        key.status = KeyStatus::Active;
        key.activated_at = Some(Utc::now());
        self.store.update(&key).await?;
        info!(key_id = %key.id, domain = %key.domain, selector = %key.selector, "DKIM key activated");
        Ok(key)
    }

    /// Stop signing with an active key; it keeps verifying
    pub async fn deprecate(&self, id: &str) -> Result<SigningKey> {
        let key = self.load(id).await?;
        let lock = self.selector_lock(&key.domain, &key.selector).await;
        let _guard = lock.lock().await;
        self.deprecate_locked(id).await
    }

    async fn deprecate_locked(&self, id: &str) -> Result<SigningKey> {
        let mut key = self.load(id).await?;
        match key.status {
            KeyStatus::Deprecated => return Ok(key),
            KeyStatus::Active => {}
            _ => return Err(invalid(&key, KeyStatus::Deprecated)),
        }

        key.status = KeyStatus::Deprecated;
        key.deprecated_at = Some(Utc::now());
        self.store.update(&key).await?;
        info!(key_id = %key.id, "DKIM key deprecated");
        Ok(key)
    }

    /// Replace the active key of a selector
    ///
    /// The new key is generated, published and activated first. Only once
    /// it is confirmed active are the previous active keys deprecated.
    pub async fn rotate(&self, domain: &str, selector: &str) -> Result<RotatedKey> {
        let (domain, selector) = normalize(domain, selector);
        let lock = self.selector_lock(&domain, &selector).await;
        let _guard = lock.lock().await;

        let existing = self.store.list_selector(&domain, &selector).await?;
        let previous: Vec<String> = existing
            .iter()
            .filter(|k| k.status == KeyStatus::Active)
            .map(|k| k.id.clone())
            .collect();
        let algorithm = existing
            .iter()
            .filter(|k| k.status != KeyStatus::Retired)
            .max_by_key(|k| k.created_at)
            .map(|k| k.algorithm)
            .unwrap_or_else(|| self.default_algorithm());

        let key = self.generate(&domain, &selector, algorithm).await?;

        let mut published = key.clone();
        published.status = KeyStatus::Published;
        self.store.update(&published).await?;
        let dns_record = published.dns_record();

        let active = self.activate_locked(&key.id).await?;
        if active.status != KeyStatus::Active {
            warn!(key_id = %key.id, "Rotation aborted, new key not active");
            return Err(invalid(&active, KeyStatus::Active));
        }

        let mut demoted = Vec::with_capacity(previous.len());
        for id in previous {
            self.deprecate_locked(&id).await?;
            demoted.push(id);
        }

        info!(
            domain = %domain,
            selector = %selector,
            key_id = %active.id,
            demoted = demoted.len(),
            "DKIM key rotated"
        );
        Ok(RotatedKey {
            key: active,
            dns_record,
            demoted,
        })
    }

    /// Take a key out of service for good
    ///
    /// Allowed for deprecated keys and for keys that never signed.
    pub async fn retire(&self, id: &str) -> Result<SigningKey> {
        let key = self.load(id).await?;
        let lock = self.selector_lock(&key.domain, &key.selector).await;
        let _guard = lock.lock().await;

        let mut key = self.load(id).await?;
        match key.status {
            KeyStatus::Retired => return Ok(key),
            KeyStatus::Deprecated | KeyStatus::Generated => {}
            KeyStatus::Published if key.activated_at.is_none() => {}
            _ => return Err(invalid(&key, KeyStatus::Retired)),
        }

        key.status = KeyStatus::Retired;
        key.retired_at = Some(Utc::now());
        self.store.update(&key).await?;
        info!(key_id = %key.id, name = %key.dns_name(), "DKIM key retired, DNS record may be removed");
        Ok(key)
    }

    /// Key to sign with: the most recently activated unexpired active key
    pub async fn active_key(&self, domain: &str, selector: Option<&str>) -> Result<Option<SigningKey>> {
        let (domain, _) = normalize(domain, "");
        let keys = match selector {
            Some(selector) => {
                let (_, selector) = normalize("", selector);
                self.store.list_selector(&domain, &selector).await?
            }
            None => self.store.list_domain(&domain).await?,
        };

        let now = Utc::now();
        Ok(keys
            .into_iter()
            .filter(|k| k.status == KeyStatus::Active && !k.is_expired(now))
            .max_by_key(|k| k.activated_at))
    }

    /// Keys that may verify signatures for a selector
    ///
    /// `None` when this manager has never held a key for the pair, which
    /// tells the verifier to fall back to DNS.
    pub async fn verification_keys(&self, domain: &str, selector: &str) -> Result<Option<Vec<SigningKey>>> {
        let (domain, selector) = normalize(domain, selector);
        let keys = self.store.list_selector(&domain, &selector).await?;
        if keys.is_empty() {
            return Ok(None);
        }
        debug!(domain = %domain, selector = %selector, "Using locally held DKIM keys");
        Ok(Some(
            keys.into_iter()
                .filter(|k| k.status.is_verifiable())
                .collect(),
        ))
    }

    pub async fn dns_record(&self, id: &str) -> Result<String> {
        Ok(self.load(id).await?.dns_record())
    }

    pub async fn get(&self, id: &str) -> Result<Option<SigningKey>> {
        self.store.get(id).await
    }

    pub async fn list(&self, domain: Option<&str>) -> Result<Vec<SigningKey>> {
        match domain {
            Some(domain) => {
                let (domain, _) = normalize(domain, "");
                self.store.list_domain(&domain).await
            }
            None => self.store.list_all().await,
        }
    }

    /// Active keys created longer than `max_age` ago or expiring within a week
    pub async fn rotation_candidates(&self, max_age: Duration) -> Result<Vec<SigningKey>> {
        let now = Utc::now();
        let cutoff = now - max_age;
        let notice = now + Duration::days(EXPIRY_NOTICE_DAYS);
        let mut keys: Vec<SigningKey> = self
            .store
            .list_all()
            .await?
            .into_iter()
            .filter(|k| k.status == KeyStatus::Active)
            .filter(|k| k.created_at < cutoff || k.expires_at.map_or(false, |at| at < notice))
            .collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }
}
