//! Persistence for DKIM keys

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{KeyCipher, KeyStatus, SigningKey};
use crate::dkim::Algorithm;
use crate::error::{AuthError, Result};

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn insert(&self, key: &SigningKey) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<SigningKey>>;

    /// Persist lifecycle changes (status and timestamps)
    async fn update(&self, key: &SigningKey) -> Result<()>;

    async fn list_domain(&self, domain: &str) -> Result<Vec<SigningKey>>;

    async fn list_selector(&self, domain: &str, selector: &str) -> Result<Vec<SigningKey>>;

    async fn list_all(&self) -> Result<Vec<SigningKey>>;
}

/// Process-local key store
pub struct MemoryKeyStore {
    keys: Arc<RwLock<HashMap<String, SigningKey>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self {
            keys: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn filtered<F>(&self, keep: F) -> Vec<SigningKey>
    where
        F: Fn(&SigningKey) -> bool,
    {
        let keys = self.keys.read().await;
        let mut found: Vec<SigningKey> = keys.values().filter(|k| keep(k)).cloned().collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        found
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn insert(&self, key: &SigningKey) -> Result<()> {
        let mut keys = self.keys.write().await;
        keys.insert(key.id.clone(), key.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SigningKey>> {
        let keys = self.keys.read().await;
        Ok(keys.get(id).cloned())
    }

    async fn update(&self, key: &SigningKey) -> Result<()> {
        let mut keys = self.keys.write().await;
        match keys.get_mut(&key.id) {
            Some(existing) => {
                *existing = key.clone();
                Ok(())
            }
            None => Err(AuthError::KeyNotFound(key.id.clone())),
        }
    }

    async fn list_domain(&self, domain: &str) -> Result<Vec<SigningKey>> {
        Ok(self.filtered(|k| k.domain == domain).await)
    }

    async fn list_selector(&self, domain: &str, selector: &str) -> Result<Vec<SigningKey>> {
        Ok(self
            .filtered(|k| k.domain == domain && k.selector == selector)
            .await)
    }

    async fn list_all(&self) -> Result<Vec<SigningKey>> {
        Ok(self.filtered(|_| true).await)
    }
}

type KeyRow = (
    String,
    String,
    String,
    String,
    Vec<u8>,
    bool,
    Vec<u8>,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

const SELECT_KEYS: &str = "SELECT id, domain, selector, algorithm, private_key, encrypted, public_key, \
     status, created_at, activated_at, deprecated_at, retired_at, expires_at FROM dkim_keys";

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AuthError::Parse(format!("Invalid timestamp {}: {}", value, e)))
}

fn parse_optional_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_time).transpose()
}

fn from_row(row: KeyRow, cipher: Option<&KeyCipher>) -> Result<SigningKey> {
    let (
        id,
        domain,
        selector,
        algorithm,
        stored_key,
        encrypted,
        public_key,
        status,
        created_at,
        activated_at,
        deprecated_at,
        retired_at,
        expires_at,
    ) = row;

    let private_key = match (encrypted, cipher) {
        (false, _) => stored_key,
        (true, Some(cipher)) => cipher.open(&stored_key)?,
        (true, None) => {
            return Err(AuthError::Config(format!(
                "key {} is encrypted but no keys.encryption_key is configured",
                id
            )))
        }
    };

    Ok(SigningKey {
        algorithm: Algorithm::parse(&algorithm)
            .ok_or_else(|| AuthError::Parse(format!("Unknown algorithm {} for key {}", algorithm, id)))?,
        status: KeyStatus::parse(&status)
            .ok_or_else(|| AuthError::Parse(format!("Unknown status {} for key {}", status, id)))?,
        created_at: parse_time(&created_at)?,
        activated_at: parse_optional_time(activated_at)?,
        deprecated_at: parse_optional_time(deprecated_at)?,
        retired_at: parse_optional_time(retired_at)?,
        expires_at: parse_optional_time(expires_at)?,
        id,
        domain,
        selector,
        private_key,
        public_key,
    })
}

/// Key store in a SQLite database
///
/// With a [`KeyCipher`] attached, private keys are written sealed. Rows
/// written without one stay readable.
pub struct SqliteKeyStore {
    db: SqlitePool,
    cipher: Option<KeyCipher>,
}

impl SqliteKeyStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db, cipher: None }
    }

    /// Seal private keys under `cipher` from now on
    pub fn with_cipher(mut self, cipher: KeyCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Connect and attach the configured key-encryption key, if any
    pub async fn open(database_url: &str, encryption_key: Option<&str>) -> Result<Self> {
        let store = Self::connect(database_url).await?;
        match encryption_key {
            Some(encoded) => Ok(store.with_cipher(KeyCipher::from_base64(encoded)?)),
            None => {
                warn!("No keys.encryption_key configured, DKIM private keys are stored unencrypted");
                Ok(store)
            }
        }
    }

    /// Connect to `database_url` and create the table if needed
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Opening DKIM key store at {}", database_url);
        let db = SqlitePool::connect(database_url).await?;
        let store = Self::new(db);
        store.init_db().await?;
        Ok(store)
    }

    pub async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dkim_keys (
                id TEXT PRIMARY KEY,
                domain TEXT NOT NULL,
                selector TEXT NOT NULL,
                algorithm TEXT NOT NULL,
                private_key BLOB NOT NULL,
                encrypted INTEGER NOT NULL DEFAULT 0,
                public_key BLOB NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                activated_at TEXT,
                deprecated_at TEXT,
                retired_at TEXT,
                expires_at TEXT
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dkim_keys_domain_selector ON dkim_keys (domain, selector)",
        )
        .execute(&self.db)
        .await?;

        debug!("DKIM key table ready");
        Ok(())
    }

    async fn fetch(&self, sql: String, binds: &[&str]) -> Result<Vec<SigningKey>> {
        let mut query = sqlx::query_as::<_, KeyRow>(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.db).await?;
        rows.into_iter()
            .map(|row| from_row(row, self.cipher.as_ref()))
            .collect()
    }

    fn stored_private_key(&self, key: &SigningKey) -> Result<(Vec<u8>, bool)> {
        match &self.cipher {
            Some(cipher) => Ok((cipher.seal(&key.private_key)?, true)),
            None => Ok((key.private_key.clone(), false)),
        }
    }
}

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn insert(&self, key: &SigningKey) -> Result<()> {
        let (private_key, encrypted) = self.stored_private_key(key)?;
        sqlx::query(
            r#"
            INSERT INTO dkim_keys (id, domain, selector, algorithm, private_key, encrypted,
                public_key, status, created_at, activated_at, deprecated_at, retired_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&key.id)
        .bind(&key.domain)
        .bind(&key.selector)
        .bind(key.algorithm.as_str())
        .bind(private_key)
        .bind(encrypted)
        .bind(&key.public_key)
        .bind(key.status.as_str())
        .bind(key.created_at.to_rfc3339())
        .bind(key.activated_at.map(|t| t.to_rfc3339()))
        .bind(key.deprecated_at.map(|t| t.to_rfc3339()))
        .bind(key.retired_at.map(|t| t.to_rfc3339()))
        .bind(key.expires_at.map(|t| t.to_rfc3339()))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SigningKey>> {
        let row = sqlx::query_as::<_, KeyRow>(&format!("{} WHERE id = ?", SELECT_KEYS))
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.map(|row| from_row(row, self.cipher.as_ref())).transpose()
    }

    async fn update(&self, key: &SigningKey) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE dkim_keys
            SET status = ?, activated_at = ?, deprecated_at = ?, retired_at = ?
            WHERE id = ?
            "#,
        )
        .bind(key.status.as_str())
        .bind(key.activated_at.map(|t| t.to_rfc3339()))
        .bind(key.deprecated_at.map(|t| t.to_rfc3339()))
        .bind(key.retired_at.map(|t| t.to_rfc3339()))
        .bind(&key.id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AuthError::KeyNotFound(key.id.clone()));
        }
        Ok(())
    }

    async fn list_domain(&self, domain: &str) -> Result<Vec<SigningKey>> {
        self.fetch(
            format!("{} WHERE domain = ? ORDER BY created_at, id", SELECT_KEYS),
            &[domain],
        )
        .await
    }

    async fn list_selector(&self, domain: &str, selector: &str) -> Result<Vec<SigningKey>> {
        self.fetch(
            format!(
                "{} WHERE domain = ? AND selector = ? ORDER BY created_at, id",
                SELECT_KEYS
            ),
            &[domain, selector],
        )
        .await
    }

    async fn list_all(&self) -> Result<Vec<SigningKey>> {
        self.fetch(format!("{} ORDER BY domain, selector, created_at", SELECT_KEYS), &[])
            .await
    }
}
