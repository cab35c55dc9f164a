//! DKIM signing of outbound messages

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

use super::canonicalize::{
    canonicalize_body, canonicalize_header, normalize_line_endings, select_headers, split_message, Header,
};
use super::keys::{KeyManager, SigningKey};
use super::signature::DkimSignature;
use super::Canonicalization;
use crate::config::DkimConfig;
use crate::crypto::CryptoPool;
use crate::error::{AuthError, Result};

/// A message with its new DKIM-Signature prepended
#[derive(Debug, Clone)]
pub struct SignedMessage {
    pub message: Vec<u8>,
    pub key_id: String,
    pub domain: String,
    pub selector: String,
}

pub struct DkimSigner {
    keys: Arc<KeyManager>,
    pool: CryptoPool,
    config: DkimConfig,
}

impl DkimSigner {
    pub fn new(keys: Arc<KeyManager>, pool: CryptoPool, config: DkimConfig) -> Self {
        Self { keys, pool, config }
    }

    /// Sign with the active key of `domain` (optionally a specific selector)
    ///
    /// Fails with [`AuthError::NoActiveKey`] when there is nothing to sign with.
    pub async fn sign(&self, raw: &[u8], domain: &str, selector: Option<&str>) -> Result<SignedMessage> {
        let key = self
            .keys
            .active_key(domain, selector)
            .await?
            .ok_or_else(|| AuthError::NoActiveKey(domain.to_string()))?;
        self.sign_with_key(raw, key).await
    }

    /// Sign with an explicit key regardless of its status
    pub async fn sign_with_key(&self, raw: &[u8], key: SigningKey) -> Result<SignedMessage> {
        let message = normalize_line_endings(raw);
        let (headers, body) = split_message(&message);

        let header_canon = Canonicalization::parse(&self.config.header_canonicalization)
            .unwrap_or(Canonicalization::Relaxed);
        let body_canon = Canonicalization::parse(&self.config.body_canonicalization)
            .unwrap_or(Canonicalization::Relaxed);

        let canonical_body = canonicalize_body(body_canon, body);
        let body_length = self
            .config
            .body_length_limit
            .map(|limit| limit.min(canonical_body.len() as u64));
        let hashed_len = body_length.map_or(canonical_body.len(), |l| l as usize);
        let body_hash = Sha256::digest(&canonical_body[..hashed_len]).to_vec();

        let signed_headers = self.header_list(&headers);
        let timestamp = Utc::now().timestamp().max(0) as u64;
        let expiration = match self.config.expire_after_secs {
            0 => None,
            secs => Some(timestamp + secs),
        };

        let mut signature = DkimSignature {
            version: 1,
            algorithm: key.algorithm,
            header_canon,
            body_canon,
            domain: key.domain.clone(),
            selector: key.selector.clone(),
            identity: None,
            signed_headers,
            body_length,
            body_hash,
            signature: Vec::new(),
            timestamp: Some(timestamp),
            expiration,
        };

        let template = Header {
            name: "DKIM-Signature".to_string(),
            raw: signature.to_unsigned_header().into_bytes(),
        };
        let mut data = Vec::new();
        for header in select_headers(&headers, &signature.signed_headers) {
            data.extend_from_slice(&canonicalize_header(header_canon, header));
        }
        let mut own = canonicalize_header(header_canon, &template);
        own.truncate(own.len() - 2);
        data.extend_from_slice(&own);

        let digest = Sha256::digest(&data).to_vec();
        let key_id = key.id.clone();
        let domain = key.domain.clone();
        let selector = key.selector.clone();
        signature.signature = self.pool.run(move || key.sign(&digest)).await??;

        let header = signature.to_header();
        let mut signed = Vec::with_capacity(header.len() + 2 + message.len());
        signed.extend_from_slice(header.as_bytes());
        signed.extend_from_slice(b"\r\n");
        signed.extend_from_slice(&message);

        debug!(
            headers = %signature.signed_headers.join(":"),
            "DKIM header data {} bytes",
            data.len()
        );
        info!(domain = %domain, selector = %selector, key_id = %key_id, "Message signed with DKIM");

        Ok(SignedMessage {
            message: signed,
            key_id,
            domain,
            selector,
        })
    }

    /// Configured names, repeated once per instance present
    ///
    /// From is listed once more than it occurs, so a From header added in
    /// transit breaks the signature.
    fn header_list(&self, headers: &[Header]) -> Vec<String> {
        let mut wanted: Vec<String> = self
            .config
            .signed_headers
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .collect();
        if !wanted.iter().any(|h| h == "from") {
            wanted.insert(0, "from".to_string());
        }

        let mut list = Vec::new();
        for name in wanted {
            let count = headers.iter().filter(|h| h.is(&name)).count();
            if name == "from" {
                list.extend(std::iter::repeat(name).take(count + 1));
            } else {
                list.extend(std::iter::repeat(name).take(count));
            }
        }
        list
    }
}
