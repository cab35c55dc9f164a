//! DKIM signature verification for inbound messages

use chrono::Utc;
use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

use super::canonicalize::{
    body_hash, canonicalize_header, normalize_line_endings, select_headers, split_message, Header,
};
use super::keys::KeyManager;
use super::record::{DkimKeyRecord, PublicKey};
use super::signature::{parse_tags, strip_signature_value, DkimSignature};
use super::{DkimFailure, DkimOutcome, DkimResult};
use crate::crypto::CryptoPool;
use crate::dns::DnsResolver;

pub struct DkimVerifier {
    resolver: Arc<dyn DnsResolver>,
    keys: Option<Arc<KeyManager>>,
    pool: CryptoPool,
}

impl DkimVerifier {
    pub fn new(resolver: Arc<dyn DnsResolver>, pool: CryptoPool) -> Self {
        Self {
            resolver,
            keys: None,
            pool,
        }
    }

    /// Consult locally held keys before DNS for selectors this manager knows
    pub fn with_key_manager(mut self, keys: Arc<KeyManager>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Verify every DKIM-Signature in header order
    ///
    /// An empty result means the message carries no signature.
    pub async fn verify(&self, raw: &[u8]) -> Vec<DkimOutcome> {
        let message = normalize_line_endings(raw);
        let (headers, body) = split_message(&message);
        let now = Utc::now().timestamp().max(0) as u64;

        let checks = headers
            .iter()
            .filter(|h| h.is("DKIM-Signature"))
            .map(|h| self.verify_one(h, &headers, body, now));
        let outcomes = join_all(checks).await;

        debug!("Verified {} DKIM signature(s)", outcomes.len());
        outcomes
    }

    async fn verify_one(&self, field: &Header, headers: &[Header], body: &[u8], now: u64) -> DkimOutcome {
        let value = field.value_str();
        let signature = match DkimSignature::parse(&value) {
            Ok(sig) => sig,
            Err(failure) => {
                let tags = parse_tags(&value).unwrap_or_default();
                let tag = |name: &str| tags.get(name).cloned().unwrap_or_default().to_ascii_lowercase();
                warn!(reason = %failure, "Unusable DKIM-Signature");
                return DkimOutcome {
                    domain: tag("d"),
                    selector: tag("s"),
                    result: DkimResult::PermFail(failure),
                };
            }
        };

        let result = self.check(&signature, field, headers, body, now).await;
        match &result {
            DkimResult::Pass => debug!(domain = %signature.domain, selector = %signature.selector, "DKIM pass"),
            other => warn!(
                domain = %signature.domain,
                selector = %signature.selector,
                result = ?other,
                "DKIM verification failed"
            ),
        }

        DkimOutcome {
            domain: signature.domain,
            selector: signature.selector,
            result,
        }
    }

    async fn check(
        &self,
        signature: &DkimSignature,
        field: &Header,
        headers: &[Header],
        body: &[u8],
        now: u64,
    ) -> DkimResult {
        if signature.is_expired(now) {
            return DkimResult::PermFail(DkimFailure::Expired);
        }

        let candidates = match self.resolve_keys(signature).await {
            Ok(keys) => keys,
            Err(result) => return result,
        };

        match body_hash(signature.body_canon, body, signature.body_length) {
            Some(hash) if hash == signature.body_hash => {}
            _ => return DkimResult::PermFail(DkimFailure::BodyHash),
        }

        let mut data = Vec::new();
        for header in select_headers(headers, &signature.signed_headers) {
            data.extend_from_slice(&canonicalize_header(signature.header_canon, header));
        }
        let stripped = Header {
            name: field.name.clone(),
            raw: strip_signature_value(&field.raw),
        };
        let mut own = canonicalize_header(signature.header_canon, &stripped);
        own.truncate(own.len() - 2);
        data.extend_from_slice(&own);

        let digest = Sha256::digest(&data).to_vec();
        let sig_bytes = signature.signature.clone();
        let verified = self
            .pool
            .run(move || candidates.iter().any(|key| key.verify(&digest, &sig_bytes)))
            .await;

        match verified {
            Ok(true) => DkimResult::Pass,
            Ok(false) => DkimResult::PermFail(DkimFailure::BadSignature),
            Err(e) => DkimResult::TempFail(e.to_string()),
        }
    }

    /// Candidate keys for a signature, or the result that ends verification
    async fn resolve_keys(&self, signature: &DkimSignature) -> Result<Vec<PublicKey>, DkimResult> {
        if let Some(manager) = &self.keys {
            let local = manager
                .verification_keys(&signature.domain, &signature.selector)
                .await
                .map_err(|e| DkimResult::TempFail(format!("key store: {}", e)))?;

            if let Some(keys) = local {
                if keys.is_empty() {
                    return Err(DkimResult::PermFail(DkimFailure::Revoked));
                }
                let usable: Vec<PublicKey> = keys
                    .iter()
                    .filter(|k| k.algorithm == signature.algorithm)
                    .filter_map(|k| k.verification_key().ok())
                    .collect();
                if usable.is_empty() {
                    return Err(DkimResult::PermFail(DkimFailure::InappropriateKey));
                }
                return Ok(usable);
            }
        }

        let name = format!("{}._domainkey.{}", signature.selector, signature.domain);
        let answer = match self.resolver.txt_lookup(&name).await {
            Ok(answer) => answer,
            Err(e) if e.is_temporary() => return Err(DkimResult::TempFail(format!("dns: {}", e))),
            Err(_) => return Err(DkimResult::PermFail(DkimFailure::NoKey)),
        };

        // A rotated selector publishes the new and old records side by side
        let mut first_error = None;
        let keys: Vec<PublicKey> = answer
            .records
            .iter()
            .filter_map(|txt| match usable_key(txt, signature) {
                Ok(key) => Some(key),
                Err(e) => {
                    first_error.get_or_insert(e);
                    None
                }
            })
            .collect();

        if keys.is_empty() {
            let failure = first_error.unwrap_or(DkimFailure::NoKey);
            return Err(DkimResult::PermFail(failure));
        }
        if keys.len() > 1 {
            debug!(name = %name, count = keys.len(), "Multiple DKIM keys published");
        }
        Ok(keys)
    }
}

/// Public key of one TXT record if it may verify `signature`
fn usable_key(txt: &str, signature: &DkimSignature) -> Result<PublicKey, DkimFailure> {
    let record = DkimKeyRecord::parse(txt)?;
    if record.is_revoked() {
        return Err(DkimFailure::Revoked);
    }
    if !record.allows_email() || !record.allows_sha256() {
        return Err(DkimFailure::InappropriateKey);
    }
    let key = PublicKey::from_record(&record)?;
    if !key.suits(signature.algorithm) {
        return Err(DkimFailure::InappropriateKey);
    }
    if key.is_weak() {
        return Err(DkimFailure::WeakKey);
    }
    if record.is_strict() && !signature.identity_domain().eq_ignore_ascii_case(&signature.domain) {
        return Err(DkimFailure::DomainMismatch);
    }
    Ok(key)
}
