//! Email authentication engine (SPF, DKIM, DMARC)
//!
//! [`AuthEngine`] is the surface the SMTP layers talk to: inbound messages
//! go through [`AuthEngine::verify_inbound`], outbound ones through
//! [`AuthEngine::sign_outbound`]. It owns the shared state (DNS cache, key
//! manager, crypto pool and report accumulator).

pub mod types;

pub use types::{AuthResult, Envelope, OutboundMessage, SignedBy};

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::crypto::CryptoPool;
use crate::dkim::{DkimSigner, DkimVerifier, KeyManager, KeyStore, MemoryKeyStore, SqliteKeyStore};
use crate::dmarc::{AggregateReporter, DmarcEvaluator, DmarcInput};
use crate::dns::{DnsCache, DnsResolver, TrustDnsResolver};
use crate::error::Result;
use crate::spf::SpfEvaluator;
use crate::utils;

pub struct AuthEngine {
    config: Config,
    dns: DnsCache,
    keys: Arc<KeyManager>,
    signer: DkimSigner,
    verifier: DkimVerifier,
    spf: SpfEvaluator,
    dmarc: DmarcEvaluator,
    reporter: Option<Arc<AggregateReporter>>,
}

impl AuthEngine {
    /// Wire the evaluators around one DNS cache and one key manager
    pub fn new(config: Config, resolver: Arc<dyn DnsResolver>, key_store: Arc<dyn KeyStore>) -> Self {
        let dns = DnsCache::new(resolver, &config.dns);
        let shared_dns: Arc<dyn DnsResolver> = Arc::new(dns.clone());
        let pool = CryptoPool::new(config.crypto.max_concurrent_ops);

        let keys = Arc::new(KeyManager::new(key_store, pool.clone(), config.dkim.clone()));
        let signer = DkimSigner::new(Arc::clone(&keys), pool.clone(), config.dkim.clone());
        let verifier = DkimVerifier::new(Arc::clone(&shared_dns), pool).with_key_manager(Arc::clone(&keys));
        let spf = SpfEvaluator::new(Arc::clone(&shared_dns), config.spf.clone());

        let reporter = config
            .dmarc
            .reporting_enabled
            .then(|| Arc::new(AggregateReporter::new()));
        let dmarc = match &reporter {
            Some(reporter) => DmarcEvaluator::new(shared_dns).with_reporter(Arc::clone(reporter)),
            None => DmarcEvaluator::new(shared_dns),
        };

        info!(
            crypto_pool = config.crypto.max_concurrent_ops,
            reporting = config.dmarc.reporting_enabled,
            "Authentication engine ready"
        );

        Self {
            config,
            dns,
            keys,
            signer,
            verifier,
            spf,
            dmarc,
            reporter,
        }
    }

    /// Build an engine from configuration alone
    ///
    /// Uses the system resolver and the SQLite key store from `[keys]`, or an
    /// in-memory store when no database is configured. Private keys are
    /// sealed when `[keys] encryption_key` is set.
    pub async fn from_config(config: Config) -> Result<Self> {
        let key_store: Arc<dyn KeyStore> = match &config.keys.database_url {
            Some(url) => {
                let kek = config.keys.encryption_key.as_deref();
                Arc::new(SqliteKeyStore::open(url, kek).await?)
            }
            None => Arc::new(MemoryKeyStore::new()),
        };
        let resolver = Arc::new(TrustDnsResolver::from_system_conf());
        Ok(Self::new(config, resolver, key_store))
    }

    /// Run SPF, DKIM and DMARC for one inbound message
    pub async fn verify_inbound(&self, raw: &[u8], envelope: &Envelope) -> AuthResult {
        let (dkim, spf) = tokio::join!(
            self.verifier.verify(raw),
            self.spf
                .evaluate(envelope.client_ip, &envelope.helo, &envelope.mail_from),
        );

        let authors = utils::from_domains(raw);
        let dmarc = self
            .dmarc
            .evaluate_authors(
                &authors,
                DmarcInput {
                    from_domain: "",
                    spf: &spf,
                    dkim: &dkim,
                    client_ip: envelope.client_ip,
                    raw,
                },
            )
            .await;

        info!(
            client_ip = %envelope.client_ip,
            spf = %spf.result,
            dkim_signatures = dkim.len(),
            dmarc = %dmarc.status,
            "Inbound message authenticated"
        );

        AuthResult { spf, dkim, dmarc }
    }

    /// DKIM-sign an outbound message with the active key of `from_domain`
    ///
    /// A missing key is a configuration problem, not a delivery failure: the
    /// message passes through unsigned and the problem is logged.
    pub async fn sign_outbound(&self, raw: &[u8], from_domain: &str) -> Result<OutboundMessage> {
        match self.signer.sign(raw, from_domain, None).await {
            Ok(signed) => Ok(OutboundMessage {
                bytes: signed.message,
                signed_by: Some(SignedBy {
                    domain: signed.domain,
                    selector: signed.selector,
                    key_id: signed.key_id,
                }),
            }),
            Err(e) if e.is_config_error() => {
                warn!(domain = %from_domain, error = %e, "Sending unsigned message");
                Ok(OutboundMessage {
                    bytes: raw.to_vec(),
                    signed_by: None,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Key administration
    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Aggregate report accumulator, `None` when reporting is disabled
    pub fn reporter(&self) -> Option<&Arc<AggregateReporter>> {
        self.reporter.as_ref()
    }

    pub fn dns_cache(&self) -> &DnsCache {
        &self.dns
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Authentication-Results value using the configured authserv-id
    pub fn results_header(&self, result: &AuthResult) -> String {
        result.to_header(&self.config.dmarc.authserv_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkim::Algorithm;
    use crate::dmarc::DmarcStatus;
    use crate::dns::MemoryResolver;
    use crate::spf::SpfResult;

    const MESSAGE: &[u8] = b"From: Alice <alice@example.com>\r\n\
        To: bob@example.org\r\n\
        Subject: Lunch\r\n\
        \r\n\
        See you at noon.\r\n";

    fn engine(resolver: MemoryResolver) -> AuthEngine {
        let mut config = Config::default();
        config.dkim.rsa_key_bits = 1024;
        AuthEngine::new(config, Arc::new(resolver), Arc::new(MemoryKeyStore::new()))
    }

    #[tokio::test]
    async fn test_sign_then_verify() {
        let resolver = MemoryResolver::new()
            .with_txt("example.com", "v=spf1 ip4:192.0.2.0/24 -all")
            .with_txt("_dmarc.example.com", "v=DMARC1; p=reject");
        let engine = engine(resolver);

        let key = engine.keys().generate("example.com", "mail", Algorithm::Ed25519Sha256).await.unwrap();
        engine.keys().publish(&key.id).await.unwrap();
        engine.keys().activate(&key.id).await.unwrap();

        let outbound = engine.sign_outbound(MESSAGE, "example.com").await.unwrap();
        assert!(outbound.is_signed());
        assert_eq!(outbound.signed_by.as_ref().unwrap().key_id, key.id);

        let envelope = Envelope::new("192.0.2.10".parse().unwrap(), "mx.example.com", "alice@example.com");
        let result = engine.verify_inbound(&outbound.bytes, &envelope).await;

        assert_eq!(result.spf.result, SpfResult::Pass);
        assert_eq!(result.dkim.len(), 1);
        assert!(result.dkim[0].result.is_pass());
        assert_eq!(result.dmarc.status, DmarcStatus::Pass);
        assert!(engine
            .results_header(&result)
            .contains("dmarc=pass (p=reject) header.from=example.com"));
    }

    #[tokio::test]
    async fn test_unsigned_passthrough() {
        let engine = engine(MemoryResolver::new());
        let outbound = engine.sign_outbound(MESSAGE, "example.com").await.unwrap();
        assert!(!outbound.is_signed());
        assert_eq!(outbound.bytes, MESSAGE);
    }

    #[tokio::test]
    async fn test_reporter_follows_config() {
        let mut config = Config::default();
        config.dmarc.reporting_enabled = false;
        let engine = AuthEngine::new(config, Arc::new(MemoryResolver::new()), Arc::new(MemoryKeyStore::new()));
        assert!(engine.reporter().is_none());

        assert!(self::engine(MemoryResolver::new()).reporter().is_some());
    }
}
