//! End-to-end tests: a sending engine signs, a receiving engine verifies
//! against an in-memory DNS zone

use mailauth_rs::authentication::{AuthEngine, Envelope};
use mailauth_rs::config::Config;
use mailauth_rs::dkim::{Algorithm, DkimFailure, DkimResult, MemoryKeyStore};
use mailauth_rs::dmarc::{DmarcStatus, Policy};
use mailauth_rs::dns::{DnsResolver, MemoryResolver};
use mailauth_rs::spf::{SpfError, SpfResult};
use std::sync::Arc;

const MESSAGE: &[u8] = b"From: Alice <alice@example.com>\r\n\
    To: Bob <bob@example.org>\r\n\
    Subject: Quarterly numbers\r\n\
    Date: Mon, 12 Oct 2026 09:30:00 +0000\r\n\
    Message-ID: <q3@example.com>\r\n\
    \r\n\
    The spreadsheet is attached.\r\n\
    \r\n\
    Alice\r\n";

fn test_config() -> Config {
    let mut config = Config::default();
    config.dkim.rsa_key_bits = 1024;
    config.dmarc.authserv_id = "mx.example.org".to_string();
    config
}

fn engine_with(resolver: Arc<MemoryResolver>) -> AuthEngine {
    let resolver: Arc<dyn DnsResolver> = resolver;
    AuthEngine::new(test_config(), resolver, Arc::new(MemoryKeyStore::new()))
}

/// Sending side with one active key; returns the engine and the key's TXT record
async fn sender(domain: &str, selector: &str, algorithm: Algorithm) -> (AuthEngine, String) {
    let engine = engine_with(Arc::new(MemoryResolver::new()));
    let key = engine.keys().generate(domain, selector, algorithm).await.unwrap();
    let record = engine.keys().publish(&key.id).await.unwrap();
    engine.keys().activate(&key.id).await.unwrap();
    (engine, record)
}

fn envelope(ip: &str, mail_from: &str) -> Envelope {
    Envelope::new(ip.parse().unwrap(), "mx.example.com", mail_from)
}

#[tokio::test]
async fn test_signed_message_passes_everything() {
    for algorithm in [Algorithm::RsaSha256, Algorithm::Ed25519Sha256] {
        let (sending, record) = sender("example.com", "mail", algorithm).await;
        let zone = MemoryResolver::new()
            .with_txt("mail._domainkey.example.com", &record)
            .with_txt("example.com", "v=spf1 ip4:192.0.2.0/24 -all")
            .with_txt("_dmarc.example.com", "v=DMARC1; p=reject");
        let receiving = engine_with(Arc::new(zone));

        let outbound = sending.sign_outbound(MESSAGE, "example.com").await.unwrap();
        let result = receiving
            .verify_inbound(&outbound.bytes, &envelope("192.0.2.25", "alice@example.com"))
            .await;

        assert_eq!(result.spf.result, SpfResult::Pass, "{:?}", algorithm);
        assert_eq!(result.dkim.len(), 1);
        assert_eq!(result.dkim[0].result, DkimResult::Pass, "{:?}", algorithm);
        assert_eq!(result.dmarc.status, DmarcStatus::Pass);
        assert!(result.dmarc.spf_aligned && result.dmarc.dkim_aligned);
        assert_eq!(result.dmarc.disposition, Policy::None);

        assert_eq!(
            receiving.results_header(&result),
            "mx.example.org; spf=pass smtp.mailfrom=example.com; \
             dkim=pass header.d=example.com header.s=mail; \
             dmarc=pass (p=reject) header.from=example.com"
        );
    }
}

#[tokio::test]
async fn test_tampered_body_is_rejected() {
    let (sending, record) = sender("example.com", "mail", Algorithm::Ed25519Sha256).await;
    let zone = MemoryResolver::new()
        .with_txt("mail._domainkey.example.com", &record)
        .with_txt("example.com", "v=spf1 ip4:192.0.2.0/24 -all")
        .with_txt("_dmarc.example.com", "v=DMARC1; p=reject; pct=100");
    let receiving = engine_with(Arc::new(zone));

    let outbound = sending.sign_outbound(MESSAGE, "example.com").await.unwrap();
    let tampered = String::from_utf8(outbound.bytes)
        .unwrap()
        .replace("spreadsheet", "spreadsheeT")
        .into_bytes();

    // Relayed through a host outside the SPF range
    let result = receiving
        .verify_inbound(&tampered, &envelope("203.0.113.9", "alice@example.com"))
        .await;

    assert_eq!(result.spf.result, SpfResult::Fail);
    assert_eq!(result.dkim[0].result, DkimResult::PermFail(DkimFailure::BodyHash));
    assert_eq!(result.dmarc.status, DmarcStatus::Fail);
    assert!(!result.dmarc.aligned);
    assert_eq!(result.dmarc.disposition, Policy::Reject);
    assert!(!result.dmarc.sampled_out);
}

#[tokio::test]
async fn test_tampered_header_is_rejected() {
    let (sending, record) = sender("example.com", "mail", Algorithm::Ed25519Sha256).await;
    let zone = MemoryResolver::new().with_txt("mail._domainkey.example.com", &record);
    let receiving = engine_with(Arc::new(zone));

    let outbound = sending.sign_outbound(MESSAGE, "example.com").await.unwrap();
    let tampered = String::from_utf8(outbound.bytes)
        .unwrap()
        .replace("Subject: Quarterly numbers", "Subject: Quarterly Numbers")
        .into_bytes();

    let result = receiving
        .verify_inbound(&tampered, &envelope("203.0.113.9", "alice@example.com"))
        .await;
    assert_eq!(result.dkim[0].result, DkimResult::PermFail(DkimFailure::BadSignature));
    assert_eq!(result.spf.result, SpfResult::None);
    assert_eq!(result.dmarc.status, DmarcStatus::NoPolicy);
}

#[tokio::test]
async fn test_injected_from_header_is_rejected() {
    let (sending, record) = sender("example.com", "mail", Algorithm::Ed25519Sha256).await;
    let zone = MemoryResolver::new()
        .with_txt("mail._domainkey.example.com", &record)
        .with_txt("example.com", "v=spf1 ip4:192.0.2.0/24 -all")
        .with_txt("_dmarc.example.com", "v=DMARC1; p=none");
    let receiving = engine_with(Arc::new(zone));

    let outbound = sending.sign_outbound(MESSAGE, "example.com").await.unwrap();
    let mut forged = b"From: CEO <ceo@bank.example>\r\n".to_vec();
    forged.extend_from_slice(&outbound.bytes);

    let result = receiving
        .verify_inbound(&forged, &envelope("192.0.2.25", "alice@example.com"))
        .await;

    assert_eq!(result.spf.result, SpfResult::Pass);
    assert_eq!(result.dkim[0].result, DkimResult::PermFail(DkimFailure::BadSignature));
    assert_eq!(result.dmarc.status, DmarcStatus::Fail);
    assert_eq!(result.dmarc.disposition, Policy::Reject);
    assert_eq!(result.dmarc.from_domain, "bank.example");
}

#[tokio::test]
async fn test_pct_zero_samples_out_enforcement() {
    let zone = MemoryResolver::new()
        .with_txt("example.com", "v=spf1 -all")
        .with_txt("_dmarc.example.com", "v=DMARC1; p=reject; pct=0");
    let receiving = engine_with(Arc::new(zone));

    let result = receiving
        .verify_inbound(MESSAGE, &envelope("203.0.113.9", "alice@example.com"))
        .await;

    assert_eq!(result.dmarc.status, DmarcStatus::Fail);
    assert_eq!(result.dmarc.policy, Some(Policy::Reject));
    assert_eq!(result.dmarc.disposition, Policy::None);
    assert!(result.dmarc.sampled_out);
}

#[tokio::test]
async fn test_strict_dkim_relaxed_spf_example() {
    let message = b"From: User <user@mail.example.com>\r\n\
        To: someone@example.org\r\n\
        Subject: Alignment\r\n\
        \r\n\
        Hello\r\n";

    let (sending, record) = sender("example.com", "s1", Algorithm::Ed25519Sha256).await;
    let zone = MemoryResolver::new()
        .with_txt("s1._domainkey.example.com", &record)
        .with_txt("example.com", "v=spf1 ip4:198.51.100.0/24 -all")
        .with_txt("_dmarc.example.com", "v=DMARC1; p=quarantine; adkim=s; aspf=r");
    let receiving = engine_with(Arc::new(zone));

    let outbound = sending.sign_outbound(message, "example.com").await.unwrap();
    let result = receiving
        .verify_inbound(&outbound.bytes, &envelope("198.51.100.7", "bounce@example.com"))
        .await;

    assert!(result.dkim[0].result.is_pass());
    assert_eq!(result.spf.result, SpfResult::Pass);
    assert!(!result.dmarc.dkim_aligned);
    assert!(result.dmarc.spf_aligned);
    assert_eq!(result.dmarc.status, DmarcStatus::Pass);
    assert_eq!(result.dmarc.from_domain, "mail.example.com");
    assert_eq!(result.dmarc.policy_domain.as_deref(), Some("example.com"));
}

#[tokio::test]
async fn test_include_chain_exceeds_lookup_limit() {
    let mut zone = MemoryResolver::new().with_txt("example.com", "v=spf1 include:i1.example.com -all");
    for n in 1..=11 {
        let next = if n == 11 {
            "v=spf1 ip4:192.0.2.0/24 -all".to_string()
        } else {
            format!("v=spf1 include:i{}.example.com -all", n + 1)
        };
        zone = zone.with_txt(&format!("i{}.example.com", n), &next);
    }
    let receiving = engine_with(Arc::new(zone));

    let result = receiving
        .verify_inbound(MESSAGE, &envelope("192.0.2.25", "alice@example.com"))
        .await;
    assert_eq!(result.spf.result, SpfResult::PermFail(SpfError::TooManyLookups));
    assert!(receiving
        .results_header(&result)
        .contains("spf=permerror (too-many-lookups)"));
}

#[tokio::test]
async fn test_same_input_gives_same_result() {
    let (sending, record) = sender("example.com", "mail", Algorithm::Ed25519Sha256).await;
    let zone = MemoryResolver::new()
        .with_txt("mail._domainkey.example.com", &record)
        .with_txt("example.com", "v=spf1 ip4:192.0.2.0/24 ~all")
        .with_txt("_dmarc.example.com", "v=DMARC1; p=quarantine; pct=50");
    let receiving = engine_with(Arc::new(zone));

    let outbound = sending.sign_outbound(MESSAGE, "example.com").await.unwrap();
    let forged = String::from_utf8(outbound.bytes.clone())
        .unwrap()
        .replace("Alice\r\n", "Mallory\r\n")
        .into_bytes();
    let env = envelope("203.0.113.9", "alice@example.com");

    for raw in [&outbound.bytes, &forged] {
        let first = receiving.verify_inbound(raw, &env).await;
        let second = receiving.verify_inbound(raw, &env).await;
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }
}

#[tokio::test]
async fn test_unsigned_when_no_active_key() {
    let engine = engine_with(Arc::new(MemoryResolver::new()));
    let key = engine
        .keys()
        .generate("example.com", "mail", Algorithm::Ed25519Sha256)
        .await
        .unwrap();
    engine.keys().publish(&key.id).await.unwrap();

    // Published but never activated
    let outbound = engine.sign_outbound(MESSAGE, "example.com").await.unwrap();
    assert!(outbound.signed_by.is_none());
    assert_eq!(outbound.bytes, MESSAGE);
}

#[tokio::test]
async fn test_aggregate_report_collects_evaluations() {
    let zone = MemoryResolver::new()
        .with_txt("example.com", "v=spf1 ip4:192.0.2.0/24 -all")
        .with_txt("_dmarc.example.com", "v=DMARC1; p=none; rua=mailto:dmarc@example.com");
    let receiving = engine_with(Arc::new(zone));
    let env = envelope("192.0.2.25", "alice@example.com");

    receiving.verify_inbound(MESSAGE, &env).await;
    receiving.verify_inbound(MESSAGE, &env).await;

    let reporter = receiving.reporter().unwrap();
    let now = chrono::Utc::now();
    let reports = reporter
        .drain("mx.example.org", "postmaster@example.org", now - chrono::Duration::days(1), now)
        .await;

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].policy.domain, "example.com");
    assert_eq!(reports[0].records.len(), 1);
    assert_eq!(reports[0].records[0].count, 2);
    assert!(reports[0].to_xml().contains("<count>2</count>"));
    assert!(reporter.is_empty().await);
}
