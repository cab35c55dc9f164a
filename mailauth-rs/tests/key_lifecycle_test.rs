//! Integration tests for key rotation and the SQLite key store

use mailauth_rs::authentication::{AuthEngine, Envelope};
use mailauth_rs::config::Config;
use mailauth_rs::dkim::{Algorithm, DkimResult, KeyStatus, KeyStore, MemoryKeyStore, SqliteKeyStore};
use mailauth_rs::dns::MemoryResolver;
use mailauth_rs::AuthError;
use std::sync::Arc;

const MESSAGE: &[u8] = b"From: ops@example.com\r\n\
    To: team@example.org\r\n\
    Subject: Maintenance window\r\n\
    \r\n\
    Saturday 02:00 UTC.\r\n";

async fn sqlite_engine(url: &str) -> AuthEngine {
    let store: Arc<dyn KeyStore> = Arc::new(SqliteKeyStore::connect(url).await.unwrap());
    AuthEngine::new(Config::default(), Arc::new(MemoryResolver::new()), store)
}

fn envelope() -> Envelope {
    Envelope::new("192.0.2.1".parse().unwrap(), "mx.example.com", "ops@example.com")
}

#[tokio::test]
async fn test_rotation_keeps_old_signatures_valid() {
    let tempdir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", tempdir.path().join("keys.db").display());
    let engine = sqlite_engine(&url).await;

    let first = engine
        .keys()
        .generate("example.com", "mail", Algorithm::Ed25519Sha256)
        .await
        .unwrap();
    engine.keys().publish(&first.id).await.unwrap();
    engine.keys().activate(&first.id).await.unwrap();

    let before = engine.sign_outbound(MESSAGE, "example.com").await.unwrap();
    assert_eq!(before.signed_by.as_ref().unwrap().key_id, first.id);

    let rotated = engine.keys().rotate("example.com", "mail").await.unwrap();
    assert_eq!(rotated.demoted, vec![first.id.clone()]);
    assert_eq!(rotated.key.status, KeyStatus::Active);
    assert_eq!(rotated.key.algorithm, Algorithm::Ed25519Sha256);
    assert!(rotated.dns_record.starts_with("v=DKIM1; k=ed25519; p="));

    // Mail signed before the rotation still verifies during the overlap
    let result = engine.verify_inbound(&before.bytes, &envelope()).await;
    assert_eq!(result.dkim[0].result, DkimResult::Pass);

    let after = engine.sign_outbound(MESSAGE, "example.com").await.unwrap();
    assert_eq!(after.signed_by.as_ref().unwrap().key_id, rotated.key.id);
    assert!(engine.verify_inbound(&after.bytes, &envelope()).await.dkim[0]
        .result
        .is_pass());

    // Once retired, the old key no longer vouches for anything
    engine.keys().retire(&first.id).await.unwrap();
    let result = engine.verify_inbound(&before.bytes, &envelope()).await;
    assert!(!result.dkim[0].result.is_pass());
}

#[tokio::test]
async fn test_rotation_overlap_for_remote_receivers() {
    let tempdir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", tempdir.path().join("keys.db").display());
    let sending = sqlite_engine(&url).await;

    let old = sending
        .keys()
        .generate("example.com", "mail", Algorithm::Ed25519Sha256)
        .await
        .unwrap();
    let old_record = sending.keys().publish(&old.id).await.unwrap();
    sending.keys().activate(&old.id).await.unwrap();
    let before = sending.sign_outbound(MESSAGE, "example.com").await.unwrap();

    let rotated = sending.keys().rotate("example.com", "mail").await.unwrap();
    let after = sending.sign_outbound(MESSAGE, "example.com").await.unwrap();

    // The receiver only sees DNS, with the new record listed first
    let zone = MemoryResolver::new()
        .with_txt("mail._domainkey.example.com", &rotated.dns_record)
        .with_txt("mail._domainkey.example.com", &old_record);
    let receiving = AuthEngine::new(
        Config::default(),
        Arc::new(zone),
        Arc::new(MemoryKeyStore::new()),
    );

    let result = receiving.verify_inbound(&before.bytes, &envelope()).await;
    assert_eq!(result.dkim[0].result, DkimResult::Pass);
    let result = receiving.verify_inbound(&after.bytes, &envelope()).await;
    assert_eq!(result.dkim[0].result, DkimResult::Pass);

    // Withdrawing the old record ends the overlap
    let zone = MemoryResolver::new().with_txt("mail._domainkey.example.com", &rotated.dns_record);
    let receiving = AuthEngine::new(
        Config::default(),
        Arc::new(zone),
        Arc::new(MemoryKeyStore::new()),
    );
    let result = receiving.verify_inbound(&before.bytes, &envelope()).await;
    assert!(!result.dkim[0].result.is_pass());
}

#[tokio::test]
async fn test_keys_survive_reopening_the_database() {
    let tempdir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", tempdir.path().join("keys.db").display());

    let key_id = {
        let engine = sqlite_engine(&url).await;
        let key = engine
            .keys()
            .generate("example.com", "mail", Algorithm::Ed25519Sha256)
            .await
            .unwrap();
        engine.keys().publish(&key.id).await.unwrap();
        engine.keys().activate(&key.id).await.unwrap();
        key.id
    };

    let engine = sqlite_engine(&url).await;
    let stored = engine.keys().get(&key_id).await.unwrap().unwrap();
    assert_eq!(stored.status, KeyStatus::Active);
    assert!(stored.activated_at.is_some());

    let outbound = engine.sign_outbound(MESSAGE, "example.com").await.unwrap();
    assert_eq!(outbound.signed_by.unwrap().key_id, key_id);
    assert!(engine.verify_inbound(&outbound.bytes, &envelope()).await.dkim[0]
        .result
        .is_pass());

    let listed = engine.keys().list(Some("example.com")).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_private_keys_are_sealed_at_rest() {
    let tempdir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", tempdir.path().join("keys.db").display());
    let config = |kek: &str| {
        let mut config = Config::default();
        config.keys.database_url = Some(url.clone());
        config.keys.encryption_key = Some(kek.to_string());
        config
    };
    let kek = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    let key_id = {
        let engine = AuthEngine::from_config(config(kek)).await.unwrap();
        let key = engine
            .keys()
            .generate("example.com", "mail", Algorithm::Ed25519Sha256)
            .await
            .unwrap();
        engine.keys().publish(&key.id).await.unwrap();
        engine.keys().activate(&key.id).await.unwrap();
        key.id
    };

    let db = sqlx::SqlitePool::connect(&url).await.unwrap();
    let (encrypted,): (bool,) = sqlx::query_as("SELECT encrypted FROM dkim_keys WHERE id = ?")
        .bind(&key_id)
        .fetch_one(&db)
        .await
        .unwrap();
    assert!(encrypted);
    db.close().await;

    let engine = AuthEngine::from_config(config(kek)).await.unwrap();
    let outbound = engine.sign_outbound(MESSAGE, "example.com").await.unwrap();
    assert_eq!(outbound.signed_by.unwrap().key_id, key_id);

    let wrong = AuthEngine::from_config(config("ZmVkY2JhOTg3NjU0MzIxMGZlZGNiYTk4NzY1NDMyMTA="))
        .await
        .unwrap();
    assert!(matches!(
        wrong.sign_outbound(MESSAGE, "example.com").await,
        Err(AuthError::Crypto(_))
    ));
}

#[tokio::test]
async fn test_activation_requires_publication() {
    let tempdir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", tempdir.path().join("keys.db").display());
    let engine = sqlite_engine(&url).await;
    let key = engine
        .keys()
        .generate("example.net", "s2026", Algorithm::Ed25519Sha256)
        .await
        .unwrap();

    assert!(matches!(
        engine.keys().activate(&key.id).await,
        Err(AuthError::NotPublished(_))
    ));

    let record = engine.keys().publish(&key.id).await.unwrap();
    assert_eq!(engine.keys().publish(&key.id).await.unwrap(), record);
    assert_eq!(engine.keys().dns_record(&key.id).await.unwrap(), record);
}
