mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ca_server::{
    ca::CertificateAuthority,
    crl::{IssuingPointConfig, RevocationReason},
    signer::{Signer, SignerError, SigningAlgorithm},
};
use common::{Fixture, eventually, manual_config, serial_list, serials};

const ID: &str = "MasterCRL";

mockall::mock! {
    pub Signer {}

    #[async_trait::async_trait]
    impl Signer for Signer {
        async fn sign(&self, tbs: &[u8], algorithm: SigningAlgorithm) -> Result<Vec<u8>, SignerError>;
    }
}

#[tokio::test]
async fn test_interval_point_issues_initial_crl() {
    let fixture = Fixture::new();
    let published = &fixture;
    fixture.revoke(11, Some(RevocationReason::KeyCompromise));
    let ca = CertificateAuthority::new(fixture.context());
    let config = IssuingPointConfig {
        auto_update_interval: 60,
        ..IssuingPointConfig::default()
    };
    let point = ca.add_issuing_point(ID, config).await.unwrap();

    assert!(eventually(|| async move { published.publication_count(ID, false).await == 1 }).await);
    assert_eq!(serials(&fixture.latest_full(ID).await), serial_list(&[11]));

    // The next update is an hour away
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fixture.publication_count(ID, false).await, 1);
    assert_eq!(point.crl_number().await, 1);
    ca.shutdown().await;
}

#[tokio::test]
async fn test_scheduled_update_runs_in_background() {
    let fixture = Fixture::new();
    let published = &fixture;
    let ca = CertificateAuthority::new(fixture.context());
    let point = ca.add_issuing_point(ID, manual_config()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fixture.publication_count(ID, false).await, 0);

    point
        .schedule_crl_update(Some("SHA512withRSA"))
        .await
        .unwrap();
    assert!(eventually(|| async move { published.publication_count(ID, false).await == 1 }).await);
    assert_eq!(point.crl_number().await, 1);
    ca.shutdown().await;
}

#[tokio::test]
async fn test_enabling_interval_updates_starts_issuing() {
    let fixture = Fixture::new();
    let published = &fixture;
    let ca = CertificateAuthority::new(fixture.context());
    ca.add_issuing_point(ID, manual_config()).await.unwrap();

    let pairs = [("enableCRLUpdates".to_string(), "true".to_string())]
        .into_iter()
        .collect();
    ca.update_issuing_point_config(ID, &pairs).await.unwrap();

    assert!(eventually(|| async move { published.publication_count(ID, false).await == 1 }).await);
    ca.shutdown().await;
}

#[tokio::test]
async fn test_repeated_failures_pause_automatic_updates() {
    let fixture = Fixture::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut signer = MockSigner::new();
    signer.expect_sign().returning(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(SignerError::Unavailable("token removed".to_string()))
    });

    let ca = CertificateAuthority::new(
        fixture.context_with(Arc::new(signer), fixture.publisher.clone()),
    );
    let config = IssuingPointConfig {
        auto_update_interval: 60,
        unexpected_exception_loop_max: 2,
        unexpected_exception_wait_time_secs: 0,
        ..IssuingPointConfig::default()
    };
    let point = ca.add_issuing_point(ID, config).await.unwrap();

    let attempts = calls.as_ref();
    assert!(eventually(|| async move { attempts.load(Ordering::SeqCst) == 2 }).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // A wake-up resumes the loop for another round of attempts
    point.schedule_crl_update(None).await.unwrap();
    assert!(eventually(|| async move { attempts.load(Ordering::SeqCst) == 4 }).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(point.crl_number().await, 0);
    ca.shutdown().await;
}
