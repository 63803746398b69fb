mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use ca_server::crl::{
    ExtensionConfig, IssuingPoint, IssuingPointConfig, RevocationReason, SerialNumber,
    builder::decode_entries,
};
use chrono::{Duration, Utc};
use common::{
    Fixture, crl_number, delta_base, delta_config, manual_config, serial_list, serials,
};
use x509_parser::prelude::{CertificateRevocationList, FromDer, SubjectPublicKeyInfo};

const ID: &str = "MasterCRL";

async fn open(fixture: &Fixture, config: IssuingPointConfig) -> Arc<IssuingPoint> {
    IssuingPoint::open(ID, config, Arc::new(fixture.context())).await
}

#[tokio::test]
async fn test_crl_lists_net_revocations() {
    let fixture = Fixture::new();
    let point = open(&fixture, manual_config()).await;

    for serial in [1, 2, 3] {
        let entry = fixture.revoke(serial, Some(RevocationReason::KeyCompromise));
        point.add_revoked_cert(entry, None).await.unwrap();
    }
    let unrevoked = fixture.unrevoke(2);
    point
        .add_unrevoked_cert(&unrevoked, Utc::now(), None)
        .await
        .unwrap();

    point.update_crl_now(None).await.unwrap();
    let der = fixture.latest_full(ID).await;
    assert_eq!(serials(&der), serial_list(&[1, 3]));
    assert_eq!(crl_number(&der), 1);

    // Built from the cache this time
    let entry = fixture.revoke(4, Some(RevocationReason::Superseded));
    point.add_revoked_cert(entry, None).await.unwrap();
    point.update_crl_now(None).await.unwrap();

    let der = fixture.latest_full(ID).await;
    assert_eq!(serials(&der), serial_list(&[1, 3, 4]));
    assert_eq!(crl_number(&der), 2);
    let status = point.status().await;
    assert_eq!(point.crl_size().await, 3);
    assert_eq!(status.last_crl_number, 1);
    assert!(point.pending_changes().await.is_empty());
}

#[tokio::test]
async fn test_crl_numbers_increase_and_updates_are_idempotent() {
    let fixture = Fixture::new();
    let point = open(&fixture, manual_config()).await;
    fixture.revoke(9, Some(RevocationReason::KeyCompromise));

    let mut previous = None;
    for expected in 1..=3u64 {
        point.update_crl_now(None).await.unwrap();
        let der = fixture.latest_full(ID).await;
        assert_eq!(crl_number(&der), expected);
        assert_eq!(point.crl_number().await, expected);

        let entries = decode_entries(&der).unwrap();
        if let Some(previous) = &previous {
            assert_eq!(&entries, previous);
        }
        previous = Some(entries);
    }

    let status = point.status().await;
    assert!(status.delta_crl_number <= status.crl_number);
    assert!(status.crl_number < status.next_crl_number);
}

#[tokio::test]
async fn test_crl_signature_and_extensions() {
    let fixture = Fixture::new();
    let point = open(&fixture, manual_config()).await;
    let entry = fixture.revoke(0x1234, Some(RevocationReason::CaCompromise));
    point.add_revoked_cert(entry, None).await.unwrap();
    point.update_crl_now(Some("SHA384withRSA")).await.unwrap();

    let der = fixture.latest_full(ID).await;
    let (_, crl) = CertificateRevocationList::from_der(&der).unwrap();
    let spki_der = fixture.signer.public_key_der().unwrap();
    let (_, spki) = SubjectPublicKeyInfo::from_der(&spki_der).unwrap();
    assert!(crl.verify_signature(&spki).is_ok());
    assert_eq!(
        crl.signature_algorithm.algorithm.to_id_string(),
        "1.2.840.113549.1.1.12"
    );
    assert!(delta_base(&der).is_none());

    let revoked: Vec<_> = crl.iter_revoked_certificates().collect();
    assert_eq!(revoked.len(), 1);
    let (_, reason) = revoked[0].reason_code().unwrap();
    assert_eq!(reason.0, RevocationReason::CaCompromise.code());
}

#[tokio::test]
async fn test_unknown_algorithm_is_rejected() {
    let fixture = Fixture::new();
    let point = open(&fixture, manual_config()).await;
    assert!(point.update_crl_now(Some("MD5withRSA")).await.is_err());
    assert_eq!(point.crl_number().await, 0);
}

#[tokio::test]
async fn test_delta_schema_cycle() {
    let fixture = Fixture::new();
    let point = open(&fixture, delta_config(4)).await;
    assert!(point.is_delta_crl_enabled().await);

    let entry = fixture.revoke(1, Some(RevocationReason::KeyCompromise));
    point.add_revoked_cert(entry, None).await.unwrap();
    point.update_crl_now(None).await.unwrap();
    assert_eq!(fixture.publication_count(ID, false).await, 1);
    assert_eq!(fixture.publication_count(ID, true).await, 0);

    let entry = fixture.revoke(5, Some(RevocationReason::Superseded));
    point.add_revoked_cert(entry, None).await.unwrap();

    for expected in 2..=4u64 {
        point.update_crl_now(None).await.unwrap();
        let delta = fixture.latest_delta(ID).await;
        assert_eq!(crl_number(&delta), expected);
        assert_eq!(delta_base(&delta), Some(1));
        assert_eq!(serials(&delta), serial_list(&[5]));
    }
    assert_eq!(fixture.publication_count(ID, false).await, 1);
    assert_eq!(fixture.publication_count(ID, true).await, 3);

    let status = point.status().await;
    assert_eq!(status.schema_counter, 0);
    assert_eq!(status.crl_number, 1);
    assert_eq!(status.delta_crl_number, 4);
    assert_eq!(status.delta_crl_size, 1);

    // Full and delta of the same cycle share a number
    point.update_crl_now(None).await.unwrap();
    let full = fixture.latest_full(ID).await;
    let delta = fixture.latest_delta(ID).await;
    assert_eq!(crl_number(&full), 5);
    assert_eq!(crl_number(&delta), 5);
    assert_eq!(delta_base(&delta), Some(1));
    assert_eq!(serials(&full), serial_list(&[1, 5]));

    let status = point.status().await;
    assert_eq!(status.crl_number, 5);
    assert_eq!(status.delta_crl_number, 5);
    assert_eq!(status.next_delta_crl_number, 6);
}

#[tokio::test]
async fn test_delta_marks_removals() {
    let fixture = Fixture::new();
    let point = open(&fixture, delta_config(2)).await;
    for serial in [1, 2] {
        let entry = fixture.revoke(serial, Some(RevocationReason::CertificateHold));
        point.add_revoked_cert(entry, None).await.unwrap();
    }
    point.update_crl_now(None).await.unwrap();

    let released = fixture.unrevoke(1);
    point
        .add_unrevoked_cert(&released, Utc::now(), None)
        .await
        .unwrap();
    point.update_crl_now(None).await.unwrap();

    let delta = decode_entries(&fixture.latest_delta(ID).await).unwrap();
    assert_eq!(delta.len(), 1);
    assert_eq!(
        delta[&SerialNumber::from(1)].reason,
        Some(RevocationReason::RemoveFromCrl)
    );
}

#[tokio::test]
async fn test_reason_filter_limits_entries() {
    let fixture = Fixture::new();
    let mut extensions = BTreeMap::new();
    extensions.insert(
        "IssuingDistributionPoint".to_string(),
        ExtensionConfig {
            enable: Some(true),
            only_some_reasons: Some("keyCompromise".to_string()),
            ..ExtensionConfig::default()
        },
    );
    let config = IssuingPointConfig {
        extensions,
        ..manual_config()
    };
    let point = open(&fixture, config).await;

    fixture.revoke(1, Some(RevocationReason::KeyCompromise));
    fixture.revoke(2, Some(RevocationReason::Superseded));
    fixture.revoke(3, None);
    point.update_crl_now(None).await.unwrap();
    assert_eq!(serials(&fixture.latest_full(ID).await), serial_list(&[1]));

    for (serial, reason) in [
        (4, Some(RevocationReason::KeyCompromise)),
        (5, Some(RevocationReason::AffiliationChanged)),
        (6, Some(RevocationReason::Unspecified)),
    ] {
        let entry = fixture.revoke(serial, reason);
        point.add_revoked_cert(entry, None).await.unwrap();
    }
    point.update_crl_now(None).await.unwrap();
    assert_eq!(serials(&fixture.latest_full(ID).await), serial_list(&[1, 4]));
}

#[tokio::test]
async fn test_ca_only_point_skips_end_entities() {
    let fixture = Fixture::new();
    let config = IssuingPointConfig {
        ca_certs_only: true,
        ..manual_config()
    };
    let point = open(&fixture, config).await;
    let entry = fixture.revoke(1, Some(RevocationReason::KeyCompromise));
    point.add_revoked_cert(entry, None).await.unwrap();
    assert!(point.pending_changes().await.is_empty());

    point.update_crl_now(None).await.unwrap();
    assert!(serials(&fixture.latest_full(ID).await).is_empty());
}

#[tokio::test]
async fn test_no_crl_without_revoked_certificates() {
    let fixture = Fixture::new();
    let config = IssuingPointConfig {
        no_crl_if_no_revoked_cert: true,
        ..manual_config()
    };
    let point = open(&fixture, config).await;
    point.update_crl_now(None).await.unwrap();

    assert_eq!(fixture.publication_count(ID, false).await, 0);
    let status = point.status().await;
    assert_eq!(status.crl_number, 0);
    assert_eq!(status.crl_size, 0);
}

#[tokio::test]
async fn test_interval_sets_next_update() {
    let fixture = Fixture::new();
    let config = IssuingPointConfig {
        auto_update_interval: 60,
        ..IssuingPointConfig::default()
    };
    let point = open(&fixture, config).await;
    point.update_crl_now(None).await.unwrap();

    let status = point.status().await;
    let last_update = status.last_update.unwrap();
    assert_eq!(status.next_update, Some(last_update + Duration::minutes(60)));

    let der = fixture.latest_full(ID).await;
    let (_, crl) = CertificateRevocationList::from_der(&der).unwrap();
    let next_update = crl.next_update().unwrap();
    assert_eq!(next_update.timestamp(), (last_update + Duration::minutes(60)).timestamp());
}

#[tokio::test]
async fn test_cache_disabled_always_rebuilds() {
    let fixture = Fixture::new();
    let config = IssuingPointConfig {
        enable_crl_cache: false,
        ..manual_config()
    };
    let point = open(&fixture, config).await;
    fixture.revoke(1, Some(RevocationReason::KeyCompromise));
    point.update_crl_now(None).await.unwrap();
    assert_eq!(serials(&fixture.latest_full(ID).await), serial_list(&[1]));

    fixture.revoke(2, Some(RevocationReason::KeyCompromise));
    point.update_crl_now(None).await.unwrap();
    assert_eq!(serials(&fixture.latest_full(ID).await), serial_list(&[1, 2]));
    assert!(!point.is_delta_crl_enabled().await);
}
