#![allow(dead_code)]

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use ca_server::{
    ca::CaContext,
    crl::{
        ExtensionConfig, IssuingPointConfig, RevocationReason, RevokedEntry, SerialNumber,
        builder::decode_entries, default_extension_settings,
    },
    publish::{MemoryPublisher, Publisher},
    signer::{OpensslSigner, Signer},
    store::{
        CertRecord, CertStatus, MemoryCertificateStore, MemoryRecordStore, MemoryRequestStore,
        RecordStore, RevocationInfo,
    },
    telemetry,
};
use chrono::{Duration as ChronoDuration, Utc};
use der::{Decode, asn1::Uint};
use x509_cert::{crl::CertificateList, name::Name};
use x509_parser::prelude::{CertificateRevocationList, FromDer};

pub const DELTA_CRL_INDICATOR: &str = "2.5.29.27";

/// In-memory collaborators shared by an issuing point under test
pub struct Fixture {
    pub records: Arc<MemoryRecordStore>,
    pub certificates: Arc<MemoryCertificateStore>,
    pub requests: Arc<MemoryRequestStore>,
    pub publisher: Arc<MemoryPublisher>,
    pub signer: Arc<OpensslSigner>,
}

impl Fixture {
    pub fn new() -> Self {
        telemetry::init_test_tracing();
        Self {
            records: Arc::new(MemoryRecordStore::default()),
            certificates: Arc::new(MemoryCertificateStore::default()),
            requests: Arc::new(MemoryRequestStore::default()),
            publisher: Arc::new(MemoryPublisher::default()),
            signer: Arc::new(OpensslSigner::generate_rsa(2048).unwrap()),
        }
    }

    pub fn context(&self) -> CaContext {
        self.context_with(self.signer.clone(), self.publisher.clone())
    }

    pub fn context_with(&self, signer: Arc<dyn Signer>, publisher: Arc<dyn Publisher>) -> CaContext {
        self.context_with_records(self.records.clone(), signer, publisher)
    }

    pub fn context_with_records(
        &self,
        records: Arc<dyn RecordStore>,
        signer: Arc<dyn Signer>,
        publisher: Arc<dyn Publisher>,
    ) -> CaContext {
        CaContext {
            issuer: Name::from_str("CN=Test CA,O=Example").unwrap(),
            authority_key_id: Some(vec![0x01, 0x02, 0x03, 0x04]),
            extension_defaults: default_extension_settings(),
            records,
            certificates: self.certificates.clone(),
            requests: self.requests.clone(),
            signer,
            publisher,
        }
    }

    /// Adds a valid end-entity certificate to the repository.
    pub fn issue(&self, serial: u64) -> SerialNumber {
        let serial = SerialNumber::from(serial);
        self.certificates.insert(CertRecord {
            serial: serial.clone(),
            status: CertStatus::Valid,
            is_ca: false,
            profile_id: Some("caUserCert".to_string()),
            not_after: Utc::now() + ChronoDuration::days(365),
            revocation: None,
        });
        serial
    }

    /// Revokes a certificate in the repository and returns its CRL entry.
    pub fn revoke(&self, serial: u64, reason: Option<RevocationReason>) -> RevokedEntry {
        let serial = self.issue(serial);
        let revoked_on = Utc::now();
        self.certificates.revoke(
            &serial,
            RevocationInfo {
                revoked_on,
                reason,
                invalidity_date: None,
            },
        );
        let entry = RevokedEntry::new(serial, revoked_on);
        match reason {
            Some(reason) => entry.with_reason(reason),
            None => entry,
        }
    }

    pub fn unrevoke(&self, serial: u64) -> SerialNumber {
        let serial = SerialNumber::from(serial);
        self.certificates.unrevoke(&serial);
        serial
    }

    pub async fn latest_full(&self, id: &str) -> Vec<u8> {
        self.publisher.latest(id, false).await.unwrap().crl
    }

    pub async fn latest_delta(&self, id: &str) -> Vec<u8> {
        self.publisher.latest(id, true).await.unwrap().crl
    }

    pub async fn publication_count(&self, id: &str, delta: bool) -> usize {
        self.publisher
            .publications()
            .await
            .iter()
            .filter(|p| p.issuing_point == id && p.delta == delta)
            .count()
    }
}

/// Issuing point that only updates on request.
pub fn manual_config() -> IssuingPointConfig {
    IssuingPointConfig {
        enable_crl_updates: false,
        ..IssuingPointConfig::default()
    }
}

/// Manual issuing point issuing delta CRLs with `schema` cycles per full CRL.
pub fn delta_config(schema: u32) -> IssuingPointConfig {
    let mut extensions = BTreeMap::new();
    extensions.insert(
        "DeltaCRLIndicator".to_string(),
        ExtensionConfig {
            enable: Some(true),
            ..ExtensionConfig::default()
        },
    );
    IssuingPointConfig {
        update_schema: schema,
        extensions,
        ..manual_config()
    }
}

pub fn serials(der: &[u8]) -> Vec<SerialNumber> {
    decode_entries(der).unwrap().into_keys().collect()
}

pub fn serial_list(values: &[u64]) -> Vec<SerialNumber> {
    values.iter().map(|v| SerialNumber::from(*v)).collect()
}

pub fn crl_number(der: &[u8]) -> u64 {
    let (_, crl) = CertificateRevocationList::from_der(der).unwrap();
    crl.crl_number().unwrap().to_string().parse().unwrap()
}

/// The base CRL number of a delta CRL, `None` for a full CRL.
pub fn delta_base(der: &[u8]) -> Option<u64> {
    let crl = CertificateList::from_der(der).unwrap();
    let extensions = crl.tbs_cert_list.crl_extensions.unwrap_or_default();
    let indicator = extensions
        .iter()
        .find(|ext| ext.extn_id.to_string() == DELTA_CRL_INDICATOR)?;
    let base = Uint::from_der(indicator.extn_value.as_bytes()).unwrap();
    Some(
        base.as_bytes()
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
    )
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
