use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use der::Encode;
use der::asn1::{BitString, GeneralizedTime, UtcTime};
use tracing::debug;
use x509_cert::Version;
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber as X509SerialNumber;
use x509_cert::time::Time;
use x509_parser::prelude::{ASN1Time, CertificateRevocationList, FromDer, ParsedExtension};

use super::errors::{CrlError, CrlResult};
use super::extensions::ExtensionRegistry;
use super::types::{EntryMap, RevocationReason, RevokedEntry, SerialNumber};
use crate::signer::{Signer, SigningAlgorithm};

/// Content of one CRL before signing
pub struct CrlContent<'a> {
    pub issuer: &'a Name,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    pub entries: &'a EntryMap,
    pub crl_number: u64,
    /// Set for delta CRLs: the number of the full CRL they extend.
    pub base_crl_number: Option<u64>,
}

fn x509_time(at: DateTime<Utc>) -> CrlResult<Time> {
    let secs = u64::try_from(at.timestamp())
        .map_err(|_| CrlError::Encoding(format!("time {at} predates 1970")))?;
    let since_epoch = StdDuration::from_secs(secs);
    // UTCTime covers 1950 through 2049; later dates need GeneralizedTime.
    match UtcTime::from_unix_duration(since_epoch) {
        Ok(utc) => Ok(Time::UtcTime(utc)),
        Err(_) => Ok(Time::GeneralTime(GeneralizedTime::from_unix_duration(
            since_epoch,
        )?)),
    }
}

fn revoked_cert(entry: &RevokedEntry, registry: &ExtensionRegistry) -> CrlResult<RevokedCert> {
    Ok(RevokedCert {
        serial_number: X509SerialNumber::new(entry.serial.as_bytes_be())?,
        revocation_date: x509_time(entry.revoked_on)?,
        crl_entry_extensions: registry.entry_extensions(entry)?,
    })
}

/// Assembles the TBSCertList for `content`.
pub fn tbs_cert_list(
    content: &CrlContent<'_>,
    registry: &ExtensionRegistry,
    algorithm: SigningAlgorithm,
) -> CrlResult<TbsCertList> {
    let revoked = content
        .entries
        .values()
        .map(|entry| revoked_cert(entry, registry))
        .collect::<CrlResult<Vec<_>>>()?;
    let extensions = registry.crl_extensions(content.crl_number, content.base_crl_number)?;

    Ok(TbsCertList {
        version: Version::V2,
        signature: algorithm.algorithm_identifier()?,
        issuer: content.issuer.clone(),
        this_update: x509_time(content.this_update)?,
        next_update: content.next_update.map(x509_time).transpose()?,
        revoked_certificates: (!revoked.is_empty()).then_some(revoked),
        crl_extensions: (!extensions.is_empty()).then_some(extensions),
    })
}

/// Encodes, signs and returns the DER CRL.
pub async fn sign_crl(
    tbs: TbsCertList,
    signer: &dyn Signer,
    algorithm: SigningAlgorithm,
) -> CrlResult<Vec<u8>> {
    let tbs_der = tbs.to_der()?;
    let signature = signer.sign(&tbs_der, algorithm).await?;
    let crl = CertificateList {
        tbs_cert_list: tbs,
        signature_algorithm: algorithm.algorithm_identifier()?,
        signature: BitString::from_bytes(&signature)?,
    };
    let der = crl.to_der()?;
    debug!("Signed CRL with {} ({} bytes)", algorithm, der.len());
    Ok(der)
}

/// Builds and signs a CRL.
pub async fn build_crl(
    content: &CrlContent<'_>,
    registry: &ExtensionRegistry,
    signer: &dyn Signer,
    algorithm: SigningAlgorithm,
) -> CrlResult<Vec<u8>> {
    let tbs = tbs_cert_list(content, registry, algorithm)?;
    sign_crl(tbs, signer, algorithm).await
}

fn from_asn1_time(time: ASN1Time) -> CrlResult<DateTime<Utc>> {
    DateTime::from_timestamp(time.timestamp(), 0)
        .ok_or_else(|| CrlError::Encoding(format!("time {time} out of range")))
}

/// Decodes the revoked entries of a stored CRL.
pub fn decode_entries(der: &[u8]) -> CrlResult<EntryMap> {
    let (_, crl) = CertificateRevocationList::from_der(der)
        .map_err(|e| CrlError::Encoding(format!("failed to parse stored CRL: {e}")))?;

    let mut entries = EntryMap::new();
    for revoked in crl.iter_revoked_certificates() {
        let serial = SerialNumber::from_bytes_be(revoked.raw_serial());
        let mut entry = RevokedEntry::new(serial.clone(), from_asn1_time(revoked.revocation_date)?);
        if let Some((_, code)) = revoked.reason_code() {
            entry.reason = RevocationReason::from_code(code.0);
        }
        for extension in revoked.extensions() {
            if let ParsedExtension::InvalidityDate(date) = extension.parsed_extension() {
                entry.invalidity_date = Some(from_asn1_time(*date)?);
            }
        }
        entries.insert(serial, entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crl::extensions::default_extension_settings;
    use crate::signer::OpensslSigner;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::str::FromStr;

    fn registry() -> ExtensionRegistry {
        ExtensionRegistry::new(
            "MasterCRL",
            &BTreeMap::new(),
            &default_extension_settings(),
            None,
        )
    }

    #[test]
    fn test_time_encoding_switches_after_2049() {
        let early = Utc.with_ymd_and_hms(2049, 12, 31, 23, 59, 59).unwrap();
        assert!(matches!(x509_time(early).unwrap(), Time::UtcTime(_)));
        let late = Utc.with_ymd_and_hms(2050, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(x509_time(late).unwrap(), Time::GeneralTime(_)));
    }

    #[tokio::test]
    async fn test_build_and_decode_crl() {
        let signer = OpensslSigner::generate_rsa(2048).unwrap();
        let issuer = Name::from_str("CN=Test CA,O=Example").unwrap();
        let revoked_on = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let mut entries = EntryMap::new();
        for (serial, reason) in [
            (1u64, RevocationReason::KeyCompromise),
            (0x80, RevocationReason::Superseded),
        ] {
            let serial = SerialNumber::from(serial);
            entries.insert(
                serial.clone(),
                RevokedEntry::new(serial, revoked_on)
                    .with_reason(reason)
                    .with_invalidity_date(revoked_on),
            );
        }

        let this_update = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        let content = CrlContent {
            issuer: &issuer,
            this_update,
            next_update: Some(this_update + chrono::Duration::hours(4)),
            entries: &entries,
            crl_number: 12,
            base_crl_number: None,
        };
        let der = build_crl(&content, &registry(), &signer, SigningAlgorithm::Sha256WithRsa)
            .await
            .unwrap();

        let (_, crl) = CertificateRevocationList::from_der(&der).unwrap();
        assert_eq!(crl.crl_number().unwrap().to_string(), "12");
        assert_eq!(crl.last_update().timestamp(), this_update.timestamp());
        assert_eq!(crl.iter_revoked_certificates().count(), 2);

        let decoded = decode_entries(&der).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_entries(&[0x30, 0x03, 0x01]),
            Err(CrlError::Encoding(_))
        ));
    }
}
