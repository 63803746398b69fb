use der::Encode;
use der::asn1::{GeneralizedTime, Ia5String, ObjectIdentifier, OctetString};
use std::fmt;
use std::time::Duration as StdDuration;
use x509_cert::ext::Extension;
use x509_cert::ext::pkix::AuthorityKeyIdentifier;
use x509_cert::ext::pkix::crl::dp::{DistributionPoint, IssuingDistributionPoint, ReasonFlags};
use x509_cert::ext::pkix::name::{DistributionPointName, GeneralName};

use crate::crl::errors::{CrlError, CrlResult};
use crate::crl::types::RevokedEntry;

pub const AUTHORITY_KEY_IDENTIFIER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.35");
pub const CRL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.20");
pub const DELTA_CRL_INDICATOR: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.27");
pub const ISSUING_DISTRIBUTION_POINT: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.28");
pub const FRESHEST_CRL: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.46");
pub const CRL_REASON: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.21");
pub const INVALIDITY_DATE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.24");

/// What an extension is being generated for
#[derive(Debug, Clone, Copy)]
pub enum ExtensionContext<'a> {
    Crl {
        crl_number: u64,
        /// Number of the full CRL a delta CRL is based on.
        base_crl_number: Option<u64>,
    },
    Entry(&'a RevokedEntry),
}

/// Builds the encoded value of one extension. Returning `None` omits it.
pub trait ExtensionGenerator: Send + Sync + fmt::Debug {
    fn generate(&self, ctx: &ExtensionContext<'_>, critical: bool) -> CrlResult<Option<Extension>>;
}

pub(crate) fn extension(
    extn_id: ObjectIdentifier,
    critical: bool,
    value: Vec<u8>,
) -> CrlResult<Extension> {
    Ok(Extension {
        extn_id,
        critical,
        extn_value: OctetString::new(value)?,
    })
}

fn uri_name(uri: &str) -> CrlResult<GeneralName> {
    let uri = Ia5String::new(uri)
        .map_err(|e| CrlError::Config(format!("invalid distribution point URI '{uri}': {e}")))?;
    Ok(GeneralName::UniformResourceIdentifier(uri))
}

#[derive(Debug)]
pub struct AuthorityKeyIdentifierGenerator {
    value: Option<Vec<u8>>,
}

impl AuthorityKeyIdentifierGenerator {
    pub fn new(key_id: Option<&[u8]>) -> CrlResult<Self> {
        let value = match key_id {
            Some(id) => Some(
                AuthorityKeyIdentifier {
                    key_identifier: Some(OctetString::new(id)?),
                    authority_cert_issuer: None,
                    authority_cert_serial_number: None,
                }
                .to_der()?,
            ),
            None => None,
        };
        Ok(Self { value })
    }
}

impl ExtensionGenerator for AuthorityKeyIdentifierGenerator {
    fn generate(&self, ctx: &ExtensionContext<'_>, critical: bool) -> CrlResult<Option<Extension>> {
        match (ctx, &self.value) {
            (ExtensionContext::Crl { .. }, Some(value)) => Ok(Some(extension(
                AUTHORITY_KEY_IDENTIFIER,
                critical,
                value.clone(),
            )?)),
            _ => Ok(None),
        }
    }
}

#[derive(Debug)]
pub struct CrlNumberGenerator;

impl ExtensionGenerator for CrlNumberGenerator {
    fn generate(&self, ctx: &ExtensionContext<'_>, critical: bool) -> CrlResult<Option<Extension>> {
        match ctx {
            ExtensionContext::Crl { crl_number, .. } => Ok(Some(extension(
                CRL_NUMBER,
                critical,
                crl_number.to_der()?,
            )?)),
            ExtensionContext::Entry(_) => Ok(None),
        }
    }
}

#[derive(Debug)]
pub struct DeltaCrlIndicatorGenerator;

impl ExtensionGenerator for DeltaCrlIndicatorGenerator {
    fn generate(&self, ctx: &ExtensionContext<'_>, critical: bool) -> CrlResult<Option<Extension>> {
        match ctx {
            ExtensionContext::Crl {
                base_crl_number: Some(base),
                ..
            } => Ok(Some(extension(DELTA_CRL_INDICATOR, critical, base.to_der()?)?)),
            _ => Ok(None),
        }
    }
}

/// Settings of the IssuingDistributionPoint extension
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionPointSettings {
    pub point_name: Option<String>,
    pub only_contains_user_certs: bool,
    pub only_contains_ca_certs: bool,
    pub only_some_reasons: Option<ReasonFlags>,
    pub indirect_crl: bool,
}

#[derive(Debug)]
pub struct IssuingDistributionPointGenerator {
    value: Vec<u8>,
}

impl IssuingDistributionPointGenerator {
    pub fn new(settings: &DistributionPointSettings) -> CrlResult<Self> {
        let distribution_point = settings
            .point_name
            .as_deref()
            .map(|uri| Ok::<_, CrlError>(DistributionPointName::FullName(vec![uri_name(uri)?])))
            .transpose()?;
        let idp = IssuingDistributionPoint {
            distribution_point,
            only_contains_user_certs: settings.only_contains_user_certs,
            only_contains_ca_certs: settings.only_contains_ca_certs,
            only_some_reasons: settings.only_some_reasons.filter(|flags| !flags.is_empty()),
            indirect_crl: settings.indirect_crl,
            only_contains_attribute_certs: false,
        };
        Ok(Self {
            value: idp.to_der()?,
        })
    }
}

impl ExtensionGenerator for IssuingDistributionPointGenerator {
    fn generate(&self, ctx: &ExtensionContext<'_>, critical: bool) -> CrlResult<Option<Extension>> {
        match ctx {
            ExtensionContext::Crl { .. } => Ok(Some(extension(
                ISSUING_DISTRIBUTION_POINT,
                critical,
                self.value.clone(),
            )?)),
            ExtensionContext::Entry(_) => Ok(None),
        }
    }
}

#[derive(Debug)]
pub struct FreshestCrlGenerator {
    value: Option<Vec<u8>>,
}

impl FreshestCrlGenerator {
    pub fn new(point_name: Option<&str>) -> CrlResult<Self> {
        let value = match point_name {
            Some(uri) => {
                let points = vec![DistributionPoint {
                    distribution_point: Some(DistributionPointName::FullName(vec![uri_name(uri)?])),
                    reasons: None,
                    crl_issuer: None,
                }];
                Some(points.to_der()?)
            }
            None => None,
        };
        Ok(Self { value })
    }
}

impl ExtensionGenerator for FreshestCrlGenerator {
    fn generate(&self, ctx: &ExtensionContext<'_>, critical: bool) -> CrlResult<Option<Extension>> {
        match (ctx, &self.value) {
            (ExtensionContext::Crl { .. }, Some(value)) => {
                Ok(Some(extension(FRESHEST_CRL, critical, value.clone())?))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug)]
pub struct CrlReasonGenerator;

impl ExtensionGenerator for CrlReasonGenerator {
    fn generate(&self, ctx: &ExtensionContext<'_>, critical: bool) -> CrlResult<Option<Extension>> {
        match ctx {
            ExtensionContext::Entry(RevokedEntry {
                reason: Some(reason),
                ..
            }) => {
                // ENUMERATED, one content octet
                let value = vec![0x0a, 0x01, reason.code()];
                Ok(Some(extension(CRL_REASON, critical, value)?))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug)]
pub struct InvalidityDateGenerator;

impl ExtensionGenerator for InvalidityDateGenerator {
    fn generate(&self, ctx: &ExtensionContext<'_>, critical: bool) -> CrlResult<Option<Extension>> {
        let ExtensionContext::Entry(RevokedEntry {
            invalidity_date: Some(date),
            ..
        }) = ctx
        else {
            return Ok(None);
        };
        let secs = u64::try_from(date.timestamp())
            .map_err(|_| CrlError::Encoding(format!("invalidity date {date} predates 1970")))?;
        let time = GeneralizedTime::from_unix_duration(StdDuration::from_secs(secs))?;
        Ok(Some(extension(INVALIDITY_DATE, critical, time.to_der()?)?))
    }
}
