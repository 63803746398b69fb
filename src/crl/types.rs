use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use x509_parser::num_bigint::BigUint;

/// Certificate serial number as unsigned big-endian bytes without leading zeros.
///
/// Serial numbers order numerically, so range filters and paginated scans
/// behave the same way regardless of how many bytes a serial occupies.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SerialNumber(Vec<u8>);

impl SerialNumber {
    pub fn from_bytes_be(bytes: &[u8]) -> Self {
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        let trimmed = &bytes[first..];
        if trimmed.is_empty() {
            Self(vec![0])
        } else {
            Self(trimmed.to_vec())
        }
    }

    pub fn as_bytes_be(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl From<u64> for SerialNumber {
    fn from(value: u64) -> Self {
        Self::from_bytes_be(&value.to_be_bytes())
    }
}

impl Ord for SerialNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for SerialNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerialNumber({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid serial number '{0}'")]
pub struct SerialParseError(pub String);

impl FromStr for SerialNumber {
    type Err = SerialParseError;

    /// Accepts `0x`-prefixed hexadecimal or plain decimal of any length.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || SerialParseError(s.to_string());

        if let Some(digits) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            if digits.is_empty() {
                return Err(invalid());
            }
            let padded = if digits.len() % 2 == 1 {
                format!("0{digits}")
            } else {
                digits.to_string()
            };
            let bytes = hex::decode(padded).map_err(|_| invalid())?;
            return Ok(Self::from_bytes_be(&bytes));
        }

        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let value = BigUint::parse_bytes(s.as_bytes(), 10).ok_or_else(invalid)?;
        Ok(Self::from_bytes_be(&value.to_bytes_be()))
    }
}

impl Serialize for SerialNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SerialNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Revocation reason codes from RFC 5280 section 5.3.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCrl,
    PrivilegeWithdrawn,
    AaCompromise,
}

impl RevocationReason {
    pub fn code(self) -> u8 {
        match self {
            Self::Unspecified => 0,
            Self::KeyCompromise => 1,
            Self::CaCompromise => 2,
            Self::AffiliationChanged => 3,
            Self::Superseded => 4,
            Self::CessationOfOperation => 5,
            Self::CertificateHold => 6,
            Self::RemoveFromCrl => 8,
            Self::PrivilegeWithdrawn => 9,
            Self::AaCompromise => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Unspecified,
            1 => Self::KeyCompromise,
            2 => Self::CaCompromise,
            3 => Self::AffiliationChanged,
            4 => Self::Superseded,
            5 => Self::CessationOfOperation,
            6 => Self::CertificateHold,
            8 => Self::RemoveFromCrl,
            9 => Self::PrivilegeWithdrawn,
            10 => Self::AaCompromise,
            _ => return None,
        })
    }
}

impl FromStr for RevocationReason {
    type Err = String;

    /// Parses the RFC 5280 ASN.1 identifiers, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "unspecified" => Self::Unspecified,
            "keycompromise" => Self::KeyCompromise,
            "cacompromise" => Self::CaCompromise,
            "affiliationchanged" => Self::AffiliationChanged,
            "superseded" => Self::Superseded,
            "cessationofoperation" => Self::CessationOfOperation,
            "certificatehold" => Self::CertificateHold,
            "removefromcrl" => Self::RemoveFromCrl,
            "privilegewithdrawn" => Self::PrivilegeWithdrawn,
            "aacompromise" => Self::AaCompromise,
            other => return Err(format!("unknown revocation reason '{other}'")),
        })
    }
}

/// One revoked certificate as it appears in a CRL.
///
/// Entries are values: an update replaces the whole entry. Unrevoke and
/// expiry markers reuse this type with [`RevocationReason::RemoveFromCrl`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedEntry {
    pub serial: SerialNumber,
    pub revoked_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RevocationReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidity_date: Option<DateTime<Utc>>,
}

impl RevokedEntry {
    pub fn new(serial: SerialNumber, revoked_on: DateTime<Utc>) -> Self {
        Self {
            serial,
            revoked_on: whole_seconds(revoked_on),
            reason: None,
            invalidity_date: None,
        }
    }

    pub fn with_reason(mut self, reason: RevocationReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_invalidity_date(mut self, date: DateTime<Utc>) -> Self {
        self.invalidity_date = Some(whole_seconds(date));
        self
    }

    /// Marker recorded when a listed certificate must leave the CRL.
    pub fn removal(serial: SerialNumber, at: DateTime<Utc>) -> Self {
        Self::new(serial, at).with_reason(RevocationReason::RemoveFromCrl)
    }
}

/// CRLs carry second precision, so every timestamp that ends up in one is
/// truncated before it is compared with a decoded value.
pub fn whole_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_nanosecond(0).unwrap_or(at)
}

pub type EntryMap = BTreeMap<SerialNumber, RevokedEntry>;

/// The three delta maps accumulated since the last full CRL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMaps {
    #[serde(default)]
    pub revoked: EntryMap,
    #[serde(default)]
    pub unrevoked: EntryMap,
    #[serde(default)]
    pub expired: EntryMap,
}

impl PendingMaps {
    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty() && self.unrevoked.is_empty() && self.expired.is_empty()
    }

    pub fn len(&self) -> usize {
        self.revoked.len() + self.unrevoked.len() + self.expired.len()
    }
}

/// Identifier of a revoke or unrevoke request; ids grow monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl RequestId {
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Crash-recovery checkpoint: the earliest revocation event that is not yet
/// reflected in the persisted pending maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstUnsaved {
    CleanCache,
    NewCache,
    Request(RequestId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitializationState {
    #[default]
    NotInitialized,
    Initialized,
    InitializationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatingState {
    #[default]
    Done,
    Started,
    PublishingStarted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_number_ordering_is_numeric() {
        let small = SerialNumber::from(0xffu64);
        let large = SerialNumber::from(0x0100u64);
        assert!(small < large);
        assert_eq!(
            SerialNumber::from_bytes_be(&[0, 0, 1]),
            SerialNumber::from(1u64)
        );
    }

    #[test]
    fn test_serial_number_parsing() {
        assert_eq!("0x01".parse::<SerialNumber>().unwrap(), SerialNumber::from(1u64));
        assert_eq!("0xabc".parse::<SerialNumber>().unwrap(), SerialNumber::from(0xabcu64));
        assert_eq!("4096".parse::<SerialNumber>().unwrap(), SerialNumber::from(4096u64));
        assert_eq!(
            "18446744073709551616".parse::<SerialNumber>().unwrap().as_bytes_be(),
            &[1, 0, 0, 0, 0, 0, 0, 0, 0]
        );
        assert!("12a".parse::<SerialNumber>().is_err());
        assert!("0x".parse::<SerialNumber>().is_err());
        assert!("".parse::<SerialNumber>().is_err());
    }

    #[test]
    fn test_large_decimal_serial_matches_hex() {
        let decimal: SerialNumber = "340282366920938463463374607431768211455".parse().unwrap();
        let hex: SerialNumber = "0xffffffffffffffffffffffffffffffff".parse().unwrap();
        assert_eq!(decimal, hex);
        assert_eq!(decimal.as_bytes_be().len(), 16);

        assert_eq!("0".parse::<SerialNumber>().unwrap().as_bytes_be(), &[0]);
        assert_eq!("007".parse::<SerialNumber>().unwrap(), SerialNumber::from(7u64));
        assert!("1_000".parse::<SerialNumber>().is_err());
        assert!("+5".parse::<SerialNumber>().is_err());
    }

    #[test]
    fn test_serial_number_as_json_map_key() {
        let mut maps = PendingMaps::default();
        let serial = SerialNumber::from(0x2au64);
        maps.revoked.insert(
            serial.clone(),
            RevokedEntry::new(serial, Utc::now()).with_reason(RevocationReason::KeyCompromise),
        );

        let json = serde_json::to_string(&maps).unwrap();
        assert!(json.contains("\"0x2a\""));
        let decoded: PendingMaps = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, maps);
    }

    #[test]
    fn test_reason_codes() {
        for code in [0u8, 1, 2, 3, 4, 5, 6, 8, 9, 10] {
            assert_eq!(RevocationReason::from_code(code).map(|r| r.code()), Some(code));
        }
        assert_eq!(RevocationReason::from_code(7), None);
        assert_eq!(
            "keyCompromise".parse::<RevocationReason>(),
            Ok(RevocationReason::KeyCompromise)
        );
    }
}
