use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crl::types::{
    FirstUnsaved, PendingMaps, RequestId, RevocationReason, RevokedEntry, SerialNumber,
};

/// Persisted state of one issuing point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuingPointRecord {
    pub id: String,
    pub crl_number: u64,
    /// Entry count of the stored full CRL, `-1` when none was issued.
    pub crl_size: i64,
    #[serde(default)]
    pub this_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delta_crl_number: u64,
    #[serde(default = "unset_size")]
    pub delta_crl_size: i64,
    #[serde(default)]
    pub delta_next_update: Option<DateTime<Utc>>,
    #[serde(default, with = "base64_der")]
    pub crl: Option<Vec<u8>>,
    #[serde(default, with = "base64_der")]
    pub delta_crl: Option<Vec<u8>>,
    #[serde(default)]
    pub pending: PendingMaps,
    #[serde(default)]
    pub first_unsaved: Option<FirstUnsaved>,
}

fn unset_size() -> i64 {
    -1
}

impl IssuingPointRecord {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            crl_number: 0,
            crl_size: -1,
            this_update: None,
            next_update: None,
            delta_crl_number: 0,
            delta_crl_size: -1,
            delta_next_update: None,
            crl: None,
            delta_crl: None,
            pending: PendingMaps::default(),
            first_unsaved: Some(FirstUnsaved::NewCache),
        }
    }

    pub fn apply_full(&mut self, update: &FullCrlUpdate) {
        self.crl = Some(update.crl.clone());
        self.crl_number = update.crl_number;
        self.crl_size = update.crl_size;
        self.this_update = Some(update.this_update);
        self.next_update = update.next_update;
        if let Some(pending) = &update.pending {
            self.pending = pending.clone();
        }
    }

    pub fn apply_delta(&mut self, update: &DeltaCrlUpdate) {
        self.delta_crl = Some(update.crl.clone());
        self.delta_crl_number = update.delta_crl_number;
        self.delta_crl_size = update.delta_crl_size;
        self.delta_next_update = update.next_update;
    }
}

/// Store update written after a full CRL was issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullCrlUpdate {
    pub crl: Vec<u8>,
    pub crl_number: u64,
    pub crl_size: i64,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    /// Pending maps remaining after the fold; `None` leaves them untouched.
    pub pending: Option<PendingMaps>,
}

/// Store update written after a delta CRL was issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaCrlUpdate {
    pub crl: Vec<u8>,
    pub delta_crl_number: u64,
    pub delta_crl_size: i64,
    pub next_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertStatus {
    Valid,
    Revoked,
    RevokedExpired,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationInfo {
    pub revoked_on: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<RevocationReason>,
    #[serde(default)]
    pub invalidity_date: Option<DateTime<Utc>>,
}

/// Certificate repository record, reduced to what CRL issuance needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertRecord {
    pub serial: SerialNumber,
    pub status: CertStatus,
    pub is_ca: bool,
    pub profile_id: Option<String>,
    pub not_after: DateTime<Utc>,
    pub revocation: Option<RevocationInfo>,
}

impl CertRecord {
    /// The CRL entry for this certificate, if it carries revocation data.
    pub fn revoked_entry(&self) -> Option<RevokedEntry> {
        let info = self.revocation.as_ref()?;
        let mut entry = RevokedEntry::new(self.serial.clone(), info.revoked_on);
        entry.reason = info.reason;
        if let Some(date) = info.invalidity_date {
            entry = entry.with_invalidity_date(date);
        }
        Some(entry)
    }
}

/// Inclusive serial number bounds; an open side is unbounded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerialRange {
    pub begin: Option<SerialNumber>,
    pub end: Option<SerialNumber>,
}

impl SerialRange {
    pub fn contains(&self, serial: &SerialNumber) -> bool {
        self.begin.as_ref().is_none_or(|begin| serial >= begin)
            && self.end.as_ref().is_none_or(|end| serial <= end)
    }
}

/// Selects the certificates a full rebuild lists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokedCertFilter {
    pub statuses: Vec<CertStatus>,
    pub ca_only: bool,
    pub profiles: Option<Vec<String>>,
    pub serial_range: SerialRange,
}

impl RevokedCertFilter {
    pub fn matches(&self, record: &CertRecord) -> bool {
        self.statuses.contains(&record.status)
            && (!self.ca_only || record.is_ca)
            && self.profiles.as_ref().is_none_or(|profiles| {
                record
                    .profile_id
                    .as_ref()
                    .is_some_and(|profile| profiles.contains(profile))
            })
            && self.serial_range.contains(&record.serial)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestKind {
    Revoke { entries: Vec<RevokedEntry> },
    Unrevoke { serials: Vec<SerialNumber> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    pub completed_on: DateTime<Utc>,
}

mod base64_der {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|encoded| STANDARD.decode(encoded).map_err(de::Error::custom))
            .transpose()
    }
}
