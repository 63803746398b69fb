use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

use crate::crl::types::{FirstUnsaved, PendingMaps, RequestId, SerialNumber, whole_seconds};
use crate::store::{
    CertRecord, CertStatus, CertificateStore, CompletedRequest, DeltaCrlUpdate, FullCrlUpdate,
    IssuingPointRecord, RecordStore, RequestKind, RequestStore, Result, RevocationInfo,
    RevokedCertFilter, StoreError,
};

/// An in-memory issuing point record store.
///
/// Useful for testing and development.
#[derive(Debug, Default, Clone)]
pub struct MemoryRecordStore {
    records: Arc<DashMap<String, IssuingPointRecord>>,
}

impl MemoryRecordStore {
    /// Returns a copy of the stored record.
    pub fn get(&self, id: &str) -> Option<IssuingPointRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    fn modify(&self, id: &str, f: impl FnOnce(&mut IssuingPointRecord)) -> Result<()> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::msg(format!("no record for issuing point {id}")))?;
        f(record.value_mut());
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn read_record(&self, id: &str) -> Result<Option<IssuingPointRecord>> {
        Ok(self.get(id))
    }

    async fn write_new_record(&self, record: &IssuingPointRecord) -> Result<()> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_full_crl(&self, id: &str, update: &FullCrlUpdate) -> Result<()> {
        self.modify(id, |record| record.apply_full(update))
    }

    async fn update_delta_crl(&self, id: &str, update: &DeltaCrlUpdate) -> Result<()> {
        self.modify(id, |record| record.apply_delta(update))
    }

    async fn update_pending_maps(&self, id: &str, maps: &PendingMaps) -> Result<()> {
        self.modify(id, |record| record.pending = maps.clone())
    }

    async fn update_first_unsaved(&self, id: &str, marker: FirstUnsaved) -> Result<()> {
        self.modify(id, |record| record.first_unsaved = Some(marker))
    }

    async fn delete_record(&self, id: &str) -> Result<()> {
        self.records.remove(id);
        Ok(())
    }
}

/// An in-memory certificate repository.
#[derive(Debug, Default, Clone)]
pub struct MemoryCertificateStore {
    certs: Arc<DashMap<SerialNumber, CertRecord>>,
}

impl MemoryCertificateStore {
    pub fn insert(&self, record: CertRecord) {
        self.certs.insert(record.serial.clone(), record);
    }

    /// Marks a certificate revoked, returning false if it is unknown.
    pub fn revoke(&self, serial: &SerialNumber, info: RevocationInfo) -> bool {
        match self.certs.get_mut(serial) {
            Some(mut record) => {
                record.status = if record.not_after < Utc::now() {
                    CertStatus::RevokedExpired
                } else {
                    CertStatus::Revoked
                };
                record.revocation = Some(info);
                true
            }
            None => false,
        }
    }

    pub fn unrevoke(&self, serial: &SerialNumber) -> bool {
        match self.certs.get_mut(serial) {
            Some(mut record) => {
                record.status = CertStatus::Valid;
                record.revocation = None;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

#[async_trait]
impl CertificateStore for MemoryCertificateStore {
    async fn scan_revoked(
        &self,
        filter: &RevokedCertFilter,
        after: Option<&SerialNumber>,
        page_size: usize,
    ) -> Result<Vec<CertRecord>> {
        let mut matching: Vec<CertRecord> = self
            .certs
            .iter()
            .filter(|entry| after.is_none_or(|after| entry.key() > after))
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by(|a, b| a.serial.cmp(&b.serial));
        matching.truncate(page_size);
        Ok(matching)
    }

    async fn read_record(&self, serial: &SerialNumber) -> Result<Option<CertRecord>> {
        Ok(self.certs.get(serial).map(|r| r.value().clone()))
    }
}

/// An in-memory log of completed revocation requests.
#[derive(Debug, Default, Clone)]
pub struct MemoryRequestStore {
    requests: Arc<DashMap<RequestId, CompletedRequest>>,
    errors: Arc<DashMap<(RequestId, String), String>>,
}

impl MemoryRequestStore {
    /// Logs a completed request and returns the stored entry.
    pub fn complete(&self, id: RequestId, kind: RequestKind) -> CompletedRequest {
        let request = CompletedRequest {
            id,
            kind,
            completed_on: whole_seconds(Utc::now()),
        };
        self.requests.insert(id, request.clone());
        request
    }

    /// The CRL update error recorded for a request and issuing point.
    pub fn crl_update_error(&self, id: RequestId, issuing_point: &str) -> Option<String> {
        self.errors
            .get(&(id, issuing_point.to_string()))
            .map(|e| e.value().clone())
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn scan_completed(
        &self,
        from: RequestId,
        page_size: usize,
    ) -> Result<Vec<CompletedRequest>> {
        let mut requests: Vec<CompletedRequest> = self
            .requests
            .iter()
            .filter(|entry| *entry.key() >= from)
            .map(|entry| entry.value().clone())
            .collect();
        requests.sort_by_key(|request| request.id);
        requests.truncate(page_size);
        Ok(requests)
    }

    async fn record_crl_update_error(
        &self,
        request: RequestId,
        issuing_point: &str,
        error: &str,
    ) -> Result<()> {
        self.errors
            .insert((request, issuing_point.to_string()), error.to_string());
        Ok(())
    }
}
