use async_trait::async_trait;
use color_eyre::Report;
use std::error::Error as StdError;
use std::fmt;

use crate::crl::types::{FirstUnsaved, PendingMaps, RequestId, SerialNumber};

mod file;
mod memory;
pub mod models;

pub use file::FileRecordStore;
pub use memory::{MemoryCertificateStore, MemoryRecordStore, MemoryRequestStore};
pub use models::{
    CertRecord, CertStatus, CompletedRequest, DeltaCrlUpdate, FullCrlUpdate, IssuingPointRecord,
    RequestKind, RevocationInfo, RevokedCertFilter, SerialRange,
};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for store operations.
#[derive(Debug)]
pub struct StoreError {
    error: Report,
}

impl StoreError {
    pub fn new<T>(error: T) -> Self
    where
        T: StdError + Send + Sync + 'static,
    {
        Self {
            error: Report::new(error),
        }
    }

    pub fn msg<T>(message: T) -> Self
    where
        T: fmt::Debug + fmt::Display + Send + Sync + 'static,
    {
        Self {
            error: Report::msg(message),
        }
    }
}

impl StdError for StoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.error.source()
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(error: std::io::Error) -> Self {
        Self {
            error: Report::new(error),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self {
            error: Report::new(error),
        }
    }
}

/// Persistent per-issuing-point record: counters, last CRLs, pending maps
/// and the crash-recovery checkpoint.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn read_record(&self, id: &str) -> Result<Option<IssuingPointRecord>>;

    async fn write_new_record(&self, record: &IssuingPointRecord) -> Result<()>;

    /// Stores a freshly issued full CRL together with its counters.
    async fn update_full_crl(&self, id: &str, update: &FullCrlUpdate) -> Result<()>;

    async fn update_delta_crl(&self, id: &str, update: &DeltaCrlUpdate) -> Result<()>;

    async fn update_pending_maps(&self, id: &str, maps: &PendingMaps) -> Result<()>;

    async fn update_first_unsaved(&self, id: &str, marker: FirstUnsaved) -> Result<()>;

    async fn delete_record(&self, id: &str) -> Result<()>;
}

/// Read access to the CA's certificate repository.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Returns up to `page_size` matching records ordered by serial number,
    /// starting after `after` when given.
    async fn scan_revoked(
        &self,
        filter: &RevokedCertFilter,
        after: Option<&SerialNumber>,
        page_size: usize,
    ) -> Result<Vec<CertRecord>>;

    async fn read_record(&self, serial: &SerialNumber) -> Result<Option<CertRecord>>;
}

/// Read access to completed revocation requests, plus error write-back.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Returns up to `page_size` completed revoke/unrevoke requests with
    /// id `>= from`, in ascending id order.
    async fn scan_completed(&self, from: RequestId, page_size: usize)
    -> Result<Vec<CompletedRequest>>;

    /// Records that applying `request` to an issuing point's cache failed.
    async fn record_crl_update_error(
        &self,
        request: RequestId,
        issuing_point: &str,
        error: &str,
    ) -> Result<()>;
}
