use thiserror::Error;

use super::schedule::ScheduleError;
use crate::publish::PublishError;
use crate::signer::SignerError;
use crate::store::StoreError;

/// Errors raised while maintaining or issuing CRLs for an issuing point
#[derive(Error, Debug)]
pub enum CrlError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid update schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("CRL signing failed: {0}")]
    Signing(#[from] SignerError),

    #[error("CRL encoding failed: {0}")]
    Encoding(String),

    #[error("CRL publishing failed: {0}")]
    Publish(#[from] PublishError),

    #[error("Issuing point {id} failed to initialize: {reason}")]
    InitializationFailed { id: String, reason: String },

    #[error("Cache recovery failed: {0}")]
    Recovery(String),

    #[error("Issuing point {0} is not initialized")]
    NotInitialized(String),

    #[error("Issuing point {0} is disabled")]
    Disabled(String),

    #[error("Issuing point {0} is shutting down")]
    ShutDown(String),

    #[error("Unknown issuing point: {0}")]
    UnknownIssuingPoint(String),
}

impl From<der::Error> for CrlError {
    fn from(err: der::Error) -> Self {
        CrlError::Encoding(err.to_string())
    }
}

/// Convenient Result type alias
pub type CrlResult<T> = Result<T, CrlError>;
