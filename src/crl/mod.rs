//! Certificate Revocation List issuance
//!
//! This module maintains the CRLs of the CA's issuing points.
//!
//! # Features
//! - Revocation cache per issuing point with pending revoke/unrevoke/expire maps
//! - Full and delta CRL generation with configurable extensions
//! - Interval and daily update schedules with a full/delta cycle
//! - Crash recovery by replaying completed revocation requests
//! - Runtime reconfiguration of issuing points

pub mod builder;
pub mod cache;
pub mod config;
mod errors;
pub mod extensions;
mod generator;
mod issuing_point;
mod recovery;
pub mod schedule;
mod scheduler;
pub mod types;

// Re-export public types
pub use cache::RevocationCache;
pub use config::{ExtensionConfig, IssuingPointConfig};
pub use errors::{CrlError, CrlResult};
pub use extensions::{ExtensionName, ExtensionRegistry, default_extension_settings};
pub use issuing_point::{IssuingPoint, IssuingPointStatus};
pub use schedule::{DailySchedule, Schedule};
pub use types::{
    EntryMap, FirstUnsaved, InitializationState, PendingMaps, RequestId, RevocationReason,
    RevokedEntry, SerialNumber, UpdatingState,
};
