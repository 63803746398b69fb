pub mod ca;
pub mod config;
pub mod crl;
pub mod publish;
pub mod signer;
pub mod store;
pub mod telemetry;
