use std::sync::Arc;

use ca_server::{
    ca::{CaContext, CertificateAuthority},
    config::Config,
    crl::{IssuingPointConfig, default_extension_settings},
    publish::FilePublisher,
    signer::OpensslSigner,
    store::{FileRecordStore, MemoryCertificateStore, MemoryRequestStore},
    telemetry,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    // Load configuration
    let config = Config::load()?;
    info!("Loaded CA configuration: {:?}", config.ca);

    let signer = match &config.ca.signing_key {
        Some(path) => OpensslSigner::from_pem_file(path).await?,
        None => {
            warn!("No signing key configured, generating an ephemeral RSA key");
            OpensslSigner::generate_rsa(2048)?
        }
    };

    let ctx = CaContext {
        issuer: config.ca.issuer_name()?,
        authority_key_id: config.ca.authority_key_id()?,
        extension_defaults: default_extension_settings(),
        records: Arc::new(FileRecordStore::open(&config.ca.record_dir).await?),
        certificates: Arc::new(MemoryCertificateStore::default()),
        requests: Arc::new(MemoryRequestStore::default()),
        signer: Arc::new(signer),
        publisher: Arc::new(FilePublisher::open(&config.ca.publish_dir).await?),
    };

    let mut points = config.issuing_points.clone();
    if points.is_empty() {
        points.insert("MasterCRL".to_string(), IssuingPointConfig::default());
    }

    let ca = CertificateAuthority::new(ctx);
    ca.start(&points).await;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    ca.shutdown().await;
    Ok(())
}
