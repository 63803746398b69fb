use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("I/O error while publishing: {0}")]
    Io(#[from] std::io::Error),

    #[error("Publisher rejected CRL: {0}")]
    Rejected(String),
}

/// Destination for issued CRLs.
///
/// Publishing failures are reported but never roll back an issued CRL.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, crl: &[u8], issuing_point: &str, delta: bool)
    -> Result<(), PublishError>;
}

/// Writes each CRL as `<id>.der` or `<id>-delta.der` plus a base64 `.b64` copy.
pub struct FilePublisher {
    dir: PathBuf,
}

impl FilePublisher {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PublishError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        info!("Publishing CRLs to {:?}", dir);
        Ok(Self { dir })
    }

    fn base_name(issuing_point: &str, delta: bool) -> String {
        if delta {
            format!("{issuing_point}-delta")
        } else {
            issuing_point.to_string()
        }
    }
}

#[async_trait]
impl Publisher for FilePublisher {
    async fn publish(
        &self,
        crl: &[u8],
        issuing_point: &str,
        delta: bool,
    ) -> Result<(), PublishError> {
        if issuing_point.contains(['/', '\\']) {
            return Err(PublishError::Rejected(format!(
                "invalid issuing point id '{issuing_point}'"
            )));
        }
        let base = Self::base_name(issuing_point, delta);
        let der_path = self.dir.join(format!("{base}.der"));
        let b64_path = self.dir.join(format!("{base}.b64"));

        let tmp = self.dir.join(format!(".{base}.der.tmp"));
        fs::write(&tmp, crl).await?;
        fs::rename(&tmp, &der_path).await?;
        fs::write(&b64_path, STANDARD.encode(crl)).await?;
        debug!("Published {} bytes to {:?}", crl.len(), der_path);
        Ok(())
    }
}

/// A CRL handed to a [`MemoryPublisher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub issuing_point: String,
    pub delta: bool,
    pub crl: Vec<u8>,
}

/// Keeps published CRLs in memory.
///
/// Useful for testing and development.
#[derive(Debug, Default, Clone)]
pub struct MemoryPublisher {
    published: Arc<Mutex<Vec<Publication>>>,
}

impl MemoryPublisher {
    pub async fn publications(&self) -> Vec<Publication> {
        self.published.lock().await.clone()
    }

    pub async fn latest(&self, issuing_point: &str, delta: bool) -> Option<Publication> {
        self.published
            .lock()
            .await
            .iter()
            .rev()
            .find(|p| p.issuing_point == issuing_point && p.delta == delta)
            .cloned()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(
        &self,
        crl: &[u8],
        issuing_point: &str,
        delta: bool,
    ) -> Result<(), PublishError> {
        self.published.lock().await.push(Publication {
            issuing_point: issuing_point.to_string(),
            delta,
            crl: crl.to_vec(),
        });
        Ok(())
    }
}
