use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use x509_cert::name::Name;

use crate::crl::extensions::ExtensionDefaults;
use crate::crl::{
    CrlError, CrlResult, IssuingPoint, IssuingPointConfig, RequestId, RevokedEntry, SerialNumber,
};
use crate::publish::Publisher;
use crate::signer::Signer;
use crate::store::{CertificateStore, RecordStore, RequestStore};

/// Collaborators and CA-wide settings shared by all issuing points
pub struct CaContext {
    pub issuer: Name,
    pub authority_key_id: Option<Vec<u8>>,
    pub extension_defaults: ExtensionDefaults,
    pub records: Arc<dyn RecordStore>,
    pub certificates: Arc<dyn CertificateStore>,
    pub requests: Arc<dyn RequestStore>,
    pub signer: Arc<dyn Signer>,
    pub publisher: Arc<dyn Publisher>,
}

/// The CA's set of issuing points.
///
/// Revocation events are fanned out to every issuing point; failures are
/// recorded against the originating request instead of being returned.
pub struct CertificateAuthority {
    ctx: Arc<CaContext>,
    points: RwLock<BTreeMap<String, Arc<IssuingPoint>>>,
}

impl CertificateAuthority {
    pub fn new(ctx: CaContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            points: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<CaContext> {
        &self.ctx
    }

    /// Opens and starts all configured issuing points.
    pub async fn start(&self, points: &BTreeMap<String, IssuingPointConfig>) {
        for (id, config) in points {
            if let Err(e) = self.add_issuing_point(id, config.clone()).await {
                error!("Failed to add issuing point {id}: {e}");
            }
        }
        info!("CA started with {} issuing points", self.points.read().await.len());
    }

    pub async fn add_issuing_point(
        &self,
        id: &str,
        config: IssuingPointConfig,
    ) -> CrlResult<Arc<IssuingPoint>> {
        if self.points.read().await.contains_key(id) {
            return Err(CrlError::Config(format!(
                "issuing point {id} already exists"
            )));
        }
        let point = IssuingPoint::open(id, config, Arc::clone(&self.ctx)).await;
        point.start().await;
        self.points
            .write()
            .await
            .insert(id.to_string(), Arc::clone(&point));
        Ok(point)
    }

    pub async fn issuing_point(&self, id: &str) -> CrlResult<Arc<IssuingPoint>> {
        self.points
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CrlError::UnknownIssuingPoint(id.to_string()))
    }

    pub async fn issuing_point_ids(&self) -> Vec<String> {
        self.points.read().await.keys().cloned().collect()
    }

    async fn all_points(&self) -> Vec<Arc<IssuingPoint>> {
        self.points.read().await.values().cloned().collect()
    }

    /// Removes an issuing point and its persisted record.
    pub async fn delete_issuing_point(&self, id: &str) -> CrlResult<()> {
        let point = self
            .points
            .write()
            .await
            .remove(id)
            .ok_or_else(|| CrlError::UnknownIssuingPoint(id.to_string()))?;
        point.delete().await
    }

    pub async fn update_issuing_point_config(
        &self,
        id: &str,
        pairs: &HashMap<String, String>,
    ) -> CrlResult<bool> {
        self.issuing_point(id).await?.update_config(pairs).await
    }

    async fn report(&self, request: RequestId, point: &IssuingPoint, error: &CrlError) {
        warn!(
            "Issuing point {}: request {request} not applied: {error}",
            point.id()
        );
        let message = error.to_string();
        if let Err(e) = self
            .ctx
            .requests
            .record_crl_update_error(request, point.id(), &message)
            .await
        {
            error!("Failed to record CRL update error for request {request}: {e}");
        }
    }

    /// Applies a completed revocation request to every issuing point.
    pub async fn revoke(&self, request: RequestId, entries: &[RevokedEntry]) {
        for point in self.all_points().await {
            for entry in entries {
                if let Err(e) = point.add_revoked_cert(entry.clone(), Some(request)).await {
                    self.report(request, &point, &e).await;
                    break;
                }
            }
        }
    }

    /// Applies a completed unrevocation request to every issuing point.
    pub async fn unrevoke(
        &self,
        request: RequestId,
        serials: &[SerialNumber],
        completed_on: DateTime<Utc>,
    ) {
        for point in self.all_points().await {
            for serial in serials {
                if let Err(e) = point
                    .add_unrevoked_cert(serial, completed_on, Some(request))
                    .await
                {
                    self.report(request, &point, &e).await;
                    break;
                }
            }
        }
    }

    /// Reports certificates that passed their notAfter date.
    pub async fn expire(&self, serials: &[SerialNumber]) {
        for point in self.all_points().await {
            for serial in serials {
                if let Err(e) = point.add_expired_cert(serial).await {
                    warn!("Issuing point {}: {e}", point.id());
                    break;
                }
            }
        }
    }

    /// Shuts down every issuing point, saving unsaved cache changes.
    pub async fn shutdown(&self) {
        for point in self.all_points().await {
            point.shutdown().await;
        }
        info!("CA shut down");
    }
}
