//! Issuing point initialization and crash recovery.
//!
//! On startup the persisted record provides the counters, the last full CRL
//! and the pending maps. The first-unsaved checkpoint says how far the maps
//! can be trusted: a clean cache is used as is, a request id means the maps
//! miss every completed request from that id on, which are then replayed
//! from the request store. Anything that cannot be trusted leaves the cache
//! cleared, and the first update rebuilds it from the certificate store.

use chrono::Utc;
use tracing::{debug, info, warn};

use super::builder::decode_entries;
use super::cache::RevocationCache;
use super::errors::{CrlError, CrlResult};
use super::issuing_point::{IssuingPoint, Settings};
use super::types::{FirstUnsaved, InitializationState, RequestId};
use crate::store::{IssuingPointRecord, RequestKind};

impl IssuingPoint {
    /// Loads the persisted state. Sets the initialization state either way.
    pub(super) async fn initialize(&self) -> CrlResult<()> {
        let settings = self.settings().await;
        let loaded = self.load(&settings).await;

        let mut state = self.state.lock().await;
        match &loaded {
            Ok(()) => {
                state.initialization = InitializationState::Initialized;
                state.last_cache_flush = Some(Utc::now());
                info!(
                    "Issuing point {} initialized at CRL {}",
                    self.id, state.crl_number
                );
            }
            Err(_) => state.initialization = InitializationState::InitializationFailed,
        }
        loaded
    }

    async fn load(&self, settings: &Settings) -> CrlResult<()> {
        let record = match self.ctx.records.read_record(&self.id).await? {
            Some(record) => record,
            None => {
                let record = IssuingPointRecord::new(&self.id);
                self.ctx.records.write_new_record(&record).await?;
                info!("Issuing point {}: created new record", self.id);
                record
            }
        };

        self.restore_counters(&record).await;
        let cache = if settings.config.cache_enabled() {
            self.restore_cache(settings, &record).await?
        } else {
            RevocationCache::default()
        };
        *self.cache.lock().await = cache;

        if settings.config.publish_on_start {
            if let Some(crl) = &record.crl {
                self.publish(crl, false).await;
            }
            if let Some(delta) = record.delta_crl.as_ref().filter(|_| record.delta_crl_size >= 0) {
                self.publish(delta, true).await;
            }
        }
        Ok(())
    }

    async fn restore_counters(&self, record: &IssuingPointRecord) {
        let mut state = self.state.lock().await;
        let next = record.crl_number.max(record.delta_crl_number) + 1;
        state.crl_number = record.crl_number;
        state.last_crl_number = record.crl_number;
        state.next_crl_number = next;
        state.delta_crl_number = record.delta_crl_number;
        state.next_delta_crl_number = next;
        state.crl_size = record.crl_size;
        state.delta_crl_size = record.delta_crl_size;
        state.last_update = record.this_update;
        state.last_full_update = record.this_update;
        state.next_update = record.next_update;
        state.next_delta_update = record.delta_next_update;
    }

    async fn restore_cache(
        &self,
        settings: &Settings,
        record: &IssuingPointRecord,
    ) -> CrlResult<RevocationCache> {
        let Some(crl) = record.crl.as_ref().filter(|_| record.crl_size >= 0) else {
            return Ok(RevocationCache::default());
        };
        let snapshot = decode_entries(crl).map_err(|e| CrlError::InitializationFailed {
            id: self.id.clone(),
            reason: e.to_string(),
        })?;
        if i64::try_from(snapshot.len()).ok() != Some(record.crl_size) {
            warn!(
                "Issuing point {}: stored CRL lists {} entries, record says {}; rebuilding cache",
                self.id,
                snapshot.len(),
                record.crl_size
            );
            return Ok(RevocationCache::default());
        }

        let pending = record.pending.clone();
        match record.first_unsaved {
            Some(FirstUnsaved::CleanCache) => Ok(RevocationCache::restore(
                snapshot,
                pending,
                FirstUnsaved::CleanCache,
            )),
            Some(FirstUnsaved::Request(first)) if settings.config.enable_cache_recovery => {
                let mut cache =
                    RevocationCache::restore(snapshot, pending, FirstUnsaved::Request(first));
                match self.replay(settings, &mut cache, first).await {
                    Ok(replayed) => {
                        info!(
                            "Issuing point {}: recovered cache, replayed {replayed} requests from {first}",
                            self.id
                        );
                        self.save_recovered(&mut cache).await;
                        Ok(cache)
                    }
                    Err(e) => {
                        warn!("Issuing point {}: {e}; rebuilding cache", self.id);
                        Ok(RevocationCache::default())
                    }
                }
            }
            Some(FirstUnsaved::Request(_)) => {
                info!(
                    "Issuing point {}: cache recovery disabled, rebuilding cache",
                    self.id
                );
                Ok(RevocationCache::default())
            }
            Some(FirstUnsaved::NewCache) | None => Ok(RevocationCache::default()),
        }
    }

    /// Re-applies completed requests from `first` on, in id order.
    async fn replay(
        &self,
        settings: &Settings,
        cache: &mut RevocationCache,
        first: RequestId,
    ) -> CrlResult<usize> {
        let page_size = settings.config.page_size.max(1);
        let mut from = first;
        let mut replayed = 0;

        loop {
            let page = self.ctx.requests.scan_completed(from, page_size).await?;
            let fetched = page.len();

            for request in page {
                from = request.id.next();
                match request.kind {
                    RequestKind::Revoke { entries } => {
                        if entries.is_empty() {
                            return Err(CrlError::Recovery(format!(
                                "request {} carries no revocation data",
                                request.id
                            )));
                        }
                        for entry in entries {
                            if self.admits_revocation(settings, &entry).await? {
                                cache.add_revoked(entry, Some(request.id));
                            }
                        }
                    }
                    RequestKind::Unrevoke { serials } => {
                        if serials.is_empty() {
                            return Err(CrlError::Recovery(format!(
                                "request {} carries no serial numbers",
                                request.id
                            )));
                        }
                        for serial in serials {
                            if self.admits_serial(settings, &serial).await? {
                                cache.add_unrevoked(
                                    &serial,
                                    request.completed_on,
                                    Some(request.id),
                                );
                            }
                        }
                    }
                }
                replayed += 1;
            }
            if fetched < page_size {
                break;
            }
        }
        Ok(replayed)
    }

    /// Persists replayed maps so the next restart starts clean.
    async fn save_recovered(&self, cache: &mut RevocationCache) {
        let _repository = self.repository.lock().await;
        let ticket = cache.begin_flush();
        let saved = async {
            self.ctx
                .records
                .update_pending_maps(&self.id, &ticket.maps)
                .await?;
            self.ctx
                .records
                .update_first_unsaved(&self.id, ticket.marker)
                .await
        }
        .await;

        match saved {
            Ok(()) => debug!("Issuing point {}: saved recovered cache", self.id),
            Err(e) => {
                cache.abort_flush(&ticket);
                warn!("Issuing point {}: failed to save recovered cache: {e}", self.id);
            }
        }
    }
}
