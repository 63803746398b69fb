//! CRL generation for an issuing point.
//!
//! One update cycle may issue a delta CRL, a full CRL or both. The delta is
//! issued first and lists the pending changes against the current full CRL;
//! the full CRL folds the same changes into a new snapshot. A full CRL is
//! only counted once it is stored, and the in-memory cache is updated while
//! the repository lock is still held so that flushes never observe a
//! half-committed generation.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::builder::{CrlContent, build_crl};
use super::cache::{ExpiryPolicy, GenerationView, delta_entries, fold};
use super::errors::CrlResult;
use super::issuing_point::{IssuingPoint, Settings};
use super::schedule::ScheduledSlot;
use super::types::{EntryMap, FirstUnsaved, PendingMaps, UpdatingState, whole_seconds};
use crate::signer::SigningAlgorithm;
use crate::store::{DeltaCrlUpdate, FullCrlUpdate};

/// What started an update cycle
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct UpdateTrigger {
    /// Overrides the configured signing algorithm.
    pub algorithm: Option<SigningAlgorithm>,
    /// The schedule slot being served; `None` for manual updates.
    pub slot: Option<ScheduledSlot>,
}

/// Times and numbering shared by the CRLs of one cycle
struct Cycle {
    this_update: DateTime<Utc>,
    next_update: Option<DateTime<Utc>>,
    next_delta_update: Option<DateTime<Utc>>,
    algorithm: SigningAlgorithm,
    policy: ExpiryPolicy,
    /// A full CRL follows the delta and reuses its number.
    full: bool,
}

impl IssuingPoint {
    /// Runs one update cycle. Cycles never overlap.
    pub(crate) async fn run_update(&self, trigger: UpdateTrigger) -> CrlResult<()> {
        let _generation = self.generation.lock().await;
        self.ensure_initialized().await?;
        let settings = self.settings().await;

        self.state.lock().await.updating = UpdatingState::Started;
        let result = self.generate(&settings, trigger).await;
        self.cache.lock().await.end_generation();
        self.state.lock().await.updating = UpdatingState::Done;

        if let Err(e) = &result {
            error!("Issuing point {}: CRL update failed: {e}", self.id);
        }
        result
    }

    async fn generate(&self, settings: &Settings, trigger: UpdateTrigger) -> CrlResult<()> {
        let status = self.status().await;
        let this_update = whole_seconds(Utc::now());
        let delta_enabled = settings.delta_enabled();
        let cycle_length = settings.schedule.cycle_length(delta_enabled);

        let current_day = match trigger.slot {
            Some(slot) if settings.schedule.daily.is_some() => slot.day,
            _ => settings
                .schedule
                .advance_day(status.current_day, status.last_update, this_update),
        };
        let mut schema_counter = status.schema_counter % cycle_length;
        if settings.schedule.is_extended_daily() && trigger.slot.is_some_and(|s| !s.delta_only) {
            schema_counter = 0;
        }

        let mut view = self.cache.lock().await.begin_generation(
            status.crl_size,
            settings.config.cache_enabled(),
            schema_counter == 0,
        );
        if view.rebuild_required {
            info!(
                "Issuing point {}: rebuilding revocation cache from the certificate store",
                self.id
            );
            view.snapshot = self.scan_revoked(settings).await?;
            schema_counter = 0;
        }
        let full_cycle = schema_counter == 0;

        let (next_update, next_delta_update) =
            settings
                .schedule
                .next_update_times(this_update, current_day, delta_enabled);
        let cycle = Cycle {
            this_update,
            next_update,
            next_delta_update,
            algorithm: trigger.algorithm.unwrap_or(settings.algorithm),
            policy: settings.expiry_policy(status.last_full_update),
            full: full_cycle,
        };

        if delta_enabled && !view.rebuild_required {
            self.issue_delta(settings, &view.pending, &cycle).await;
        }
        if full_cycle {
            self.issue_full(settings, &mut view, &cycle).await?;
        }

        let mut state = self.state.lock().await;
        state.schema_counter = (schema_counter + 1) % cycle_length;
        state.current_day = current_day;
        state.last_update = Some(this_update);
        Ok(())
    }

    /// Lists every matching revoked certificate of the certificate store.
    async fn scan_revoked(&self, settings: &Settings) -> CrlResult<EntryMap> {
        let filter = settings.revoked_filter();
        let page_size = settings.config.page_size.max(1);
        let mut entries = EntryMap::new();
        let mut after = None;

        loop {
            let page = self
                .ctx
                .certificates
                .scan_revoked(&filter, after.as_ref(), page_size)
                .await?;
            let fetched = page.len();
            after = page.last().map(|record| record.serial.clone());

            for record in page {
                let Some(entry) = record.revoked_entry() else {
                    warn!(
                        "Issuing point {}: {} has no revocation data, skipping",
                        self.id, record.serial
                    );
                    continue;
                };
                if settings.registry.admits_reason(entry.reason) {
                    entries.insert(entry.serial.clone(), entry);
                }
            }
            if fetched < page_size {
                break;
            }
        }
        debug!(
            "Issuing point {}: {} revoked certificates in the store",
            self.id,
            entries.len()
        );
        Ok(entries)
    }

    /// Issues a delta CRL. Failures invalidate the delta but do not stop the cycle.
    async fn issue_delta(&self, settings: &Settings, pending: &PendingMaps, cycle: &Cycle) {
        let (number, base) = {
            let state = self.state.lock().await;
            (state.next_delta_crl_number, state.crl_number)
        };
        let entries = delta_entries(pending, cycle.policy);
        let size = i64::try_from(entries.len()).unwrap_or(i64::MAX);

        let issued = async {
            let content = CrlContent {
                issuer: &self.ctx.issuer,
                this_update: cycle.this_update,
                next_update: cycle.next_delta_update,
                entries: &entries,
                crl_number: number,
                base_crl_number: Some(base),
            };
            let der = build_crl(
                &content,
                &settings.registry,
                self.ctx.signer.as_ref(),
                cycle.algorithm,
            )
            .await?;
            let update = DeltaCrlUpdate {
                crl: der.clone(),
                delta_crl_number: number,
                delta_crl_size: size,
                next_update: cycle.next_delta_update,
            };
            self.ctx.records.update_delta_crl(&self.id, &update).await?;
            CrlResult::Ok(der)
        }
        .await;

        match issued {
            Ok(der) => {
                {
                    let mut state = self.state.lock().await;
                    state.delta_crl_number = number;
                    state.next_delta_crl_number = number + 1;
                    if !cycle.full {
                        state.next_crl_number = state.next_crl_number.max(number + 1);
                    }
                    state.delta_crl_size = size;
                    state.next_delta_update = cycle.next_delta_update;
                }
                info!(
                    "Issuing point {}: issued delta CRL {number} (base {base}) with {size} entries",
                    self.id
                );
                self.publish(&der, true).await;
            }
            Err(e) => {
                self.state.lock().await.delta_crl_size = -1;
                warn!("Issuing point {}: delta CRL {number} failed: {e}", self.id);
            }
        }
    }

    async fn issue_full(
        &self,
        settings: &Settings,
        view: &mut GenerationView,
        cycle: &Cycle,
    ) -> CrlResult<()> {
        // Shares the number of the delta issued in this cycle, which may have
        // advanced past next_crl_number when an earlier full CRL failed.
        let number = {
            let state = self.state.lock().await;
            state.next_crl_number.max(state.delta_crl_number)
        };
        let mut snapshot = std::mem::take(&mut view.snapshot);
        let deferred = if view.rebuild_required {
            EntryMap::new()
        } else {
            fold(&mut snapshot, &view.pending, cycle.policy)
        };
        let size = i64::try_from(snapshot.len()).unwrap_or(i64::MAX);

        let der = if settings.config.no_crl_if_no_revoked_cert && snapshot.is_empty() {
            info!("Issuing point {}: no revoked certificates, CRL not issued", self.id);
            None
        } else {
            let content = CrlContent {
                issuer: &self.ctx.issuer,
                this_update: cycle.this_update,
                next_update: cycle.next_update,
                entries: &snapshot,
                crl_number: number,
                base_crl_number: None,
            };
            Some(
                build_crl(
                    &content,
                    &settings.registry,
                    self.ctx.signer.as_ref(),
                    cycle.algorithm,
                )
                .await?,
            )
        };

        {
            let _repository = self.repository.lock().await;
            let ticket = {
                let mut cache = self.cache.lock().await;
                let remaining = cache.remaining_after(&view.pending, &deferred);
                cache.begin_flush_with(remaining, FirstUnsaved::CleanCache)
            };

            if let Some(der) = &der {
                let update = FullCrlUpdate {
                    crl: der.clone(),
                    crl_number: number,
                    crl_size: size,
                    this_update: cycle.this_update,
                    next_update: cycle.next_update,
                    pending: (!settings.config.save_memory).then(|| ticket.maps.clone()),
                };
                if let Err(e) = self.ctx.records.update_full_crl(&self.id, &update).await {
                    self.cache.lock().await.abort_flush(&ticket);
                    return Err(e.into());
                }
            }

            let save_maps = der.is_none() || settings.config.save_memory;
            let saved = async {
                if save_maps {
                    self.ctx
                        .records
                        .update_pending_maps(&self.id, &ticket.maps)
                        .await?;
                }
                self.ctx
                    .records
                    .update_first_unsaved(&self.id, ticket.marker)
                    .await
            }
            .await;

            let mut cache = self.cache.lock().await;
            match saved {
                Ok(()) => self.state.lock().await.last_cache_flush = Some(Utc::now()),
                Err(e) => {
                    cache.abort_flush(&ticket);
                    if der.is_none() {
                        return Err(e.into());
                    }
                    warn!(
                        "Issuing point {}: failed to save cache after CRL {number}: {e}",
                        self.id
                    );
                }
            }
            if !cache.commit(view, snapshot, &deferred) {
                warn!(
                    "Issuing point {}: cache was cleared during the update and will be rebuilt",
                    self.id
                );
            }
        }

        let Some(der) = der else {
            self.state.lock().await.crl_size = 0;
            return Ok(());
        };
        {
            let mut state = self.state.lock().await;
            state.last_crl_number = state.crl_number;
            state.crl_number = number;
            state.next_crl_number = number + 1;
            state.delta_crl_number = number;
            state.next_delta_crl_number = number + 1;
            state.crl_size = size;
            state.last_full_update = Some(cycle.this_update);
            state.next_update = cycle.next_update;
        }
        info!(
            "Issuing point {}: issued CRL {number} with {size} entries",
            self.id
        );
        self.publish(&der, false).await;
        Ok(())
    }

    /// Hands a CRL to the publisher. Publishing failures are logged only.
    pub(super) async fn publish(&self, der: &[u8], delta: bool) {
        self.state.lock().await.updating = UpdatingState::PublishingStarted;
        if let Err(e) = self.ctx.publisher.publish(der, &self.id, delta).await {
            warn!("Issuing point {}: publishing failed: {e}", self.id);
        }
    }
}
