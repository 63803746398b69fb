use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cache::{Checkpoint, ExpiryPolicy, RevocationCache};
use super::config::{ConfigChanges, IssuingPointConfig};
use super::errors::{CrlError, CrlResult};
use super::extensions::ExtensionRegistry;
use super::schedule::Schedule;
use super::scheduler::UpdateScheduler;
use super::types::{
    EntryMap, FirstUnsaved, InitializationState, PendingMaps, RequestId, RevokedEntry,
    SerialNumber, UpdatingState,
};
use crate::ca::CaContext;
use crate::signer::SigningAlgorithm;
use crate::store::{CertStatus, RevokedCertFilter, SerialRange};

/// Configuration of an issuing point together with everything derived from it
#[derive(Debug)]
pub(crate) struct Settings {
    pub config: IssuingPointConfig,
    pub schedule: Schedule,
    pub algorithm: SigningAlgorithm,
    pub serial_range: SerialRange,
    pub profiles: Option<Vec<String>>,
    pub registry: Arc<ExtensionRegistry>,
}

impl Settings {
    fn derive(
        id: &str,
        config: IssuingPointConfig,
        ctx: &CaContext,
        registry: Option<Arc<ExtensionRegistry>>,
    ) -> Self {
        let registry = registry.unwrap_or_else(|| {
            Arc::new(ExtensionRegistry::new(
                id,
                &config.extensions,
                &ctx.extension_defaults,
                ctx.authority_key_id.as_deref(),
            ))
        });
        Self {
            schedule: config.schedule(id),
            algorithm: config.algorithm(id),
            serial_range: config.serial_range(id),
            profiles: config.profiles(),
            registry,
            config,
        }
    }

    /// Delta CRLs need the cache and an enabled DeltaCRLIndicator.
    pub fn delta_enabled(&self) -> bool {
        self.config.cache_enabled() && self.registry.delta_crl_enabled(self.config.allow_extensions)
    }

    pub fn revoked_filter(&self) -> RevokedCertFilter {
        let statuses = if self.config.include_expired_certs {
            vec![CertStatus::Revoked, CertStatus::RevokedExpired]
        } else {
            vec![CertStatus::Revoked]
        };
        RevokedCertFilter {
            statuses,
            ca_only: self.config.ca_certs_only,
            profiles: self.profiles.clone(),
            serial_range: self.serial_range.clone(),
        }
    }

    pub fn expiry_policy(&self, last_full_update: Option<DateTime<Utc>>) -> ExpiryPolicy {
        ExpiryPolicy {
            one_extra_time: self.config.include_expired_certs_one_extra_time,
            last_full_update,
        }
    }
}

/// Counters and timestamps of an issuing point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuingPointStatus {
    pub initialization: InitializationState,
    pub updating: UpdatingState,
    pub crl_number: u64,
    pub next_crl_number: u64,
    /// Number of the full CRL before the current one.
    pub last_crl_number: u64,
    pub delta_crl_number: u64,
    pub next_delta_crl_number: u64,
    /// Entries in the current full CRL, `-1` when none was issued.
    pub crl_size: i64,
    /// Entries in the current delta CRL, `-1` when none is valid.
    pub delta_crl_size: i64,
    pub last_update: Option<DateTime<Utc>>,
    pub last_full_update: Option<DateTime<Utc>>,
    pub next_update: Option<DateTime<Utc>>,
    pub next_delta_update: Option<DateTime<Utc>>,
    /// Position within the full/delta cycle; a full CRL is due at 0.
    pub schema_counter: u32,
    /// Index into the daily update list.
    pub current_day: usize,
    pub last_cache_flush: Option<DateTime<Utc>>,
}

impl Default for IssuingPointStatus {
    fn default() -> Self {
        Self {
            initialization: InitializationState::NotInitialized,
            updating: UpdatingState::Done,
            crl_number: 0,
            next_crl_number: 1,
            last_crl_number: 0,
            delta_crl_number: 0,
            next_delta_crl_number: 1,
            crl_size: -1,
            delta_crl_size: -1,
            last_update: None,
            last_full_update: None,
            next_update: None,
            next_delta_update: None,
            schema_counter: 0,
            current_day: 0,
            last_cache_flush: None,
        }
    }
}

/// A named CRL stream of the CA.
///
/// Every issuing point owns its revocation cache, its counters and a
/// background update loop. Handles are shared as `Arc<IssuingPoint>`; all
/// operations take `&self`.
pub struct IssuingPoint {
    pub(super) id: String,
    pub(super) ctx: Arc<CaContext>,
    pub(super) settings: RwLock<Arc<Settings>>,
    pub(super) cache: Mutex<RevocationCache>,
    pub(super) state: Mutex<IssuingPointStatus>,
    /// Serializes CRL generation.
    pub(super) generation: Mutex<()>,
    /// Serializes writes of pending maps and the checkpoint.
    pub(super) repository: Mutex<()>,
    pub(super) wake: Notify,
    pub(super) manual_update: Mutex<Option<Option<SigningAlgorithm>>>,
    /// Interval to honour once more after interval updates were switched off.
    pub(super) final_interval: Mutex<Option<Duration>>,
    shutting_down: AtomicBool,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl IssuingPoint {
    /// Creates the issuing point and restores its state from the record store.
    ///
    /// A point that fails to initialize is still returned; its operations
    /// report [`CrlError::NotInitialized`].
    pub async fn open(
        id: impl Into<String>,
        config: IssuingPointConfig,
        ctx: Arc<CaContext>,
    ) -> Arc<Self> {
        let id = id.into();
        let settings = Settings::derive(&id, config, &ctx, None);
        let enabled = settings.config.enable;

        let point = Arc::new(Self {
            id,
            ctx,
            settings: RwLock::new(Arc::new(settings)),
            cache: Mutex::new(RevocationCache::default()),
            state: Mutex::new(IssuingPointStatus::default()),
            generation: Mutex::new(()),
            repository: Mutex::new(()),
            wake: Notify::new(),
            manual_update: Mutex::new(None),
            final_interval: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            scheduler: Mutex::new(None),
        });

        if enabled {
            if let Err(e) = point.initialize().await {
                error!("Issuing point {}: {e}", point.id);
            }
        } else {
            info!("Issuing point {} is disabled", point.id);
        }
        point
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) async fn settings(&self) -> Arc<Settings> {
        Arc::clone(&*self.settings.read().await)
    }

    pub async fn config(&self) -> IssuingPointConfig {
        self.settings().await.config.clone()
    }

    pub async fn status(&self) -> IssuingPointStatus {
        self.state.lock().await.clone()
    }

    pub async fn is_enabled(&self) -> bool {
        self.settings().await.config.enable
    }

    pub async fn crl_number(&self) -> u64 {
        self.state.lock().await.crl_number
    }

    pub async fn delta_crl_number(&self) -> u64 {
        self.state.lock().await.delta_crl_number
    }

    /// Entries in the current full CRL, `-1` when none was issued.
    pub async fn crl_size(&self) -> i64 {
        self.state.lock().await.crl_size
    }

    pub async fn delta_crl_size(&self) -> i64 {
        self.state.lock().await.delta_crl_size
    }

    pub async fn next_update(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.next_update
    }

    pub async fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_update
    }

    pub async fn is_delta_crl_enabled(&self) -> bool {
        self.settings().await.delta_enabled()
    }

    /// Entries of the last full CRL as held in the cache.
    pub async fn cached_entries(&self) -> EntryMap {
        self.cache.lock().await.snapshot().clone()
    }

    /// Changes collected since the last full CRL.
    pub async fn pending_changes(&self) -> PendingMaps {
        self.cache.lock().await.pending().clone()
    }

    pub async fn is_cache_cleared(&self) -> bool {
        self.cache.lock().await.is_cleared()
    }

    /// Starts the background update loop unless it is already running.
    pub async fn start(self: &Arc<Self>) {
        let settings = self.settings().await;
        if !settings.config.enable {
            info!("Issuing point {}: not starting, point is disabled", self.id);
            return;
        }
        if self.state.lock().await.initialization != InitializationState::Initialized {
            warn!("Issuing point {}: not starting, point is not initialized", self.id);
            return;
        }

        let mut scheduler = self.scheduler.lock().await;
        if scheduler.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *scheduler = Some(UpdateScheduler::spawn(Arc::clone(self)));
    }

    fn ensure_running(&self) -> CrlResult<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(CrlError::ShutDown(self.id.clone()));
        }
        Ok(())
    }

    pub(super) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(super) async fn ensure_initialized(&self) -> CrlResult<()> {
        match self.state.lock().await.initialization {
            InitializationState::Initialized => Ok(()),
            _ => Err(CrlError::NotInitialized(self.id.clone())),
        }
    }

    /// Whether cache mutations apply to this point at all.
    async fn accepts_mutations(&self, settings: &Settings) -> CrlResult<bool> {
        self.ensure_running()?;
        if !settings.config.enable || !settings.config.cache_enabled() {
            return Ok(false);
        }
        self.ensure_initialized().await?;
        Ok(true)
    }

    /// Serial range and certificate-level filters of this point.
    pub(super) async fn admits_serial(
        &self,
        settings: &Settings,
        serial: &SerialNumber,
    ) -> CrlResult<bool> {
        if !settings.serial_range.contains(serial) {
            return Ok(false);
        }
        if !settings.config.ca_certs_only && settings.profiles.is_none() {
            return Ok(true);
        }

        let Some(record) = self.ctx.certificates.read_record(serial).await? else {
            debug!("Issuing point {}: no certificate record for {serial}", self.id);
            return Ok(false);
        };
        if settings.config.ca_certs_only && !record.is_ca {
            return Ok(false);
        }
        if let Some(profiles) = &settings.profiles {
            return Ok(record
                .profile_id
                .as_ref()
                .is_some_and(|profile| profiles.contains(profile)));
        }
        Ok(true)
    }

    pub(super) async fn admits_revocation(
        &self,
        settings: &Settings,
        entry: &RevokedEntry,
    ) -> CrlResult<bool> {
        if !settings.registry.admits_reason(entry.reason) {
            return Ok(false);
        }
        self.admits_serial(settings, &entry.serial).await
    }

    /// Adds a revoked certificate to the pending changes.
    ///
    /// The cache update itself never waits on a running generation. Persisting
    /// the first-unsaved checkpoint may wait on the repository lock.
    pub async fn add_revoked_cert(
        &self,
        entry: RevokedEntry,
        request: Option<RequestId>,
    ) -> CrlResult<()> {
        let settings = self.settings().await;
        if !self.accepts_mutations(&settings).await? {
            return Ok(());
        }
        if !self.admits_revocation(&settings, &entry).await? {
            debug!("Issuing point {}: {} is not listed here", self.id, entry.serial);
            return Ok(());
        }

        let checkpoint = self.cache.lock().await.add_revoked(entry, request);
        self.after_mutation(&settings, checkpoint).await
    }

    /// Records that a certificate was taken off hold at `at`.
    pub async fn add_unrevoked_cert(
        &self,
        serial: &SerialNumber,
        at: DateTime<Utc>,
        request: Option<RequestId>,
    ) -> CrlResult<()> {
        let settings = self.settings().await;
        if !self.accepts_mutations(&settings).await? {
            return Ok(());
        }
        if !self.admits_serial(&settings, serial).await? {
            debug!("Issuing point {}: {serial} is not listed here", self.id);
            return Ok(());
        }

        let checkpoint = self.cache.lock().await.add_unrevoked(serial, at, request);
        self.after_mutation(&settings, checkpoint).await
    }

    /// Records that a listed certificate expired.
    pub async fn add_expired_cert(&self, serial: &SerialNumber) -> CrlResult<()> {
        let settings = self.settings().await;
        if !self.accepts_mutations(&settings).await? || settings.config.include_expired_certs {
            return Ok(());
        }

        if self.cache.lock().await.add_expired(serial, Utc::now()) {
            debug!("Issuing point {}: {serial} expired", self.id);
            self.after_mutation(&settings, None).await?;
        }
        Ok(())
    }

    /// Persists the first-unsaved checkpoint, or the whole cache in write-through mode.
    ///
    /// Only the cache lock is held briefly. The store write takes the repository
    /// lock and so waits while a full CRL is being stored.
    async fn after_mutation(
        &self,
        settings: &Settings,
        checkpoint: Option<Checkpoint>,
    ) -> CrlResult<()> {
        if settings.config.write_through() {
            return self.flush_cache().await;
        }
        let Some(checkpoint) = checkpoint else {
            return Ok(());
        };

        let _repository = self.repository.lock().await;
        if !self.cache.lock().await.checkpoint_current(&checkpoint) {
            return Ok(());
        }
        self.ctx
            .records
            .update_first_unsaved(&self.id, FirstUnsaved::Request(checkpoint.request))
            .await?;
        Ok(())
    }

    /// Persists the pending maps and marks the cache clean.
    pub async fn flush_cache(&self) -> CrlResult<()> {
        let _repository = self.repository.lock().await;
        let ticket = {
            let mut cache = self.cache.lock().await;
            if !cache.has_unsaved_changes() {
                return Ok(());
            }
            cache.begin_flush()
        };

        let written = async {
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

        if let Err(e) = written {
            self.cache.lock().await.abort_flush(&ticket);
            error!("Issuing point {}: failed to save revocation cache: {e}", self.id);
            return Err(e.into());
        }

        self.state.lock().await.last_cache_flush = Some(Utc::now());
        debug!(
            "Issuing point {}: saved {} pending changes",
            self.id,
            ticket.maps.len()
        );
        Ok(())
    }

    /// Drops the cache; the next update rebuilds it from the certificate store.
    pub async fn clear_cache(&self) -> CrlResult<()> {
        self.cache.lock().await.clear();
        self.state.lock().await.schema_counter = 0;
        info!("Issuing point {}: revocation cache cleared", self.id);
        if self.settings().await.config.cache_enabled() {
            self.flush_cache().await?;
        }
        Ok(())
    }

    /// Generates CRLs now, waiting for the result.
    pub async fn update_crl_now(&self, algorithm: Option<&str>) -> CrlResult<()> {
        self.ensure_running()?;
        if !self.is_enabled().await {
            return Err(CrlError::Disabled(self.id.clone()));
        }
        let algorithm = algorithm
            .map(str::parse::<SigningAlgorithm>)
            .transpose()?;
        self.run_update(super::generator::UpdateTrigger {
            algorithm,
            slot: None,
        })
        .await
    }

    /// Asks the update loop to generate CRLs at its next iteration.
    pub async fn schedule_crl_update(&self, algorithm: Option<&str>) -> CrlResult<()> {
        self.ensure_running()?;
        if !self.is_enabled().await {
            return Err(CrlError::Disabled(self.id.clone()));
        }
        let algorithm = algorithm
            .map(str::parse::<SigningAlgorithm>)
            .transpose()?;
        *self.manual_update.lock().await = Some(algorithm);
        self.wake.notify_one();
        Ok(())
    }

    /// Applies operator settings. Returns `false` when the change only takes
    /// full effect after a restart.
    pub async fn update_config(
        self: &Arc<Self>,
        pairs: &HashMap<String, String>,
    ) -> CrlResult<bool> {
        self.ensure_running()?;

        let (old, new, changes) = {
            let mut guard = self.settings.write().await;
            let old = Arc::clone(&*guard);
            let mut config = old.config.clone();
            for (name, value) in pairs {
                if let Err(e) = config.apply(name, value) {
                    warn!("Issuing point {}: {e}", self.id);
                }
            }

            let changes = ConfigChanges::between(&old.config, &config);
            let registry = (!changes.extensions).then(|| Arc::clone(&old.registry));
            let new = Arc::new(Settings::derive(&self.id, config, &self.ctx, registry));
            *guard = Arc::clone(&new);
            (old, new, changes)
        };
        info!("Issuing point {}: configuration updated", self.id);

        let filter_changed =
            old.registry.only_some_reasons() != new.registry.only_some_reasons();
        if changes.cache_contents
            || filter_changed
            || (changes.cache_enable && !new.config.cache_enabled())
        {
            self.clear_cache().await?;
        }
        if changes.update_interval_disabled {
            *self.final_interval.lock().await = old.schedule.interval;
        }

        if changes.enable && new.config.enable {
            let uninitialized =
                self.state.lock().await.initialization != InitializationState::Initialized;
            if uninitialized {
                if let Err(e) = self.initialize().await {
                    error!("Issuing point {}: {e}", self.id);
                }
            }
        }

        self.wake.notify_one();
        if new.config.enable {
            self.start().await;
        }
        Ok(!changes.cache_enable)
    }

    /// Stops the update loop and saves unsaved cache changes.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wake.notify_one();

        let handle = self.scheduler.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Issuing point {}: update loop failed: {e}", self.id);
            }
        }

        let settings = self.settings().await;
        let initialized = self.ensure_initialized().await.is_ok();
        if initialized && settings.config.cache_enabled() && !settings.config.write_through() {
            if let Err(e) = self.flush_cache().await {
                error!("Issuing point {}: final cache save failed: {e}", self.id);
            }
        }
        info!("Issuing point {} shut down", self.id);
    }

    /// Shuts the point down and removes its record.
    pub async fn delete(&self) -> CrlResult<()> {
        self.shutdown().await;
        self.ctx.records.delete_record(&self.id).await?;
        info!("Issuing point {} deleted", self.id);
        Ok(())
    }
}
