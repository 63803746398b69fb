use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::generator::UpdateTrigger;
use super::issuing_point::{IssuingPoint, IssuingPointStatus, Settings};
use super::schedule::{NextUpdateQuery, ScheduledSlot};
use crate::signer::SigningAlgorithm;

#[derive(Debug)]
enum Action {
    Update(Option<ScheduledSlot>),
    Manual(Option<SigningAlgorithm>),
    Flush,
    Wait(Option<DateTime<Utc>>),
    Stop,
}

/// Background loop of one issuing point: scheduled and requested CRL
/// updates plus periodic cache saves.
pub(crate) struct UpdateScheduler {
    point: Arc<IssuingPoint>,
    failures: u32,
    /// Set after too many consecutive failures; cleared by a wake-up.
    parked: bool,
}

impl UpdateScheduler {
    pub(crate) fn spawn(point: Arc<IssuingPoint>) -> JoinHandle<()> {
        let scheduler = Self {
            point,
            failures: 0,
            parked: false,
        };
        tokio::spawn(scheduler.run())
    }

    async fn run(mut self) {
        info!("Issuing point {}: update loop started", self.point.id());
        loop {
            let action = self.next_action().await;
            debug!("Issuing point {}: {action:?}", self.point.id());
            match action {
                Action::Stop => break,
                Action::Update(slot) => {
                    let trigger = UpdateTrigger {
                        algorithm: None,
                        slot,
                    };
                    if self.update(trigger).await {
                        self.point.final_interval.lock().await.take();
                    }
                }
                Action::Manual(algorithm) => {
                    let trigger = UpdateTrigger {
                        algorithm,
                        slot: None,
                    };
                    self.update(trigger).await;
                }
                Action::Flush => {
                    if let Err(e) = self.point.flush_cache().await {
                        warn!("Issuing point {}: scheduled cache save failed: {e}", self.point.id());
                        let retry_at = retry_after(self.retry_wait().await);
                        self.wait(retry_at).await;
                    }
                }
                Action::Wait(until) => self.wait(until).await,
            }
        }
        info!("Issuing point {}: update loop stopped", self.point.id());
    }

    async fn retry_wait(&self) -> std::time::Duration {
        self.point.settings().await.config.retry_wait()
    }

    async fn next_action(&self) -> Action {
        let point = &self.point;
        if point.is_shutting_down() {
            return Action::Stop;
        }
        let settings = point.settings().await;
        if !settings.config.enable {
            return Action::Stop;
        }
        if let Some(algorithm) = point.manual_update.lock().await.take() {
            return Action::Manual(algorithm);
        }

        let now = Utc::now();
        let status = point.status().await;
        let mut wake_at = None;

        if !self.parked {
            let final_interval = *point.final_interval.lock().await;
            match next_auto_update(&settings, &status, final_interval, now) {
                Some((at, slot)) if at <= now => return Action::Update(slot),
                Some((at, _)) => wake_at = Some(at),
                None => {}
            }
        }

        let config = &settings.config;
        if config.cache_enabled() && !config.write_through() {
            let interval = config.cache_update_interval();
            let flush_at = if point.cache.lock().await.has_unsaved_changes() {
                let due = status
                    .last_cache_flush
                    .map_or(Some(now), |last| last.checked_add_signed(interval));
                if due.is_some_and(|due| due <= now) {
                    return Action::Flush;
                }
                due
            } else {
                now.checked_add_signed(interval)
            };
            if let Some(flush_at) = flush_at {
                wake_at = Some(wake_at.map_or(flush_at, |at: DateTime<Utc>| at.min(flush_at)));
            }
        }
        Action::Wait(wake_at)
    }

    /// Runs an update cycle, retrying later on failure. Returns whether it succeeded.
    async fn update(&mut self, trigger: UpdateTrigger) -> bool {
        if self.point.run_update(trigger).await.is_ok() {
            self.failures = 0;
            return true;
        }

        self.failures += 1;
        let settings = self.point.settings().await;
        if self.failures >= settings.config.unexpected_exception_loop_max {
            error!(
                "Issuing point {}: {} consecutive update failures, automatic updates paused",
                self.point.id(),
                self.failures
            );
            self.parked = true;
            return false;
        }

        self.wait(retry_after(settings.config.retry_wait())).await;
        false
    }

    async fn wait(&mut self, until: Option<DateTime<Utc>>) {
        let woken = match until {
            Some(at) => {
                let delay = (at - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = sleep(delay) => false,
                    _ = self.point.wake.notified() => true,
                }
            }
            None => {
                self.point.wake.notified().await;
                true
            }
        };
        if woken {
            self.failures = 0;
            self.parked = false;
        }
    }
}

/// When the next automatic update is due, and the slot it serves.
fn next_auto_update(
    settings: &Settings,
    status: &IssuingPointStatus,
    final_interval: Option<chrono::Duration>,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, Option<ScheduledSlot>)> {
    if !settings.config.enable_crl_updates {
        return None;
    }
    let schedule = &settings.schedule;
    let automatic = !schedule.is_manual() || final_interval.is_some();
    let Some(last_update) = status.last_update else {
        return automatic.then_some((now, None));
    };

    if schedule.interval.is_none() {
        let final_at =
            final_interval.and_then(|interval| last_update.checked_add_signed(interval));
        if let Some(at) = final_at {
            if schedule.daily.is_none() {
                return Some((at, None));
            }
            let daily = next_slot(settings, status, last_update, now);
            return match daily {
                Some((slot_at, slot)) if slot_at < at => Some((slot_at, slot)),
                _ => Some((at, None)),
            };
        }
    }
    next_slot(settings, status, last_update, now)
}

/// Point in time after `wait`, `None` when it lies beyond the representable range.
fn retry_after(wait: std::time::Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|wait| Utc::now().checked_add_signed(wait))
}

fn next_slot(
    settings: &Settings,
    status: &IssuingPointStatus,
    last_update: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, Option<ScheduledSlot>)> {
    settings
        .schedule
        .find_next_update(&NextUpdateQuery {
            from_last_update: true,
            delta: false,
            delta_enabled: settings.delta_enabled(),
            now,
            last_update: Some(last_update),
            current_day: status.current_day,
        })
        .map(|slot| (slot.at, Some(slot)))
}
