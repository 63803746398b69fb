//! In-memory revocation cache of an issuing point.
//!
//! The cache holds the entry set of the last full CRL (the snapshot) plus
//! three pending maps collected since: new revocations, unrevocations and
//! expirations. A delta CRL lists the pending maps; a full CRL folds them
//! into a new snapshot. Every mutation moves the first-unsaved checkpoint
//! forward so that a crash can be repaired by replaying completed requests.
//!
//! The cache is a plain data structure. The issuing point guards it with a
//! mutex and never holds that mutex across store or signer calls.

use std::mem;

use chrono::{DateTime, Utc};

use super::types::{EntryMap, FirstUnsaved, PendingMaps, RequestId, RevokedEntry, SerialNumber};

/// How expired entries leave the CRL
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpiryPolicy {
    /// Keep an expired entry for one more full CRL.
    pub one_extra_time: bool,
    pub last_full_update: Option<DateTime<Utc>>,
}

/// Returned when a mutation first dirtied a clean cache; the caller persists
/// the checkpoint unless a flush overtook it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub request: RequestId,
    epoch: u64,
}

/// A copy of the pending maps taken at the start of a generation
#[derive(Debug, Clone)]
pub struct GenerationView {
    pub pending: PendingMaps,
    pub snapshot: EntryMap,
    pub rebuild_required: bool,
    clear_epoch: u64,
}

/// Pending maps handed to the store by a flush
#[derive(Debug, Clone)]
pub struct FlushTicket {
    pub maps: PendingMaps,
    pub marker: FirstUnsaved,
    previous: FirstUnsaved,
}

#[derive(Debug, Clone)]
pub struct RevocationCache {
    snapshot: EntryMap,
    pending: PendingMaps,
    in_flight: Option<PendingMaps>,
    cleared: bool,
    clear_epoch: u64,
    first_unsaved: FirstUnsaved,
    flush_epoch: u64,
    unsaved: bool,
}

impl Default for RevocationCache {
    fn default() -> Self {
        Self {
            snapshot: EntryMap::new(),
            pending: PendingMaps::default(),
            in_flight: None,
            cleared: true,
            clear_epoch: 0,
            first_unsaved: FirstUnsaved::NewCache,
            flush_epoch: 0,
            unsaved: false,
        }
    }
}

impl RevocationCache {
    /// Restores a cache from a decoded CRL and persisted pending maps.
    pub fn restore(snapshot: EntryMap, pending: PendingMaps, first_unsaved: FirstUnsaved) -> Self {
        Self {
            snapshot,
            pending,
            cleared: false,
            first_unsaved,
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> &EntryMap {
        &self.snapshot
    }

    pub fn pending(&self) -> &PendingMaps {
        &self.pending
    }

    pub fn first_unsaved(&self) -> FirstUnsaved {
        self.first_unsaved
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    /// Mutations happened since the last flush.
    pub fn has_unsaved_changes(&self) -> bool {
        self.unsaved
    }

    /// Drops all cached state; the next generation rebuilds from the store.
    pub fn clear(&mut self) {
        self.snapshot.clear();
        self.pending = PendingMaps::default();
        self.cleared = true;
        self.clear_epoch += 1;
        self.first_unsaved = FirstUnsaved::NewCache;
        self.unsaved = true;
    }

    fn folding(&self) -> Option<&PendingMaps> {
        self.in_flight.as_ref()
    }

    fn note_change(&mut self, request: Option<RequestId>) -> Option<Checkpoint> {
        self.unsaved = true;
        let request = request?;
        match self.first_unsaved {
            FirstUnsaved::CleanCache | FirstUnsaved::NewCache => {
                self.first_unsaved = FirstUnsaved::Request(request);
                Some(Checkpoint {
                    request,
                    epoch: self.flush_epoch,
                })
            }
            FirstUnsaved::Request(_) => None,
        }
    }

    /// Records a revocation.
    pub fn add_revoked(
        &mut self,
        entry: RevokedEntry,
        request: Option<RequestId>,
    ) -> Option<Checkpoint> {
        let serial = entry.serial.clone();
        let generation_running = self.folding().is_some();

        if self.pending.unrevoked.remove(&serial).is_some() {
            let listed = match self.snapshot.get_mut(&serial) {
                Some(listed) => {
                    *listed = entry.clone();
                    true
                }
                None => false,
            };
            // The running fold drops the serial; re-add it on the next one.
            if generation_running || !listed {
                self.pending.revoked.insert(serial, entry);
            }
        } else {
            self.pending.revoked.insert(serial, entry);
        }
        self.note_change(request)
    }

    /// Records an unrevocation (certificate taken off hold).
    pub fn add_unrevoked(
        &mut self,
        serial: &SerialNumber,
        at: DateTime<Utc>,
        request: Option<RequestId>,
    ) -> Option<Checkpoint> {
        let being_folded = self
            .folding()
            .is_some_and(|maps| maps.revoked.contains_key(serial));
        let was_pending = self.pending.revoked.remove(serial).is_some();

        if (!was_pending && self.snapshot.contains_key(serial)) || being_folded {
            self.pending
                .unrevoked
                .insert(serial.clone(), RevokedEntry::removal(serial.clone(), at));
        }
        self.note_change(request)
    }

    /// Records that a listed certificate expired.
    pub fn add_expired(&mut self, serial: &SerialNumber, at: DateTime<Utc>) -> bool {
        let mut changed = self.pending.revoked.remove(serial).is_some();
        if self.snapshot.contains_key(serial) && !self.pending.expired.contains_key(serial) {
            self.pending
                .expired
                .insert(serial.clone(), RevokedEntry::removal(serial.clone(), at));
            changed = true;
        }
        if changed {
            self.note_change(None);
        }
        changed
    }

    /// Whether `checkpoint` should still be written to the store.
    pub fn checkpoint_current(&self, checkpoint: &Checkpoint) -> bool {
        self.flush_epoch == checkpoint.epoch
            && self.first_unsaved == FirstUnsaved::Request(checkpoint.request)
    }

    /// Starts a flush of the live pending maps. Call under the repository lock.
    ///
    /// A cleared cache is flushed with the new-cache marker so that a restart
    /// does not trust the maps.
    pub fn begin_flush(&mut self) -> FlushTicket {
        let maps = self.pending.clone();
        let marker = if self.cleared {
            FirstUnsaved::NewCache
        } else {
            FirstUnsaved::CleanCache
        };
        self.begin_flush_with(maps, marker)
    }

    /// Starts a flush of `maps` that leaves `marker` as the checkpoint. Call
    /// under the repository lock.
    pub fn begin_flush_with(&mut self, maps: PendingMaps, marker: FirstUnsaved) -> FlushTicket {
        self.flush_epoch += 1;
        self.unsaved = false;
        let previous = mem::replace(&mut self.first_unsaved, marker);
        FlushTicket {
            maps,
            marker,
            previous,
        }
    }

    /// Restores the checkpoint after a failed flush.
    pub fn abort_flush(&mut self, ticket: &FlushTicket) {
        self.unsaved = true;
        if let FirstUnsaved::Request(_) = ticket.previous {
            self.first_unsaved = ticket.previous;
        }
    }

    /// Starts a generation: copies the pending maps and decides whether the
    /// snapshot has to be rebuilt from the certificate store. The snapshot is
    /// copied only for a full CRL built from the cache.
    ///
    /// Mutations are reconciled against the copied maps only while a full CRL
    /// is in flight. A delta-only generation leaves the pending maps untouched.
    pub fn begin_generation(
        &mut self,
        crl_size: i64,
        cache_enabled: bool,
        full_cycle: bool,
    ) -> GenerationView {
        let pending = self.pending.clone();
        let snapshot_len = self.snapshot.len();
        let rebuild_required = !cache_enabled
            || self.cleared
            || (snapshot_len == 0 && !pending.is_empty())
            || snapshot_len < pending.unrevoked.len()
            || (snapshot_len == 0 && crl_size > 0)
            || (snapshot_len > 0 && crl_size == 0);

        // Only a full CRL folds the copied maps into the snapshot.
        self.in_flight = (full_cycle || rebuild_required).then(|| pending.clone());

        let snapshot = if full_cycle && !rebuild_required {
            self.snapshot.clone()
        } else {
            EntryMap::new()
        };
        GenerationView {
            pending,
            snapshot,
            rebuild_required,
            clear_epoch: self.clear_epoch,
        }
    }

    /// Pending maps left once `consumed` is folded, keeping `deferred` expirations.
    pub fn remaining_after(&self, consumed: &PendingMaps, deferred: &EntryMap) -> PendingMaps {
        PendingMaps {
            revoked: unconsumed(&self.pending.revoked, &consumed.revoked),
            unrevoked: unconsumed(&self.pending.unrevoked, &consumed.unrevoked),
            expired: self
                .pending
                .expired
                .iter()
                .filter(|(serial, entry)| {
                    deferred.contains_key(*serial) || consumed.expired.get(*serial) != Some(*entry)
                })
                .map(|(serial, entry)| (serial.clone(), entry.clone()))
                .collect(),
        }
    }

    /// Installs the snapshot of a full CRL and drops the consumed entries.
    ///
    /// Returns false when the cache was cleared while the CRL was built; the
    /// cache then stays cleared and the next generation rebuilds it.
    pub fn commit(
        &mut self,
        view: &GenerationView,
        snapshot: EntryMap,
        deferred: &EntryMap,
    ) -> bool {
        self.in_flight = None;
        if view.clear_epoch != self.clear_epoch {
            return false;
        }
        let remaining = self.remaining_after(&view.pending, deferred);
        self.pending = remaining;
        self.snapshot = snapshot;
        self.cleared = false;
        true
    }

    /// Ends a generation that produced no full CRL or failed.
    pub fn end_generation(&mut self) {
        self.in_flight = None;
    }
}

fn unconsumed(live: &EntryMap, consumed: &EntryMap) -> EntryMap {
    live.iter()
        .filter(|(serial, entry)| consumed.get(*serial) != Some(*entry))
        .map(|(serial, entry)| (serial.clone(), entry.clone()))
        .collect()
}

/// Applies pending maps to a snapshot and returns the expirations that must
/// stay pending under `policy`.
pub fn fold(snapshot: &mut EntryMap, pending: &PendingMaps, policy: ExpiryPolicy) -> EntryMap {
    for serial in pending.unrevoked.keys() {
        snapshot.remove(serial);
    }
    for (serial, entry) in &pending.revoked {
        snapshot.insert(serial.clone(), entry.clone());
    }

    let mut deferred = EntryMap::new();
    for (serial, marker) in &pending.expired {
        let listed_once_more = !policy.one_extra_time
            || policy
                .last_full_update
                .is_some_and(|last| marker.revoked_on < last);
        if listed_once_more {
            snapshot.remove(serial);
        } else {
            deferred.insert(serial.clone(), marker.clone());
        }
    }
    deferred
}

/// Entries of a delta CRL: revocations plus removeFromCRL markers.
pub fn delta_entries(pending: &PendingMaps, policy: ExpiryPolicy) -> EntryMap {
    let mut entries = EntryMap::new();
    if !policy.one_extra_time {
        entries.extend(
            pending
                .expired
                .iter()
                .map(|(serial, entry)| (serial.clone(), entry.clone())),
        );
    }
    entries.extend(
        pending
            .unrevoked
            .iter()
            .map(|(serial, entry)| (serial.clone(), entry.clone())),
    );
    entries.extend(
        pending
            .revoked
            .iter()
            .map(|(serial, entry)| (serial.clone(), entry.clone())),
    );
    entries
}
