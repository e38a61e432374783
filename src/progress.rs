use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{CompletionRecord, StopId, SyncState, TourId, UserId};
use crate::error::TourError;
use crate::mapping::StopTourIndex;
use crate::store::Store;

/// Local ledger of completions plus the queue of records awaiting a remote write.
/// Both live under `progress/<userId>/` and every write is atomic.
pub struct ProgressStore {
    store: Store,
    index: Arc<StopTourIndex>,
    lock: Mutex<()>,
}

impl ProgressStore {
    pub fn new(store: Store, index: Arc<StopTourIndex>) -> Self {
        Self {
            store,
            index,
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_ledger(&self, user: &UserId) -> Result<Vec<CompletionRecord>, TourError> {
        Ok(Store::read_json(&self.store.ledger_path(user))?.unwrap_or_default())
    }

    fn read_queue(&self, user: &UserId) -> Result<Vec<CompletionRecord>, TourError> {
        Ok(Store::read_json(&self.store.queue_path(user))?.unwrap_or_default())
    }

    /// Appends a record unless one already exists for `(user, stop)`. Returns the
    /// stored record when it was written, `None` when it was a duplicate.
    pub fn record_completion(
        &self,
        user: &UserId,
        stop: &StopId,
        tour: Option<TourId>,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<CompletionRecord>, TourError> {
        let _guard = self.guard();
        let mut ledger = self.read_ledger(user)?;
        if ledger.iter().any(|record| &record.stop_id == stop) {
            debug!(%user, %stop, "completion already recorded locally");
            return Ok(None);
        }
        let tour = tour.or_else(|| self.index.cached(stop));
        let record = CompletionRecord::new(user.clone(), stop.clone(), tour, completed_at);
        ledger.push(record.clone());
        Store::write_json(&self.store.ledger_path(user), &ledger)?;
        Ok(Some(record))
    }

    pub fn find(
        &self,
        user: &UserId,
        stop: &StopId,
    ) -> Result<Option<CompletionRecord>, TourError> {
        let _guard = self.guard();
        Ok(self
            .read_ledger(user)?
            .into_iter()
            .find(|record| &record.stop_id == stop))
    }

    /// Ledger contents with missing tour ids backfilled from the mapping cache.
    pub fn get_local_completions(
        &self,
        user: &UserId,
    ) -> Result<Vec<CompletionRecord>, TourError> {
        let _guard = self.guard();
        let mut ledger = self.read_ledger(user)?;
        for record in ledger.iter_mut().filter(|record| record.tour_id.is_none()) {
            record.tour_id = self.index.cached(&record.stop_id);
        }
        Ok(ledger)
    }

    pub fn mark_synced(&self, user: &UserId, stop: &StopId) -> Result<(), TourError> {
        let _guard = self.guard();
        let mut ledger = self.read_ledger(user)?;
        let mut changed = false;
        for record in ledger
            .iter_mut()
            .filter(|record| &record.stop_id == stop && record.sync_state != SyncState::Synced)
        {
            record.sync_state = SyncState::Synced;
            changed = true;
        }
        if changed {
            Store::write_json(&self.store.ledger_path(user), &ledger)?;
        }
        Ok(())
    }

    /// Write-through of an authoritative remote listing. Remote rows replace the
    /// synced part of the ledger; local records still pending stay.
    pub fn replace_synced(
        &self,
        user: &UserId,
        remote: Vec<CompletionRecord>,
    ) -> Result<Vec<CompletionRecord>, TourError> {
        let _guard = self.guard();
        let ledger = self.read_ledger(user)?;
        let mut merged = remote;
        for record in merged.iter_mut().filter(|record| record.tour_id.is_none()) {
            record.tour_id = ledger
                .iter()
                .find(|local| local.same_fact(record))
                .and_then(|local| local.tour_id.clone());
        }
        for record in ledger {
            if record.sync_state == SyncState::Pending
                && !merged.iter().any(|existing| existing.same_fact(&record))
            {
                merged.push(record);
            }
        }
        Store::write_json(&self.store.ledger_path(user), &merged)?;
        Ok(merged)
    }

    /// Returns `false` when the record was already queued.
    pub fn enqueue_pending(&self, record: &CompletionRecord) -> Result<bool, TourError> {
        let _guard = self.guard();
        let mut queue = self.read_queue(&record.user_id)?;
        if queue.iter().any(|queued| queued.same_fact(record)) {
            return Ok(false);
        }
        let mut queued = record.clone();
        queued.sync_state = SyncState::Pending;
        queue.push(queued);
        Store::write_json(&self.store.queue_path(&record.user_id), &queue)?;
        Ok(true)
    }

    /// Snapshot of the queue in insertion order. Entries stay queued until
    /// [`ProgressStore::acknowledge`] removes them.
    pub fn drain_queue(&self, user: &UserId) -> Result<Vec<CompletionRecord>, TourError> {
        let _guard = self.guard();
        self.read_queue(user)
    }

    pub fn acknowledge(&self, user: &UserId, applied: &[StopId]) -> Result<(), TourError> {
        if applied.is_empty() {
            return Ok(());
        }
        let _guard = self.guard();
        let mut queue = self.read_queue(user)?;
        queue.retain(|record| !applied.contains(&record.stop_id));
        let path = self.store.queue_path(user);
        if queue.is_empty() {
            Store::remove_file(&path)?;
        } else {
            Store::write_json(&path, &queue)?;
        }
        Ok(())
    }

    pub fn pending_count(&self, user: &UserId) -> Result<usize, TourError> {
        let _guard = self.guard();
        Ok(self.read_queue(user)?.len())
    }

    pub fn clear(&self, user: &UserId) -> Result<(), TourError> {
        let _guard = self.guard();
        Store::remove_file(&self.store.ledger_path(user))?;
        Store::remove_file(&self.store.queue_path(user))?;
        Store::remove_dir(&self.store.user_dir(user))?;
        Ok(())
    }
}
