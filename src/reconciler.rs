use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{CompletionRecord, Reachability, StopId, SyncState, TourId, UserId};
use crate::error::TourError;
use crate::mapping::StopTourIndex;
use crate::progress::ProgressStore;
use crate::remote::{InsertOutcome, ProgressBackend};
use crate::resolve::resolve;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkOutcome {
    /// A local record already existed; nothing was written.
    AlreadyRecorded,
    /// Written locally and confirmed present remotely.
    Synced,
    /// Written locally and queued for a later remote write.
    Pending,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub applied: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub remote_cleared: bool,
}

/// Merges the local ledger with the remote completion table.
///
/// Local state is written first and never lost; only local write failures are
/// returned as errors. Remote failures leave records pending in the queue.
pub struct ProgressReconciler<B: ProgressBackend> {
    progress: ProgressStore,
    index: Arc<StopTourIndex>,
    backend: B,
}

impl<B: ProgressBackend> ProgressReconciler<B> {
    pub fn new(progress: ProgressStore, index: Arc<StopTourIndex>, backend: B) -> Self {
        Self {
            progress,
            index,
            backend,
        }
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    pub fn mark_completed(
        &self,
        user: &UserId,
        stop: &StopId,
        tour: Option<TourId>,
        reachability: Reachability,
    ) -> Result<MarkOutcome, TourError> {
        if self.progress.find(user, stop)?.is_some() {
            debug!(%user, %stop, "stop already completed");
            return Ok(MarkOutcome::AlreadyRecorded);
        }

        let online = reachability.permits_remote();
        let tour = match tour {
            Some(tour) => Some(tour),
            None if online => self.index.lookup(stop, &self.backend, reachability),
            None => self.index.cached(stop),
        };
        let completed_at = Utc::now();
        let candidate =
            CompletionRecord::new(user.clone(), stop.clone(), tour.clone(), completed_at);
        let remote_ok = online && self.push_remote(&candidate).is_ok();

        let Some(record) = self
            .progress
            .record_completion(user, stop, tour, completed_at)?
        else {
            return Ok(MarkOutcome::AlreadyRecorded);
        };

        let outcome = if remote_ok {
            self.progress.mark_synced(user, stop)?;
            MarkOutcome::Synced
        } else {
            self.progress.enqueue_pending(&record)?;
            MarkOutcome::Pending
        };

        if online {
            self.drain_pending(user)?;
        }
        Ok(outcome)
    }

    /// Existence check, then insert. A uniqueness conflict counts as success.
    fn push_remote(&self, record: &CompletionRecord) -> Result<(), TourError> {
        let pushed = self
            .backend
            .completion_exists(&record.user_id, &record.stop_id)
            .and_then(|exists| match exists {
                true => Ok(InsertOutcome::AlreadyExists),
                false => self.backend.insert_completion(record),
            });
        match pushed {
            Ok(InsertOutcome::Inserted) => Ok(()),
            Ok(InsertOutcome::AlreadyExists) => {
                debug!(
                    user = %record.user_id,
                    stop = %record.stop_id,
                    "remote row already present"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    user = %record.user_id,
                    stop = %record.stop_id,
                    error = %err,
                    "remote write failed"
                );
                Err(err)
            }
        }
    }

    /// Pushes queued records in order. A record the remote rejects stays queued
    /// without holding back the ones after it; losing the connection ends the
    /// drain. Every entry is re-checked remotely, so repeating a drain that was
    /// interrupted half-way cannot create duplicate rows.
    pub fn drain_pending(&self, user: &UserId) -> Result<DrainReport, TourError> {
        let queue = self.progress.drain_queue(user)?;
        if queue.is_empty() {
            return Ok(DrainReport::default());
        }

        let mut applied = Vec::new();
        for record in &queue {
            match self.push_remote(record) {
                Ok(()) => applied.push(record.stop_id.clone()),
                Err(err) if err.is_unreachable() => break,
                Err(_) => {}
            }
        }

        for stop in &applied {
            self.progress.mark_synced(user, stop)?;
        }
        self.progress.acknowledge(user, &applied)?;

        let report = DrainReport {
            applied: applied.len(),
            remaining: queue.len() - applied.len(),
        };
        info!(
            %user,
            applied = report.applied,
            remaining = report.remaining,
            "pending queue drained"
        );
        Ok(report)
    }

    /// Drain entry point for reconnects.
    pub fn sync_pending(
        &self,
        user: &UserId,
        reachability: Reachability,
    ) -> Result<DrainReport, TourError> {
        if !reachability.permits_remote() {
            return Ok(DrainReport {
                applied: 0,
                remaining: self.progress.pending_count(user)?,
            });
        }
        self.drain_pending(user)
    }

    /// Remote listing when reachable, written through to the local ledger.
    /// Offline, or on remote failure, the local ledger as it is.
    pub fn get_completed_stops(
        &self,
        user: &UserId,
        reachability: Reachability,
    ) -> Result<Vec<CompletionRecord>, TourError> {
        if !reachability.permits_remote() {
            return self.progress.get_local_completions(user);
        }

        self.drain_pending(user)?;
        self.index.refresh_if_stale(&self.backend, reachability);

        let rows = match self.backend.list_completions(user) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(%user, error = %err, "remote progress unavailable; using local ledger");
                return self.progress.get_local_completions(user);
            }
        };

        let remote = rows
            .into_iter()
            .map(|row| CompletionRecord {
                tour_id: self.index.cached(&row.stop_id),
                user_id: row.user_id,
                stop_id: row.stop_id,
                completed_at: row.completed_at,
                sync_state: SyncState::Synced,
            })
            .collect();
        self.progress.replace_synced(user, remote)
    }

    pub fn get_total_completed_count(
        &self,
        user: &UserId,
        reachability: Reachability,
    ) -> Result<u64, TourError> {
        if reachability.permits_remote() {
            match self.backend.count_completions(user) {
                Ok(count) => return Ok(count),
                Err(err) => warn!(%user, error = %err, "remote count failed; counting locally"),
            }
        }
        Ok(self.progress.get_local_completions(user)?.len() as u64)
    }

    pub fn is_completed(&self, user: &UserId, stop: &StopId, reachability: Reachability) -> bool {
        resolve(
            reachability,
            || match self.progress.find(user, stop) {
                Ok(found) => found.map(|_| true),
                Err(err) => {
                    warn!(%user, %stop, error = %err, "cannot read local ledger");
                    None
                }
            },
            || Ok(self.backend.completion_exists(user, stop)?.then_some(true)),
        )
        .into_option()
        .unwrap_or(false)
    }

    pub fn get_completed_for_tour(
        &self,
        user: &UserId,
        tour: &TourId,
    ) -> Result<Vec<CompletionRecord>, TourError> {
        Ok(self
            .progress
            .get_local_completions(user)?
            .into_iter()
            .filter(|record| record.tour_id.as_ref() == Some(tour))
            .collect())
    }

    /// Remote delete is best effort; the local ledger and queue are always cleared.
    pub fn clear_all_progress(
        &self,
        user: &UserId,
        reachability: Reachability,
    ) -> Result<ClearReport, TourError> {
        let remote_cleared = reachability.permits_remote()
            && match self.backend.delete_completions(user) {
                Ok(()) => true,
                Err(err) => {
                    warn!(%user, error = %err, "remote progress delete failed");
                    false
                }
            };
        self.progress.clear(user)?;
        info!(%user, remote_cleared, "progress cleared");
        Ok(ClearReport { remote_cleared })
    }
}
