use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{Reachability, StopId, TourId};
use crate::error::TourError;
use crate::remote::ProgressBackend;
use crate::resolve::resolve;
use crate::store::Store;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MappingSnapshot {
    refreshed_at: Option<DateTime<Utc>>,
    stops: BTreeMap<StopId, TourId>,
}

/// `stopId -> tourId` lookup cache with a time-to-live, persisted so that an
/// offline restart can still backfill tour ids.
pub struct StopTourIndex {
    store: Store,
    ttl: Duration,
    state: Mutex<MappingSnapshot>,
}

impl StopTourIndex {
    pub fn new(store: Store, ttl: Duration) -> Self {
        let snapshot = match Store::read_json::<MappingSnapshot>(&store.mapping_path()) {
            Ok(snapshot) => snapshot.unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "discarding unreadable stop mapping snapshot");
                MappingSnapshot::default()
            }
        };
        Self {
            store,
            ttl,
            state: Mutex::new(snapshot),
        }
    }

    fn state(&self) -> MutexGuard<'_, MappingSnapshot> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Never touches the network; stale entries are still returned.
    pub fn cached(&self, stop: &StopId) -> Option<TourId> {
        self.state().stops.get(stop).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stale(&self) -> bool {
        let refreshed_at = self.state().refreshed_at;
        match refreshed_at {
            None => true,
            Some(at) => {
                let age = Utc::now().signed_duration_since(at);
                chrono::Duration::from_std(self.ttl)
                    .map(|ttl| age >= ttl)
                    .unwrap_or(false)
            }
        }
    }

    pub fn refresh<B: ProgressBackend>(&self, backend: &B) -> Result<usize, TourError> {
        let rows = backend.list_stops()?;
        let snapshot = MappingSnapshot {
            refreshed_at: Some(Utc::now()),
            stops: rows
                .into_iter()
                .map(|row| (row.stop_id, row.tour_id))
                .collect(),
        };
        let count = snapshot.stops.len();
        if let Err(err) = Store::write_json(&self.store.mapping_path(), &snapshot) {
            warn!(error = %err, "cannot persist stop mapping snapshot");
        }
        *self.state() = snapshot;
        debug!(stops = count, "stop mapping refreshed");
        Ok(count)
    }

    pub fn refresh_if_stale<B: ProgressBackend>(&self, backend: &B, reachability: Reachability) {
        if !reachability.permits_remote() || !self.is_stale() {
            return;
        }
        if let Err(err) = self.refresh(backend) {
            warn!(error = %err, "stop mapping refresh failed; keeping cached entries");
        }
    }

    /// Fresh cache first, then a remote refresh, then whatever stale entry is left.
    pub fn lookup<B: ProgressBackend>(
        &self,
        stop: &StopId,
        backend: &B,
        reachability: Reachability,
    ) -> Option<TourId> {
        let fresh = !self.is_stale();
        resolve(
            reachability,
            || if fresh { self.cached(stop) } else { None },
            || {
                self.refresh(backend)?;
                Ok(self.cached(stop))
            },
        )
        .into_option()
        .or_else(|| self.cached(stop))
    }
}
