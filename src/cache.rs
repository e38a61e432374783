use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use camino::Utf8PathBuf;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SizeEstimates;
use crate::domain::{
    AssetKind, AssetManifest, AssetSource, ImageKey, Reachability, StopId, TourDefinition, TourId,
};
use crate::error::TourError;
use crate::fetcher::{AssetFetcher, FetchOutcome, Transport};
use crate::remote::TourSource;
use crate::resolve::{
    AssetLocation, AssetRef, LOCAL_CANDIDATES, REMOTE_CANDIDATES, Resolution, locate_first,
    resolve,
};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub tour_id: TourId,
    pub done: usize,
    pub total: usize,
    pub label: String,
    pub status: DownloadStatus,
    pub message: Option<String>,
}

impl DownloadProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.done as f64 / self.total as f64
    }
}

/// Observer of a download session.
pub trait DownloadSink {
    fn progress(&self, update: &DownloadProgress);
}

impl<F: Fn(&DownloadProgress)> DownloadSink for F {
    fn progress(&self, update: &DownloadProgress) {
        self(update)
    }
}

#[derive(Debug, Clone)]
struct PlannedAsset {
    kind: AssetKind,
    key: AssetRef,
    url: String,
    staged: Utf8PathBuf,
    destination: Utf8PathBuf,
    label: String,
}

/// Removes the session entry when the download returns, however it returns.
struct SessionGuard<'a> {
    sessions: &'a Mutex<HashMap<TourId, Arc<AtomicBool>>>,
    tour: TourId,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.tour);
    }
}

pub struct ContentCache<T: Transport, S: TourSource> {
    store: Store,
    fetcher: AssetFetcher<T>,
    source: S,
    estimates: SizeEstimates,
    sessions: Mutex<HashMap<TourId, Arc<AtomicBool>>>,
}

impl<T: Transport, S: TourSource> ContentCache<T, S> {
    pub fn new(
        store: Store,
        fetcher: AssetFetcher<T>,
        source: S,
        estimates: SizeEstimates,
    ) -> Self {
        Self {
            store,
            fetcher,
            source,
            estimates,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn fetcher(&self) -> &AssetFetcher<T> {
        &self.fetcher
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<TourId, Arc<AtomicBool>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_downloading(&self, tour: &TourId) -> bool {
        self.sessions().contains_key(tour)
    }

    pub fn is_available_offline(&self, tour: &TourId) -> bool {
        self.get_manifest(tour).is_some()
    }

    /// Verified manifest, or `None`. A manifest with a missing or empty file is
    /// purged together with its files before `None` is returned.
    pub fn get_manifest(&self, tour: &TourId) -> Option<AssetManifest> {
        let path = self.store.manifest_path(tour);
        let manifest = match Store::read_json::<AssetManifest>(&path) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return None,
            Err(err) => {
                warn!(%tour, error = %err, "unreadable manifest; purging");
                self.purge(tour);
                return None;
            }
        };
        if &manifest.tour_id != tour {
            warn!(%tour, found = %manifest.tour_id, "manifest names another tour; purging");
            self.purge(tour);
            return None;
        }
        if let Some(broken) = manifest.first_broken_path() {
            warn!(%tour, path = %broken, "cached file missing or empty; purging manifest");
            self.purge(tour);
            return None;
        }
        Some(manifest)
    }

    pub fn list_manifests(&self) -> Vec<AssetManifest> {
        match self.store.list_manifest_ids() {
            Ok(ids) => ids.iter().filter_map(|id| self.get_manifest(id)).collect(),
            Err(err) => {
                warn!(error = %err, "cannot list manifests");
                Vec::new()
            }
        }
    }

    pub fn get_storage_usage(&self) -> u64 {
        self.list_manifests()
            .iter()
            .map(|manifest| manifest.size)
            .sum()
    }

    pub fn get_audio_path(&self, tour: &TourId, stop: &StopId) -> Option<Utf8PathBuf> {
        self.get_manifest(tour)
            .and_then(|manifest| manifest.audio_files.get(stop).cloned())
    }

    pub fn get_image_path(&self, tour: &TourId, key: &ImageKey) -> Option<Utf8PathBuf> {
        self.get_manifest(tour)
            .and_then(|manifest| manifest.image_files.get(key).cloned())
    }

    /// Cached snapshot first; the remote definition only when nothing is cached.
    pub fn resolve_tour(
        &self,
        tour: &TourId,
        reachability: Reachability,
    ) -> Resolution<TourDefinition> {
        resolve(
            reachability,
            || self.get_manifest(tour).map(|manifest| manifest.tour_snapshot),
            || self.source.fetch_tour(tour),
        )
    }

    pub fn resolve_asset(
        &self,
        tour: &TourId,
        asset: &AssetRef,
        reachability: Reachability,
    ) -> Option<AssetLocation> {
        resolve(
            reachability,
            || {
                let manifest = self.get_manifest(tour)?;
                let tour = &manifest.tour_snapshot;
                locate_first(&LOCAL_CANDIDATES, asset, Some(&manifest), tour)
            },
            || {
                let Some(definition) = self.source.fetch_tour(tour)? else {
                    return Ok(None);
                };
                Ok(locate_first(&REMOTE_CANDIDATES, asset, None, &definition))
            },
        )
        .into_option()
    }

    /// Like [`ContentCache::resolve_asset`] for a definition already in hand.
    /// Without a manifest, bundled files still resolve offline.
    pub fn resolve_definition_asset(
        &self,
        tour: &TourDefinition,
        asset: &AssetRef,
        reachability: Reachability,
    ) -> Option<AssetLocation> {
        resolve(
            reachability,
            || match self.get_manifest(&tour.id) {
                Some(manifest) => {
                    let snapshot = &manifest.tour_snapshot;
                    locate_first(&LOCAL_CANDIDATES, asset, Some(&manifest), snapshot)
                }
                None => locate_first(&LOCAL_CANDIDATES, asset, None, tour),
            },
            || Ok(locate_first(&REMOTE_CANDIDATES, asset, None, tour)),
        )
        .into_option()
    }

    pub fn cancel_download(&self, tour: &TourId) -> bool {
        match self.sessions().get(tour) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(%tour, "download cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Idempotent; files that are already gone are ignored.
    pub fn remove_content(&self, tour: &TourId) -> Result<(), TourError> {
        let manifest_path = self.store.manifest_path(tour);
        let tour_dir = self.store.tour_dir(tour);
        if let Ok(Some(manifest)) = Store::read_json::<AssetManifest>(&manifest_path) {
            for path in manifest.paths().filter(|path| path.starts_with(&tour_dir)) {
                Store::remove_file(path)?;
            }
        }
        Store::remove_dir(&tour_dir)?;
        Store::remove_file(&manifest_path)?;
        info!(%tour, "offline content removed");
        Ok(())
    }

    fn purge(&self, tour: &TourId) {
        if let Err(err) = self.remove_content(tour) {
            warn!(%tour, error = %err, "cannot purge cached tour");
        }
    }

    /// Downloads every remote asset of the tour and persists the manifest.
    ///
    /// Files land in the staging directory and replace the tour directory only
    /// once the session succeeds, so an earlier copy survives a failed refresh.
    ///
    /// Returns `Err(AlreadyDownloading)` when a session for this tour is active.
    /// Every other failure is reported through `sink` and yields `Ok(false)`.
    pub fn download(
        &self,
        tour: &TourDefinition,
        sink: &dyn DownloadSink,
    ) -> Result<bool, TourError> {
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut sessions = self.sessions();
            if sessions.contains_key(&tour.id) {
                return Err(TourError::AlreadyDownloading(tour.id.to_string()));
            }
            sessions.insert(tour.id.clone(), Arc::clone(&cancel));
        }
        let _session = SessionGuard {
            sessions: &self.sessions,
            tour: tour.id.clone(),
        };

        let plan = self.plan(tour);
        let total = plan.len();
        info!(tour = %tour.id, total, "starting offline download");

        // Leftovers of an interrupted session are never reused.
        let outcome = Store::remove_dir(&self.store.staging_dir(&tour.id))
            .and_then(|_| self.run_session(tour, &plan, &cancel, sink));

        match outcome {
            Ok(cached) => Ok(cached),
            Err(err) => {
                warn!(tour = %tour.id, error = %err, "download aborted");
                self.discard_staging(&tour.id);
                sink.progress(&DownloadProgress {
                    tour_id: tour.id.clone(),
                    done: 0,
                    total,
                    label: String::new(),
                    status: DownloadStatus::Error,
                    message: Some(err.to_string()),
                });
                Ok(false)
            }
        }
    }

    fn run_session(
        &self,
        tour: &TourDefinition,
        plan: &[PlannedAsset],
        cancel: &AtomicBool,
        sink: &dyn DownloadSink,
    ) -> Result<bool, TourError> {
        let total = plan.len();
        let mut stored = Vec::with_capacity(total);

        for (index, asset) in plan.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            match self.fetcher.fetch(&asset.url, &asset.staged) {
                FetchOutcome::Stored => stored.push(asset),
                FetchOutcome::Failed => warn!(
                    tour = %tour.id,
                    label = %asset.label,
                    "skipping asset after failed download"
                ),
                FetchOutcome::StorageExhausted => {
                    return Err(TourError::StorageFull(format!(
                        "no space left while downloading {}",
                        asset.label
                    )));
                }
            }
            sink.progress(&DownloadProgress {
                tour_id: tour.id.clone(),
                done: index + 1,
                total,
                label: asset.label.clone(),
                status: DownloadStatus::Downloading,
                message: None,
            });
        }

        // A file finishing after the request is discarded along with the rest.
        if cancel.load(Ordering::SeqCst) {
            info!(tour = %tour.id, "download cancelled; cleaning up");
            self.discard_staging(&tour.id);
            sink.progress(&DownloadProgress {
                tour_id: tour.id.clone(),
                done: stored.len(),
                total,
                label: String::new(),
                status: DownloadStatus::Cancelled,
                message: None,
            });
            return Ok(false);
        }

        if total > 0 && stored.is_empty() {
            warn!(tour = %tour.id, "every asset failed; nothing cached");
            self.discard_staging(&tour.id);
            sink.progress(&DownloadProgress {
                tour_id: tour.id.clone(),
                done: total,
                total,
                label: String::new(),
                status: DownloadStatus::Error,
                message: Some("no asset could be downloaded".to_string()),
            });
            return Ok(false);
        }

        let manifest = self.commit(tour, &stored)?;
        info!(
            tour = %tour.id,
            files = manifest.file_count(),
            skipped = total - stored.len(),
            size = manifest.size,
            "tour available offline"
        );
        sink.progress(&DownloadProgress {
            tour_id: tour.id.clone(),
            done: total,
            total,
            label: String::new(),
            status: DownloadStatus::Completed,
            message: (stored.len() < total)
                .then(|| format!("{} of {total} assets unavailable", total - stored.len())),
        });
        Ok(true)
    }

    /// Swaps the staged files in for the previous copy, then writes the manifest.
    fn commit(
        &self,
        tour: &TourDefinition,
        stored: &[&PlannedAsset],
    ) -> Result<AssetManifest, TourError> {
        let staging = self.store.staging_dir(&tour.id);
        let tour_dir = self.store.tour_dir(&tour.id);
        if staging.exists() {
            Store::replace_dir(&staging, &tour_dir)?;
        } else {
            Store::remove_dir(&tour_dir)?;
        }
        let manifest = self.build_manifest(tour, stored);
        if let Err(err) = Store::write_json(&self.store.manifest_path(&tour.id), &manifest) {
            // The previous manifest no longer matches the files on disk.
            self.purge(&tour.id);
            return Err(err);
        }
        Ok(manifest)
    }

    fn discard_staging(&self, tour: &TourId) {
        if let Err(err) = Store::remove_dir(&self.store.staging_dir(tour)) {
            warn!(%tour, error = %err, "cannot remove partial files");
        }
    }

    /// Cover image, stop images, then stop audio. Sources that are already local
    /// are left out.
    fn plan(&self, tour: &TourDefinition) -> Vec<PlannedAsset> {
        let mut images = Vec::new();
        let mut audio = Vec::new();

        if let Some(AssetSource::Remote(url)) = tour.cover_source() {
            let key = AssetRef::Image(ImageKey::Cover);
            images.push(self.planned(tour, AssetKind::Image, key, url));
        }
        for stop in &tour.stops {
            if let Some(AssetSource::Remote(url)) = stop.image_source() {
                let key = AssetRef::Image(ImageKey::Stop(stop.id.clone()));
                images.push(self.planned(tour, AssetKind::Image, key, url));
            }
            if let Some(AssetSource::Remote(url)) = stop.audio_source() {
                let key = AssetRef::Audio(stop.id.clone());
                audio.push(self.planned(tour, AssetKind::Audio, key, url));
            }
        }
        debug!(tour = %tour.id, images = images.len(), audio = audio.len(), "download planned");
        images.extend(audio);
        images
    }

    fn planned(
        &self,
        tour: &TourDefinition,
        kind: AssetKind,
        key: AssetRef,
        url: String,
    ) -> PlannedAsset {
        let (stem, label) = match &key {
            AssetRef::Image(image) => (image.file_stem(), format!("image {image}")),
            AssetRef::Audio(stop) => (stop.to_string(), format!("audio {stop}")),
        };
        let ext = url_extension(&url).unwrap_or_else(|| kind.default_extension().to_string());
        let staging = self.store.staging_dir(&tour.id);
        PlannedAsset {
            kind,
            staged: Store::asset_path_in(&staging, kind, &stem, &ext),
            destination: self.store.asset_path(&tour.id, kind, &stem, &ext),
            key,
            url,
            label,
        }
    }

    fn build_manifest(&self, tour: &TourDefinition, stored: &[&PlannedAsset]) -> AssetManifest {
        let mut audio_files = BTreeMap::new();
        let mut image_files = BTreeMap::new();
        let mut size = 0u64;
        for asset in stored {
            size += Store::file_size(&asset.destination).unwrap_or(match asset.kind {
                AssetKind::Audio => self.estimates.audio_bytes,
                AssetKind::Image => self.estimates.image_bytes,
            });
            match &asset.key {
                AssetRef::Audio(stop) => {
                    audio_files.insert(stop.clone(), asset.destination.clone());
                }
                AssetRef::Image(key) => {
                    image_files.insert(key.clone(), asset.destination.clone());
                }
            }
        }
        AssetManifest {
            tour_id: tour.id.clone(),
            downloaded_at: Utc::now(),
            size,
            audio_files,
            image_files,
            tour_snapshot: tour.clone(),
        }
    }
}

/// Lowercase extension of the last path segment, ignoring query and fragment.
fn url_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    let valid =
        !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|ch| ch.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}
