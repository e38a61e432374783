use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::cache::{ContentCache, DownloadSink};
use crate::config::ResolvedConfig;
use crate::domain::{AssetManifest, Reachability, TourDefinition, TourId};
use crate::error::TourError;
use crate::fetcher::{AssetFetcher, HttpTransport, Transport};
use crate::mapping::StopTourIndex;
use crate::progress::ProgressStore;
use crate::reconciler::ProgressReconciler;
use crate::remote::{ProgressBackend, RestClient, TourSource, Unconfigured};
use crate::resolve::Resolution;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct TourStatus {
    pub tour_id: TourId,
    pub available_offline: bool,
    pub downloading: bool,
    pub size: Option<u64>,
    pub files: Option<usize>,
    pub downloaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub tour_id: TourId,
    pub cached: bool,
    pub status: TourStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub tour_id: TourId,
    pub title: String,
    pub stops: usize,
    pub size: u64,
    pub downloaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub tours: Vec<ListEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageResult {
    pub tours: usize,
    pub bytes: u64,
}

impl From<&AssetManifest> for ListEntry {
    fn from(manifest: &AssetManifest) -> Self {
        Self {
            tour_id: manifest.tour_id.clone(),
            title: manifest.tour_snapshot.title.clone(),
            stops: manifest.tour_snapshot.stops.len(),
            size: manifest.size,
            downloaded_at: manifest.downloaded_at,
        }
    }
}

pub type DynTourSource = Arc<dyn TourSource>;
pub type DynBackend = Arc<dyn ProgressBackend>;
pub type HttpApp = App<HttpTransport, DynTourSource, DynBackend>;

/// Service object owning the content cache and the progress reconciler.
/// Built once at startup and handed to whatever needs it.
pub struct App<T: Transport, S: TourSource, B: ProgressBackend> {
    cache: ContentCache<T, S>,
    progress: ProgressReconciler<B>,
}

impl<T: Transport, S: TourSource, B: ProgressBackend> App<T, S, B> {
    pub fn new(
        store: Store,
        config: &ResolvedConfig,
        transport: T,
        tours: S,
        backend: B,
    ) -> Self {
        let index = Arc::new(StopTourIndex::new(store.clone(), config.mapping_ttl));
        let fetcher = AssetFetcher::new(transport, config.fetch);
        let cache = ContentCache::new(store.clone(), fetcher, tours, config.size_estimates);
        let progress = ProgressReconciler::new(
            ProgressStore::new(store, Arc::clone(&index)),
            index,
            backend,
        );
        Self { cache, progress }
    }

    pub fn cache(&self) -> &ContentCache<T, S> {
        &self.cache
    }

    pub fn progress(&self) -> &ProgressReconciler<B> {
        &self.progress
    }

    pub fn tour_status(&self, tour: &TourId) -> TourStatus {
        let manifest = self.cache.get_manifest(tour);
        TourStatus {
            tour_id: tour.clone(),
            available_offline: manifest.is_some(),
            downloading: self.cache.is_downloading(tour),
            size: manifest.as_ref().map(|manifest| manifest.size),
            files: manifest.as_ref().map(AssetManifest::file_count),
            downloaded_at: manifest.as_ref().map(|manifest| manifest.downloaded_at),
        }
    }

    /// Downloads a tour given either a definition file or a tour id. An id is
    /// looked up through the cached snapshot first, then the remote.
    pub fn download(
        &self,
        source: &str,
        reachability: Reachability,
        sink: &dyn DownloadSink,
    ) -> Result<DownloadResult, TourError> {
        let tour = if Path::new(source).is_file() {
            load_tour_file(Path::new(source))?
        } else {
            let id: TourId = source.parse()?;
            match self.cache.resolve_tour(&id, reachability) {
                Resolution::Local(tour) | Resolution::Remote(tour) => tour,
                Resolution::Unavailable => return Err(TourError::TourNotFound(id.to_string())),
            }
        };
        let cached = self.cache.download(&tour, sink)?;
        Ok(DownloadResult {
            status: self.tour_status(&tour.id),
            tour_id: tour.id,
            cached,
        })
    }

    pub fn list(&self) -> ListResult {
        ListResult {
            tours: self.cache.list_manifests().iter().map(ListEntry::from).collect(),
        }
    }

    pub fn usage(&self) -> UsageResult {
        let manifests = self.cache.list_manifests();
        UsageResult {
            tours: manifests.len(),
            bytes: manifests.iter().map(|manifest| manifest.size).sum(),
        }
    }
}

impl HttpApp {
    /// Wires the HTTP transport and, when configured, the REST backend.
    pub fn from_config(config: &ResolvedConfig) -> Result<Self, TourError> {
        let store = match &config.data_dir {
            Some(dir) => Store::new_with_root(dir.clone()),
            None => Store::new()?,
        };
        let transport = HttpTransport::new(config.fetch.timeout)?;
        let (tours, backend): (DynTourSource, DynBackend) = match &config.remote {
            Some(settings) => {
                let client = Arc::new(RestClient::new(settings)?);
                let tours: DynTourSource = client.clone();
                let backend: DynBackend = client;
                (tours, backend)
            }
            None => {
                debug!("no remote configured; running offline only");
                let tours: DynTourSource = Arc::new(Unconfigured);
                let backend: DynBackend = Arc::new(Unconfigured);
                (tours, backend)
            }
        };
        Ok(App::new(store, config, transport, tours, backend))
    }
}

pub fn load_tour_file(path: &Path) -> Result<TourDefinition, TourError> {
    let content =
        fs::read_to_string(path).map_err(|err| TourError::Filesystem(err.to_string()))?;
    serde_json::from_str(&content).map_err(|err| TourError::TourParse(err.to_string()))
}
