use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use offline_tours::cache::{ContentCache, DownloadProgress, DownloadStatus};
use offline_tours::config::{FetchSettings, SizeEstimates};
use offline_tours::domain::{
    ImageKey, Reachability, StopDefinition, StopId, TourDefinition, TourId,
};
use offline_tours::error::TourError;
use offline_tours::fetcher::{AssetFetcher, Transport};
use offline_tours::remote::TourSource;
use offline_tours::resolve::{AssetLocation, AssetRef, Resolution};
use offline_tours::store::Store;

/// Serves fixed bodies per URL; URLs listed in `failing` always error.
#[derive(Default)]
struct MockTransport {
    bodies: HashMap<String, Vec<u8>>,
    failing: Vec<String>,
    /// Every call fails while set.
    down: Mutex<bool>,
    /// Calls after this many report a full disk.
    full_after: Option<usize>,
    calls: Mutex<Vec<String>>,
}

impl MockTransport {
    fn serving(tour: &TourDefinition) -> Self {
        let mut bodies = HashMap::new();
        let urls = tour
            .image_url
            .iter()
            .chain(tour.stops.iter().flat_map(|stop| stop.image_url.iter()))
            .chain(tour.stops.iter().flat_map(|stop| stop.audio_url.iter()));
        for (index, url) in urls.enumerate() {
            bodies.insert(url.clone(), vec![b'x'; 100 * (index + 1)]);
        }
        Self {
            bodies,
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|call| *call == url).count()
    }

    fn set_down(&self, down: bool) {
        *self.down.lock().unwrap() = down;
    }
}

impl Transport for MockTransport {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, TourError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(url.to_string());
            calls.len()
        };
        if *self.down.lock().unwrap() {
            return Err(TourError::Transfer("network unreachable".to_string()));
        }
        if self.full_after.is_some_and(|limit| call > limit) {
            fs::write(destination, b"pa").unwrap();
            return Err(TourError::from_write(io::Error::from(io::ErrorKind::StorageFull)));
        }
        if self.failing.iter().any(|failing| failing == url) {
            fs::write(destination, b"par").unwrap();
            return Err(TourError::Transfer("connection reset".to_string()));
        }
        let body = self
            .bodies
            .get(url)
            .ok_or_else(|| TourError::RemoteStatus {
                status: 404,
                message: url.to_string(),
            })?;
        fs::write(destination, body).unwrap();
        Ok(body.len() as u64)
    }
}

#[derive(Default)]
struct MockSource {
    tours: Vec<TourDefinition>,
    calls: Mutex<usize>,
}

impl TourSource for MockSource {
    fn fetch_tour(&self, id: &TourId) -> Result<Option<TourDefinition>, TourError> {
        *self.calls.lock().unwrap() += 1;
        Ok(self.tours.iter().find(|tour| &tour.id == id).cloned())
    }
}

fn stop(id: &str, position: u32) -> StopDefinition {
    StopDefinition {
        id: id.parse().unwrap(),
        title: format!("Stop {id}"),
        position: Some(position),
        latitude: Some(48.85),
        longitude: Some(2.35),
        trigger_radius_m: Some(30.0),
        audio_url: Some(format!("https://cdn.example.com/audio/{id}.mp3")),
        image_url: Some(format!("https://cdn.example.com/img/{id}.jpg")),
    }
}

/// Cover plus two stops with image and audio each: five assets.
fn sample_tour() -> TourDefinition {
    TourDefinition {
        id: "old-town".parse().unwrap(),
        title: "Old Town".to_string(),
        description: None,
        image_url: Some("https://cdn.example.com/img/cover.png".to_string()),
        stops: vec![stop("s1", 1), stop("s2", 2)],
    }
}

fn cache_with(
    temp: &tempfile::TempDir,
    transport: MockTransport,
    source: MockSource,
) -> ContentCache<MockTransport, MockSource> {
    let store =
        Store::new_with_root(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());
    let settings = FetchSettings {
        max_attempts: 3,
        backoff_base: Duration::ZERO,
        timeout: Duration::from_secs(5),
    };
    ContentCache::new(
        store,
        AssetFetcher::new(transport, settings),
        source,
        SizeEstimates::default(),
    )
}

fn recorder() -> Mutex<Vec<DownloadProgress>> {
    Mutex::new(Vec::new())
}

#[test]
fn download_caches_every_asset_and_reports_progress() {
    let temp = tempfile::tempdir().unwrap();
    let tour = sample_tour();
    let cache = cache_with(&temp, MockTransport::serving(&tour), MockSource::default());
    let events = recorder();

    let cached = cache
        .download(&tour, &|update: &DownloadProgress| {
            events.lock().unwrap().push(update.clone())
        })
        .unwrap();

    assert!(cached);
    let events = events.into_inner().unwrap();
    assert_eq!(events.len(), 6);
    let done: Vec<usize> = events[..5].iter().map(|event| event.done).collect();
    assert_eq!(done, vec![1, 2, 3, 4, 5]);
    assert!(events[..5]
        .iter()
        .all(|event| event.status == DownloadStatus::Downloading && event.total == 5));
    assert_eq!(events[5].status, DownloadStatus::Completed);
    assert_eq!(events[5].message, None);

    let manifest = cache.get_manifest(&tour.id).unwrap();
    assert_eq!(manifest.audio_files.len(), 2);
    assert_eq!(manifest.image_files.len(), 3);
    assert_eq!(manifest.size, 100 + 200 + 300 + 400 + 500);
    assert_eq!(manifest.tour_snapshot, tour);
    assert!(cache.is_available_offline(&tour.id));
    assert!(!cache.is_downloading(&tour.id));

    let s1: StopId = "s1".parse().unwrap();
    let audio = cache.get_audio_path(&tour.id, &s1).unwrap();
    assert!(audio.ends_with("tours/old-town/audio/s1.mp3"));
    let cover = cache.get_image_path(&tour.id, &ImageKey::Cover).unwrap();
    assert!(cover.ends_with("tours/old-town/images/cover.png"));
    assert_eq!(cache.get_storage_usage(), manifest.size);
}

#[test]
fn cancel_mid_download_leaves_nothing_behind() {
    let temp = tempfile::tempdir().unwrap();
    let tour = sample_tour();
    let cache = cache_with(&temp, MockTransport::serving(&tour), MockSource::default());
    let events = recorder();

    let cached = cache
        .download(&tour, &|update: &DownloadProgress| {
            if update.status == DownloadStatus::Downloading && update.done == 2 {
                assert!(cache.cancel_download(&update.tour_id));
            }
            events.lock().unwrap().push(update.clone());
        })
        .unwrap();

    assert!(!cached);
    let events = events.into_inner().unwrap();
    assert_eq!(events.last().unwrap().status, DownloadStatus::Cancelled);
    assert!(events.iter().all(|event| event.status != DownloadStatus::Completed));
    assert!(cache.get_manifest(&tour.id).is_none());
    assert!(!cache.store().manifest_path(&tour.id).exists());
    assert!(!cache.store().tour_dir(&tour.id).exists());
    assert!(!cache.is_downloading(&tour.id));
    assert!(!cache.cancel_download(&tour.id));
}

#[test]
fn failing_asset_is_skipped_after_retries() {
    let temp = tempfile::tempdir().unwrap();
    let tour = sample_tour();
    let broken = "https://cdn.example.com/audio/s2.mp3".to_string();
    let mut transport = MockTransport::serving(&tour);
    transport.failing.push(broken.clone());
    let cache = cache_with(&temp, transport, MockSource::default());
    let events = recorder();

    let cached = cache
        .download(&tour, &|update: &DownloadProgress| {
            events.lock().unwrap().push(update.clone())
        })
        .unwrap();

    assert!(cached);
    let last = events.into_inner().unwrap().pop().unwrap();
    assert_eq!(last.status, DownloadStatus::Completed);
    assert!(last.message.is_some());

    let manifest = cache.get_manifest(&tour.id).unwrap();
    assert_eq!(manifest.file_count(), 4);
    assert!(!manifest.audio_files.contains_key(&"s2".parse::<StopId>().unwrap()));
    // The failing audio is the fifth body (500 bytes) and is left out.
    assert_eq!(manifest.size, 100 + 200 + 300 + 400);
    assert!(!cache.store().tour_dir(&tour.id).join("audio/s2.mp3").exists());
}

#[test]
fn every_asset_failing_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let tour = sample_tour();
    let cache = cache_with(&temp, MockTransport::default(), MockSource::default());
    let events = recorder();

    let cached = cache
        .download(&tour, &|update: &DownloadProgress| {
            events.lock().unwrap().push(update.clone())
        })
        .unwrap();

    assert!(!cached);
    let last = events.into_inner().unwrap().pop().unwrap();
    assert_eq!(last.status, DownloadStatus::Error);
    assert!(!cache.is_available_offline(&tour.id));
    assert!(!cache.store().tour_dir(&tour.id).exists());
}

#[test]
fn retries_use_the_configured_attempts() {
    let temp = tempfile::tempdir().unwrap();
    let tour = sample_tour();
    let broken = "https://cdn.example.com/img/s1.jpg".to_string();
    let mut transport = MockTransport::serving(&tour);
    transport.failing.push(broken.clone());
    let cache = cache_with(&temp, transport, MockSource::default());

    cache.download(&tour, &|_: &DownloadProgress| {}).unwrap();

    assert_eq!(cache.fetcher().transport().calls_for(&broken), 3);
    assert_eq!(cache.get_manifest(&tour.id).unwrap().file_count(), 4);
}

#[test]
fn externally_deleted_file_purges_the_manifest() {
    let temp = tempfile::tempdir().unwrap();
    let tour = sample_tour();
    let cache = cache_with(&temp, MockTransport::serving(&tour), MockSource::default());
    cache.download(&tour, &|_: &DownloadProgress| {}).unwrap();

    let s1: StopId = "s1".parse().unwrap();
    let audio = cache.get_audio_path(&tour.id, &s1).unwrap();
    fs::remove_file(&audio).unwrap();

    assert!(cache.get_manifest(&tour.id).is_none());
    assert!(!cache.is_available_offline(&tour.id));
    assert!(!cache.store().manifest_path(&tour.id).exists());
    assert!(!cache.store().tour_dir(&tour.id).exists());
    assert!(cache.list_manifests().is_empty());
}

#[test]
fn empty_file_counts_as_missing() {
    let temp = tempfile::tempdir().unwrap();
    let tour = sample_tour();
    let cache = cache_with(&temp, MockTransport::serving(&tour), MockSource::default());
    cache.download(&tour, &|_: &DownloadProgress| {}).unwrap();

    let cover = cache.get_image_path(&tour.id, &ImageKey::Cover).unwrap();
    fs::write(&cover, b"").unwrap();

    assert!(cache.get_manifest(&tour.id).is_none());
}

#[test]
fn second_download_of_same_tour_is_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let tour = sample_tour();
    let cache = cache_with(&temp, MockTransport::serving(&tour), MockSource::default());
    let nested = Mutex::new(None);

    let cached = cache
        .download(&tour, &|update: &DownloadProgress| {
            if update.done == 1 && update.status == DownloadStatus::Downloading {
                assert!(cache.is_downloading(&tour.id));
                let result = cache.download(&tour, &|_: &DownloadProgress| {});
                *nested.lock().unwrap() = Some(result);
            }
        })
        .unwrap();

    assert!(cached);
    assert_matches!(
        nested.into_inner().unwrap(),
        Some(Err(TourError::AlreadyDownloading(_)))
    );
    assert!(cache.is_available_offline(&tour.id));
}

#[test]
fn redownload_replaces_previous_copy() {
    let temp = tempfile::tempdir().unwrap();
    let tour = sample_tour();
    let cache = cache_with(&temp, MockTransport::serving(&tour), MockSource::default());
    cache.download(&tour, &|_: &DownloadProgress| {}).unwrap();
    let first = cache.get_manifest(&tour.id).unwrap();

    cache.download(&tour, &|_: &DownloadProgress| {}).unwrap();
    let second = cache.get_manifest(&tour.id).unwrap();

    assert_eq!(first.size, second.size);
    assert_eq!(cache.list_manifests().len(), 1);
}

#[test]
fn failed_redownload_keeps_previous_copy() {
    let temp = tempfile::tempdir().unwrap();
    let tour = sample_tour();
    let cache = cache_with(&temp, MockTransport::serving(&tour), MockSource::default());
    assert!(cache.download(&tour, &|_: &DownloadProgress| {}).unwrap());
    let before = cache.get_manifest(&tour.id).unwrap();

    cache.fetcher().transport().set_down(true);
    let events = recorder();
    let cached = cache
        .download(&tour, &|update: &DownloadProgress| {
            events.lock().unwrap().push(update.clone())
        })
        .unwrap();

    assert!(!cached);
    assert_eq!(events.into_inner().unwrap().pop().unwrap().status, DownloadStatus::Error);
    assert!(cache.is_available_offline(&tour.id));
    assert_eq!(cache.get_manifest(&tour.id).unwrap().size, before.size);
    let s1: StopId = "s1".parse().unwrap();
    assert!(cache.get_audio_path(&tour.id, &s1).unwrap().exists());
    assert!(!cache.store().staging_dir(&tour.id).exists());
}

#[test]
fn cancelled_redownload_keeps_previous_copy() {
    let temp = tempfile::tempdir().unwrap();
    let tour = sample_tour();
    let cache = cache_with(&temp, MockTransport::serving(&tour), MockSource::default());
    cache.download(&tour, &|_: &DownloadProgress| {}).unwrap();

    let cached = cache
        .download(&tour, &|update: &DownloadProgress| {
            if update.status == DownloadStatus::Downloading && update.done == 3 {
                cache.cancel_download(&update.tour_id);
            }
        })
        .unwrap();

    assert!(!cached);
    assert!(cache.is_available_offline(&tour.id));
    assert_eq!(cache.get_manifest(&tour.id).unwrap().file_count(), 5);
    assert!(!cache.store().staging_dir(&tour.id).exists());
}

#[test]
fn full_disk_aborts_the_session() {
    let temp = tempfile::tempdir().unwrap();
    let tour = sample_tour();
    let transport = MockTransport {
        full_after: Some(2),
        ..MockTransport::serving(&tour)
    };
    let cache = cache_with(&temp, transport, MockSource::default());
    let events = recorder();

    let cached = cache
        .download(&tour, &|update: &DownloadProgress| {
            events.lock().unwrap().push(update.clone())
        })
        .unwrap();

    assert!(!cached);
    let events = events.into_inner().unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.status, DownloadStatus::Error);
    assert_matches!(&last.message, Some(message) if message.contains("storage full"));
    assert!(events.iter().all(|event| event.status != DownloadStatus::Completed));
    // Two files stored, the third hit the full disk and was not retried.
    assert_eq!(cache_transport_calls(&cache), 3);
    assert!(!cache.is_available_offline(&tour.id));
    assert!(!cache.store().manifest_path(&tour.id).exists());
    assert!(!cache.store().tour_dir(&tour.id).exists());
    assert!(!cache.store().staging_dir(&tour.id).exists());
}

#[test]
fn remove_content_is_idempotent() {
    let temp = tempfile::tempdir().unwrap();
    let tour = sample_tour();
    let cache = cache_with(&temp, MockTransport::serving(&tour), MockSource::default());
    cache.download(&tour, &|_: &DownloadProgress| {}).unwrap();

    cache.remove_content(&tour.id).unwrap();
    cache.remove_content(&tour.id).unwrap();

    assert!(!cache.is_available_offline(&tour.id));
    assert_eq!(cache.get_storage_usage(), 0);
}

#[test]
fn cached_content_resolves_without_network() {
    let temp = tempfile::tempdir().unwrap();
    let tour = sample_tour();
    let source = MockSource {
        tours: vec![tour.clone()],
        ..MockSource::default()
    };
    let cache = cache_with(&temp, MockTransport::serving(&tour), source);
    cache.download(&tour, &|_: &DownloadProgress| {}).unwrap();
    let transport_calls = cache_transport_calls(&cache);

    assert_matches!(
        cache.resolve_tour(&tour.id, Reachability::Online),
        Resolution::Local(_)
    );
    let s2: StopId = "s2".parse().unwrap();
    assert_matches!(
        cache.resolve_asset(&tour.id, &AssetRef::Audio(s2), Reachability::Online),
        Some(AssetLocation::File(_))
    );

    assert_eq!(*source_calls(&cache), 0);
    assert_eq!(cache_transport_calls(&cache), transport_calls);
}

#[test]
fn uncached_tour_depends_on_reachability() {
    let temp = tempfile::tempdir().unwrap();
    let tour = sample_tour();
    let source = MockSource {
        tours: vec![tour.clone()],
        ..MockSource::default()
    };
    let cache = cache_with(&temp, MockTransport::default(), source);

    assert_matches!(
        cache.resolve_tour(&tour.id, Reachability::Offline),
        Resolution::Unavailable
    );
    assert_eq!(*source_calls(&cache), 0);

    assert_matches!(
        cache.resolve_tour(&tour.id, Reachability::Unknown),
        Resolution::Remote(_)
    );
    let s1: StopId = "s1".parse().unwrap();
    assert_eq!(
        cache.resolve_asset(&tour.id, &AssetRef::Audio(s1), Reachability::Online),
        Some(AssetLocation::Url(
            "https://cdn.example.com/audio/s1.mp3".to_string()
        ))
    );
    assert_eq!(*source_calls(&cache), 2);
}

#[test]
fn bundled_files_are_not_downloaded_but_resolve() {
    let temp = tempfile::tempdir().unwrap();
    let bundled = temp.path().join("bundled-s1.mp3");
    fs::write(&bundled, b"bundled audio").unwrap();

    let mut tour = sample_tour();
    tour.stops[0].audio_url = Some(format!("file://{}", bundled.display()));
    let cache = cache_with(&temp, MockTransport::serving(&tour), MockSource::default());

    cache.download(&tour, &|_: &DownloadProgress| {}).unwrap();

    let manifest = cache.get_manifest(&tour.id).unwrap();
    assert_eq!(manifest.file_count(), 4);
    let s1: StopId = "s1".parse().unwrap();
    assert_eq!(
        cache.resolve_asset(&tour.id, &AssetRef::Audio(s1), Reachability::Offline),
        Some(AssetLocation::File(
            Utf8PathBuf::from_path_buf(bundled).unwrap()
        ))
    );
}

fn cache_transport_calls(cache: &ContentCache<MockTransport, MockSource>) -> usize {
    cache.fetcher().transport().calls()
}

fn source_calls(cache: &ContentCache<MockTransport, MockSource>) -> MutexGuard<'_, usize> {
    cache.source().calls.lock().unwrap()
}

#[test]
fn bundled_files_resolve_offline_before_any_download() {
    let temp = tempfile::tempdir().unwrap();
    let bundled = temp.path().join("bundled-s1.mp3");
    fs::write(&bundled, b"bundled audio").unwrap();

    let mut tour = sample_tour();
    tour.stops[0].audio_url = Some(format!("file://{}", bundled.display()));
    let cache = cache_with(&temp, MockTransport::default(), MockSource::default());
    let s1 = AssetRef::Audio("s1".parse().unwrap());
    let s2 = AssetRef::Audio("s2".parse().unwrap());

    assert_eq!(
        cache.resolve_definition_asset(&tour, &s1, Reachability::Offline),
        Some(AssetLocation::File(
            Utf8PathBuf::from_path_buf(bundled).unwrap()
        ))
    );
    assert_eq!(cache.resolve_definition_asset(&tour, &s2, Reachability::Offline), None);
    assert_matches!(
        cache.resolve_definition_asset(&tour, &s2, Reachability::Online),
        Some(AssetLocation::Url(url)) if url.ends_with("s2.mp3")
    );
    assert_eq!(cache_transport_calls(&cache), 0);
    assert_eq!(*source_calls(&cache), 0);
}
