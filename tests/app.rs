use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use offline_tours::app::{App, load_tour_file};
use offline_tours::config::{FetchSettings, ResolvedConfig};
use offline_tours::domain::{Reachability, StopDefinition, TourDefinition, TourId};
use offline_tours::error::TourError;
use offline_tours::fetcher::Transport;
use offline_tours::output::JsonOutput;
use offline_tours::remote::{TourSource, Unconfigured};
use offline_tours::store::Store;

struct FixedBody;

impl Transport for FixedBody {
    fn download(&self, _url: &str, destination: &Path) -> Result<u64, TourError> {
        fs::write(destination, b"0123456789").unwrap();
        Ok(10)
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

fn tour(id: &str) -> TourDefinition {
    TourDefinition {
        id: id.parse().unwrap(),
        title: format!("Tour {id}"),
        description: Some("A walk".to_string()),
        image_url: None,
        stops: vec![StopDefinition {
            id: "s1".parse().unwrap(),
            title: "First".to_string(),
            position: Some(1),
            latitude: None,
            longitude: None,
            trigger_radius_m: None,
            audio_url: Some(format!("https://cdn.example.com/{id}/s1.mp3")),
            image_url: Some(format!("https://cdn.example.com/{id}/s1.jpg")),
        }],
    }
}

fn app(
    temp: &tempfile::TempDir,
    source: MockSource,
) -> App<FixedBody, MockSource, Unconfigured> {
    let store = Store::new_with_root(
        Utf8PathBuf::from_path_buf(temp.path().join("data")).unwrap(),
    );
    let config = ResolvedConfig {
        fetch: FetchSettings {
            max_attempts: 1,
            backoff_base: Duration::ZERO,
            timeout: Duration::from_secs(1),
        },
        ..ResolvedConfig::default()
    };
    App::new(store, &config, FixedBody, source, Unconfigured)
}

#[test]
fn download_from_definition_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("harbour.json");
    fs::write(&path, serde_json::to_string(&tour("harbour")).unwrap()).unwrap();
    let app = app(&temp, MockSource::default());

    let result = app
        .download(path.to_str().unwrap(), Reachability::Offline, &JsonOutput)
        .unwrap();

    assert!(result.cached);
    assert!(result.status.available_offline);
    assert_eq!(result.status.files, Some(2));
    assert_eq!(result.status.size, Some(20));
    assert_eq!(*app.cache().source().calls.lock().unwrap(), 0);
}

#[test]
fn download_by_id_uses_remote_definition() {
    let temp = tempfile::tempdir().unwrap();
    let source = MockSource {
        tours: vec![tour("harbour")],
        ..MockSource::default()
    };
    let app = app(&temp, source);

    let result = app
        .download("harbour", Reachability::Unknown, &JsonOutput)
        .unwrap();
    assert!(result.cached);

    let missing = app.download("nowhere", Reachability::Online, &JsonOutput);
    assert_matches!(missing, Err(TourError::TourNotFound(_)));
}

#[test]
fn download_by_id_offline_needs_a_cached_snapshot() {
    let temp = tempfile::tempdir().unwrap();
    let app = app(&temp, MockSource::default());

    let result = app.download("harbour", Reachability::Offline, &JsonOutput);

    assert_matches!(result, Err(TourError::TourNotFound(_)));
    assert_eq!(*app.cache().source().calls.lock().unwrap(), 0);
}

#[test]
fn list_usage_and_status() {
    let temp = tempfile::tempdir().unwrap();
    let app = app(&temp, MockSource::default());
    for id in ["zoo", "harbour"] {
        app.cache()
            .download(&tour(id), &JsonOutput)
            .unwrap();
    }

    let list = app.list();
    let ids: Vec<&str> = list.tours.iter().map(|entry| entry.tour_id.as_str()).collect();
    assert_eq!(ids, vec!["harbour", "zoo"]);
    assert_eq!(list.tours[0].stops, 1);

    let usage = app.usage();
    assert_eq!(usage.tours, 2);
    assert_eq!(usage.bytes, 40);

    let zoo: TourId = "zoo".parse().unwrap();
    app.cache().remove_content(&zoo).unwrap();
    let status = app.tour_status(&zoo);
    assert!(!status.available_offline);
    assert!(!status.downloading);
    assert_eq!(status.size, None);
    assert_eq!(app.usage().tours, 1);
}

#[test]
fn progress_degrades_without_backend() {
    let temp = tempfile::tempdir().unwrap();
    let app = app(&temp, MockSource::default());
    let user = "u1".parse().unwrap();

    let outcome = app
        .progress()
        .mark_completed(&user, &"s1".parse().unwrap(), None, Reachability::Unknown)
        .unwrap();

    assert_eq!(outcome, offline_tours::reconciler::MarkOutcome::Pending);
    assert_eq!(
        app.progress()
            .get_total_completed_count(&user, Reachability::Unknown)
            .unwrap(),
        1
    );
}

#[test]
fn malformed_definition_file_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("broken.json");
    fs::write(&path, r#"{ "title": "no id" }"#).unwrap();

    assert_matches!(load_tour_file(&path), Err(TourError::TourParse(_)));
}
