use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TourError;

const MAX_ID_LEN: usize = 128;

fn is_valid_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_ID_LEN
        && !value.starts_with('.')
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
}

// Ids end up as path components, so they are validated on every construction path.
macro_rules! id_type {
    ($name:ident, $err:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = TourError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                let normalized = value.trim();
                if !is_valid_id(normalized) {
                    return Err(TourError::$err(value.to_string()));
                }
                Ok(Self(normalized.to_string()))
            }
        }

        impl TryFrom<String> for $name {
            type Error = TourError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

id_type!(TourId, InvalidTourId);
id_type!(StopId, InvalidStopId);
id_type!(UserId, InvalidUserId);

/// Key of an image inside a manifest: the tour cover or the image of one stop.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ImageKey {
    Cover,
    Stop(StopId),
}

impl ImageKey {
    pub fn file_stem(&self) -> String {
        match self {
            ImageKey::Cover => "cover".to_string(),
            ImageKey::Stop(id) => format!("stop-{id}"),
        }
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKey::Cover => write!(f, "cover"),
            ImageKey::Stop(id) => write!(f, "stop:{id}"),
        }
    }
}

impl FromStr for ImageKey {
    type Err = TourError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed == "cover" {
            return Ok(ImageKey::Cover);
        }
        match trimmed.split_once(':') {
            Some(("stop", rest)) => Ok(ImageKey::Stop(
                rest.parse()
                    .map_err(|_| TourError::InvalidImageKey(value.to_string()))?,
            )),
            _ => Err(TourError::InvalidImageKey(value.to_string())),
        }
    }
}

impl TryFrom<String> for ImageKey {
    type Error = TourError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageKey> for String {
    fn from(value: ImageKey) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Audio,
    Image,
}

impl AssetKind {
    pub fn default_extension(self) -> &'static str {
        match self {
            AssetKind::Audio => "mp3",
            AssetKind::Image => "jpg",
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            AssetKind::Audio => "audio",
            AssetKind::Image => "images",
        }
    }
}

/// Where an asset referenced by a tour definition lives before any download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    Remote(String),
    Local(Utf8PathBuf),
}

impl AssetSource {
    pub fn classify(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Some(path) = trimmed.strip_prefix("file://") {
            return Some(AssetSource::Local(Utf8PathBuf::from(path)));
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Some(AssetSource::Remote(trimmed.to_string()));
        }
        if Utf8Path::new(trimmed).is_absolute() {
            return Some(AssetSource::Local(Utf8PathBuf::from(trimmed)));
        }
        Some(AssetSource::Remote(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDefinition {
    pub id: StopId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub trigger_radius_m: Option<f64>,
    #[serde(default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl StopDefinition {
    pub fn audio_source(&self) -> Option<AssetSource> {
        self.audio_url.as_deref().and_then(AssetSource::classify)
    }

    pub fn image_source(&self) -> Option<AssetSource> {
        self.image_url.as_deref().and_then(AssetSource::classify)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TourDefinition {
    pub id: TourId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub stops: Vec<StopDefinition>,
}

impl TourDefinition {
    pub fn cover_source(&self) -> Option<AssetSource> {
        self.image_url.as_deref().and_then(AssetSource::classify)
    }

    pub fn stop(&self, id: &StopId) -> Option<&StopDefinition> {
        self.stops.iter().find(|stop| &stop.id == id)
    }

    pub fn image_source(&self, key: &ImageKey) -> Option<AssetSource> {
        match key {
            ImageKey::Cover => self.cover_source(),
            ImageKey::Stop(id) => self.stop(id).and_then(StopDefinition::image_source),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetManifest {
    pub tour_id: TourId,
    pub downloaded_at: DateTime<Utc>,
    pub size: u64,
    #[serde(default)]
    pub audio_files: BTreeMap<StopId, Utf8PathBuf>,
    #[serde(default)]
    pub image_files: BTreeMap<ImageKey, Utf8PathBuf>,
    pub tour_snapshot: TourDefinition,
}

impl AssetManifest {
    pub fn paths(&self) -> impl Iterator<Item = &Utf8PathBuf> {
        self.audio_files.values().chain(self.image_files.values())
    }

    pub fn file_count(&self) -> usize {
        self.audio_files.len() + self.image_files.len()
    }

    /// First referenced path that is missing or empty on disk.
    pub fn first_broken_path(&self) -> Option<&Utf8PathBuf> {
        self.paths().find(|path| {
            std::fs::metadata(path.as_std_path())
                .map(|meta| !meta.is_file() || meta.len() == 0)
                .unwrap_or(true)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Synced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub user_id: UserId,
    pub stop_id: StopId,
    #[serde(default)]
    pub tour_id: Option<TourId>,
    pub completed_at: DateTime<Utc>,
    pub sync_state: SyncState,
}

impl CompletionRecord {
    pub fn new(
        user_id: UserId,
        stop_id: StopId,
        tour_id: Option<TourId>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            stop_id,
            tour_id,
            completed_at,
            sync_state: SyncState::Pending,
        }
    }

    pub fn same_fact(&self, other: &CompletionRecord) -> bool {
        self.user_id == other.user_id && self.stop_id == other.stop_id
    }
}

/// What the caller knows about network reachability at the time of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    Online,
    Offline,
    Unknown,
}

impl Reachability {
    pub fn permits_remote(self) -> bool {
        !matches!(self, Reachability::Offline)
    }
}

impl From<bool> for Reachability {
    fn from(online: bool) -> Self {
        if online {
            Reachability::Online
        } else {
            Reachability::Offline
        }
    }
}
