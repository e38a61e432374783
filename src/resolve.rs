use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{AssetManifest, AssetSource, ImageKey, Reachability, StopId, TourDefinition};
use crate::error::TourError;
use crate::store::Store;

/// Outcome of a local-before-remote lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    Local(T),
    Remote(T),
    Unavailable,
}

impl<T> Resolution<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Resolution::Local(value) | Resolution::Remote(value) => Some(value),
            Resolution::Unavailable => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Resolution::Local(_))
    }
}

/// Local lookup always runs first. The remote lookup runs only when the local one
/// came back empty and reachability is not known to be false; its failures
/// degrade to `Unavailable`.
pub fn resolve<T, L, R>(reachability: Reachability, local: L, remote: R) -> Resolution<T>
where
    L: FnOnce() -> Option<T>,
    R: FnOnce() -> Result<Option<T>, TourError>,
{
    if let Some(value) = local() {
        return Resolution::Local(value);
    }
    if !reachability.permits_remote() {
        debug!("offline; skipping remote lookup");
        return Resolution::Unavailable;
    }
    match remote() {
        Ok(Some(value)) => Resolution::Remote(value),
        Ok(None) => Resolution::Unavailable,
        Err(err) => {
            warn!(error = %err, "remote lookup failed; treating as unavailable");
            Resolution::Unavailable
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AssetRef {
    Audio(StopId),
    Image(ImageKey),
}

impl AssetRef {
    fn source(&self, tour: &TourDefinition) -> Option<AssetSource> {
        match self {
            AssetRef::Audio(stop) => tour.stop(stop).and_then(|stop| stop.audio_source()),
            AssetRef::Image(key) => tour.image_source(key),
        }
    }

    fn manifest_path<'a>(&self, manifest: &'a AssetManifest) -> Option<&'a Utf8PathBuf> {
        match self {
            AssetRef::Audio(stop) => manifest.audio_files.get(stop),
            AssetRef::Image(key) => manifest.image_files.get(key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "location", rename_all = "lowercase")]
pub enum AssetLocation {
    File(Utf8PathBuf),
    Url(String),
}

/// Ways of locating an asset, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetCandidate {
    /// Requires a verified manifest that lists the asset.
    ManifestEntry,
    /// Requires the tour definition to point at a non-empty local file.
    BundledFile,
    /// Requires a remote URL in the tour definition; only usable when reachable.
    RemoteUrl,
}

pub const LOCAL_CANDIDATES: [AssetCandidate; 2] =
    [AssetCandidate::ManifestEntry, AssetCandidate::BundledFile];
pub const REMOTE_CANDIDATES: [AssetCandidate; 2] =
    [AssetCandidate::BundledFile, AssetCandidate::RemoteUrl];

impl AssetCandidate {
    pub fn locate(
        self,
        asset: &AssetRef,
        manifest: Option<&AssetManifest>,
        tour: &TourDefinition,
    ) -> Option<AssetLocation> {
        match self {
            AssetCandidate::ManifestEntry => manifest
                .and_then(|manifest| asset.manifest_path(manifest))
                .map(|path| AssetLocation::File(path.clone())),
            AssetCandidate::BundledFile => match asset.source(tour)? {
                AssetSource::Local(path) if Store::file_size(&path).unwrap_or(0) > 0 => {
                    Some(AssetLocation::File(path))
                }
                _ => None,
            },
            AssetCandidate::RemoteUrl => match asset.source(tour)? {
                AssetSource::Remote(url) => Some(AssetLocation::Url(url)),
                AssetSource::Local(_) => None,
            },
        }
    }
}

pub fn locate_first(
    candidates: &[AssetCandidate],
    asset: &AssetRef,
    manifest: Option<&AssetManifest>,
    tour: &TourDefinition,
) -> Option<AssetLocation> {
    candidates
        .iter()
        .find_map(|candidate| candidate.locate(asset, manifest, tour))
}
