use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::Builder;

use crate::domain::{AssetKind, TourId, UserId};
use crate::error::TourError;

#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, TourError> {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("offline-tours"))
                    .ok()
            })
            .ok_or_else(|| TourError::Filesystem("unable to resolve data directory".to_string()))?;
        Ok(Self { root })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn manifests_dir(&self) -> Utf8PathBuf {
        self.root.join("manifests")
    }

    pub fn manifest_path(&self, tour: &TourId) -> Utf8PathBuf {
        self.manifests_dir().join(format!("{tour}.json"))
    }

    pub fn tour_dir(&self, tour: &TourId) -> Utf8PathBuf {
        self.root.join("tours").join(tour.as_str())
    }

    /// Where a download session writes before it is committed to `tour_dir`.
    pub fn staging_dir(&self, tour: &TourId) -> Utf8PathBuf {
        self.root.join("staging").join(tour.as_str())
    }

    pub fn asset_path(&self, tour: &TourId, kind: AssetKind, stem: &str, ext: &str) -> Utf8PathBuf {
        Self::asset_path_in(&self.tour_dir(tour), kind, stem, ext)
    }

    pub fn asset_path_in(dir: &Utf8Path, kind: AssetKind, stem: &str, ext: &str) -> Utf8PathBuf {
        dir.join(kind.dir_name()).join(format!("{stem}.{ext}"))
    }

    pub fn user_dir(&self, user: &UserId) -> Utf8PathBuf {
        self.root.join("progress").join(user.as_str())
    }

    pub fn ledger_path(&self, user: &UserId) -> Utf8PathBuf {
        self.user_dir(user).join("ledger.json")
    }

    pub fn queue_path(&self, user: &UserId) -> Utf8PathBuf {
        self.user_dir(user).join("queue.json")
    }

    pub fn mapping_path(&self) -> Utf8PathBuf {
        self.root.join("mapping").join("stops.json")
    }

    pub fn ensure_dir(path: &Utf8Path) -> Result<(), TourError> {
        fs::create_dir_all(path.as_std_path()).map_err(|err| TourError::Filesystem(err.to_string()))
    }

    pub fn write_json<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), TourError> {
        let content =
            serde_json::to_vec_pretty(value).map_err(|err| TourError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), TourError> {
        let parent = path
            .parent()
            .ok_or_else(|| TourError::Filesystem(format!("invalid destination path: {path}")))?;
        Self::ensure_dir(parent)?;
        let mut temp = Builder::new()
            .prefix(".offline-tours")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| TourError::Filesystem(err.to_string()))?;
        temp.write_all(content).map_err(TourError::from_write)?;
        temp.as_file().sync_all().map_err(TourError::from_write)?;
        temp.persist(path.as_std_path())
            .map_err(|err| TourError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// `Ok(None)` when the file does not exist; unreadable or malformed content is an error.
    pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, TourError> {
        let content = match fs::read(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(TourError::Filesystem(format!("read {path}: {err}"))),
        };
        let value = serde_json::from_slice(&content)
            .map_err(|err| TourError::Filesystem(format!("parse {path}: {err}")))?;
        Ok(Some(value))
    }

    pub fn remove_file(path: &Utf8Path) -> Result<bool, TourError> {
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(TourError::Filesystem(format!("remove {path}: {err}"))),
        }
    }

    pub fn remove_dir(path: &Utf8Path) -> Result<bool, TourError> {
        match fs::remove_dir_all(path.as_std_path()) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(TourError::Filesystem(format!("remove {path}: {err}"))),
        }
    }

    /// Moves `from` onto `to`, replacing whatever `to` held.
    pub fn replace_dir(from: &Utf8Path, to: &Utf8Path) -> Result<(), TourError> {
        Self::remove_dir(to)?;
        if let Some(parent) = to.parent() {
            Self::ensure_dir(parent)?;
        }
        fs::rename(from.as_std_path(), to.as_std_path())
            .map_err(|err| TourError::Filesystem(format!("rename {from} to {to}: {err}")))
    }

    pub fn file_size(path: &Utf8Path) -> Option<u64> {
        fs::metadata(path.as_std_path())
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }

    pub fn list_manifest_ids(&self) -> Result<Vec<TourId>, TourError> {
        let dir = self.manifests_dir();
        let entries = match fs::read_dir(dir.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(TourError::Filesystem(err.to_string())),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| TourError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                if let Some(id) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<TourId>().ok())
                {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
