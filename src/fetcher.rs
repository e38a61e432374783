use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::config::FetchSettings;
use crate::error::TourError;

/// Moves one remote byte stream into one local file.
pub trait Transport: Send + Sync {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, TourError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TourError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("offline-tours/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| TourError::Transfer(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| TourError::Transfer(err.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, TourError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| TourError::Transfer(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "asset request failed".to_string());
            return Err(TourError::RemoteStatus { status, message });
        }
        let mut file = File::create(destination).map_err(TourError::from_write)?;
        io::copy(&mut response, &mut file).map_err(|err| match err.kind() {
            io::ErrorKind::StorageFull => TourError::from_write(err),
            _ => TourError::Transfer(err.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Stored,
    /// Every attempt failed; the session may go on without this asset.
    Failed,
    /// The disk is full; retrying or moving on cannot help.
    StorageExhausted,
}

pub struct AssetFetcher<T: Transport> {
    transport: T,
    settings: FetchSettings,
}

impl<T: Transport> AssetFetcher<T> {
    pub fn new(transport: T, settings: FetchSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn settings(&self) -> FetchSettings {
        self.settings
    }

    /// Retries transient failures; a full disk ends the fetch at once.
    pub fn fetch(&self, url: &str, destination: &Utf8Path) -> FetchOutcome {
        if let Some(parent) = destination.parent() {
            if let Err(err) = fs::create_dir_all(parent.as_std_path()) {
                warn!(%destination, error = %err, "cannot create asset directory");
                return match err.kind() {
                    io::ErrorKind::StorageFull => FetchOutcome::StorageExhausted,
                    _ => FetchOutcome::Failed,
                };
            }
        }

        let max_attempts = self.settings.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.transport.download(url, destination.as_std_path()) {
                Ok(_) if has_content(destination) => {
                    debug!(url, %destination, attempt, "asset stored");
                    return FetchOutcome::Stored;
                }
                Ok(_) => {
                    warn!(url, attempt, "asset transfer produced an empty file");
                }
                Err(TourError::StorageFull(message)) => {
                    warn!(url, %destination, error = %message, "storage exhausted");
                    discard_partial(destination);
                    return FetchOutcome::StorageExhausted;
                }
                Err(err) => {
                    warn!(url, attempt, error = %err, "asset transfer failed");
                }
            }
            discard_partial(destination);

            if attempt < max_attempts {
                thread::sleep(backoff_delay(self.settings.backoff_base, attempt));
            }
        }
        warn!(url, attempts = max_attempts, "giving up on asset");
        FetchOutcome::Failed
    }
}

/// `base * 2^attempt`, so the default one-second base yields 2s, 4s, ...
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(16)))
}

fn has_content(path: &Utf8Path) -> bool {
    fs::metadata(path.as_std_path())
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

fn discard_partial(path: &Utf8Path) {
    if let Err(err) = fs::remove_file(path.as_std_path()) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(%path, error = %err, "cannot remove partial asset");
        }
    }
}
