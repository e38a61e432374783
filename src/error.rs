use std::io;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum TourError {
    #[error("invalid tour id: {0}")]
    InvalidTourId(String),

    #[error("invalid stop id: {0}")]
    InvalidStopId(String),

    #[error("invalid user id: {0}")]
    InvalidUserId(String),

    #[error("invalid image key: {0}")]
    InvalidImageKey(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to parse tour definition: {0}")]
    TourParse(String),

    #[error("tour not available: {0}")]
    TourNotFound(String),

    #[error("already downloading tour {0}")]
    #[diagnostic(help("wait for the active download to finish or cancel it first"))]
    AlreadyDownloading(String),

    #[error("remote request failed: {0}")]
    RemoteHttp(String),

    #[error("remote returned status {status}: {message}")]
    RemoteStatus { status: u16, message: String },

    #[error("remote backend not configured")]
    RemoteNotConfigured,

    #[error("asset transfer failed: {0}")]
    Transfer(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("storage full: {0}")]
    #[diagnostic(help("free some space or remove offline tours that are no longer needed"))]
    StorageFull(String),
}

impl TourError {
    /// Errors that come from the network side and must degrade instead of surfacing.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            TourError::RemoteHttp(_)
                | TourError::RemoteStatus { .. }
                | TourError::RemoteNotConfigured
                | TourError::Transfer(_)
        )
    }

    /// The remote could not be reached at all, as opposed to rejecting one request.
    pub fn is_unreachable(&self) -> bool {
        match self {
            TourError::RemoteHttp(_) | TourError::RemoteNotConfigured => true,
            TourError::RemoteStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Local write failure; a full disk keeps its own variant.
    pub fn from_write(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::StorageFull {
            TourError::StorageFull(err.to_string())
        } else {
            TourError::Filesystem(err.to_string())
        }
    }
}
