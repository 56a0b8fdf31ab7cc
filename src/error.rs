//! Error types for model store operations

use std::path::PathBuf;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the model store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Model {name} is not available in the model zoo")]
    UnknownModel { name: String },

    #[error("Failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Failed to extract {archive:?}: {reason}")]
    Extract { archive: PathBuf, reason: String },

    #[error(
        "Downloaded file {path:?} for model {name} has different hash. \
         Please try again."
    )]
    Integrity { path: PathBuf, name: String },

    #[error("Cannot expand '~': home directory is unavailable")]
    HomeDirUnavailable,

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Blocking task was cancelled before completing")]
    Cancelled,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn download(
        url: &str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        StoreError::Download {
            url: url.to_string(),
            source: source.into(),
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Download { .. } | StoreError::Integrity { .. }
        )
    }
}
