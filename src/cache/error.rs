//! Error types for the store and the gateway.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures reading or writing the on-disk store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt metadata in {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode metadata: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unsupported metadata format version {version} in {path}")]
    UnsupportedVersion { path: PathBuf, version: u32 },

    #[error("stored status code {0} is not a known HTTP status")]
    UnknownStatus(u16),

    #[error("background store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures surfaced by [`HttpCache::handle`](super::HttpCache::handle).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("inclusion of {uri} failed: {reason}")]
    Inclusion { uri: String, reason: String },

    #[error("ESI include tag without a \"src\" attribute: {tag}")]
    MissingSource { tag: String },

    #[error("sub-request nesting exceeded {max} levels at {uri}")]
    DepthExceeded { uri: String, max: usize },
}
