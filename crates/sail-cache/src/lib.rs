//! The shared, content-addressed build cache.
//!
//! Output trees of successful tasks are stored under a cache key derived
//! from everything that could influence the outputs (see [`CacheKeyInputs`])
//! and restored on later builds, on this machine or another one sharing the
//! cache directory.
//!
//! Every operation here is advisory: callers must treat any error as a
//! cache miss (or a skipped store) and never fail the build over it.

mod fs;
mod key;
mod manifest;
mod prune;

use camino::Utf8PathBuf;
pub use fs::{FsCache, FsCacheOptions, RestoredFile};
pub use key::{CacheKey, CacheKeyInputs, InputHash};
pub use manifest::{CacheManifest, OutputFileEntry, StoredBy, CACHE_SCHEMA_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache IO error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("invalid cache manifest: {0}")]
    InvalidManifest(#[from] serde_json::Error),
    #[error("corrupted cache entry at {path}: {reason}")]
    Corrupt { path: Utf8PathBuf, reason: String },
    #[error("cache path is not valid UTF-8: {0}")]
    NonUtf8Path(String),
    #[error(transparent)]
    Hash(#[from] sail_hash::Error),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<Utf8PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Where a cache hit was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// The donefile short-circuit: outputs already on disk are current.
    LocalDonefile,
    /// The shared content-addressed cache.
    Shared,
}
