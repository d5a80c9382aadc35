//! Content hashing for cache keys and donefiles.
//!
//! All hashes in sail are hex-encoded sha256. [`FileHashCache`] memoizes
//! file content hashes for the lifetime of the process; lockfiles and
//! tsconfig files are read by dozens of tasks in a single build, so a stat
//! check plus a map lookup replaces repeated full reads.

use std::{
    collections::HashMap,
    fs,
    io::{self, Read},
    sync::Mutex,
    time::UNIX_EPOCH,
};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to hash {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: io::Error,
    },
    #[error("unable to serialize hash input: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Hex-encoded sha256 of a byte slice.
pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(bytes.as_ref()))
}

/// Hex-encoded sha256 of a value's canonical JSON encoding. Struct fields
/// serialize in declaration order and map types must be ordered (`BTreeMap`)
/// for the result to be deterministic.
pub fn hash_canonical<T: Serialize>(value: &T) -> Result<String, Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(bytes))
}

/// Streaming sha256 of a file's contents.
pub fn hash_file(path: &Utf8Path) -> Result<String, Error> {
    let map_err = |source| Error::Io {
        path: path.to_owned(),
        source,
    };
    let mut file = fs::File::open(path).map_err(map_err)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(map_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedHash {
    size: u64,
    mtime_ms: u128,
    sha256: String,
}

/// Process-lifetime cache of file content hashes keyed by absolute path.
///
/// A cached entry is reused only while the file's size and mtime both
/// match; otherwise the hash is recomputed and the entry replaced. Stale
/// reads between the stat and the hash are tolerated, the next lookup
/// re-stats.
#[derive(Debug, Default)]
pub struct FileHashCache {
    entries: Mutex<HashMap<Utf8PathBuf, CachedHash>>,
}

impl FileHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hash(&self, path: &Utf8Path) -> Result<String, Error> {
        let metadata = fs::metadata(path).map_err(|source| Error::Io {
            path: path.to_owned(),
            source,
        })?;
        let size = metadata.len();
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis())
            .unwrap_or(0);

        {
            let entries = self.entries.lock().expect("file hash cache poisoned");
            if let Some(cached) = entries.get(path) {
                if cached.size == size && cached.mtime_ms == mtime_ms {
                    return Ok(cached.sha256.clone());
                }
            }
        }

        let sha256 = hash_file(path)?;
        self.entries
            .lock()
            .expect("file hash cache poisoned")
            .insert(
                path.to_owned(),
                CachedHash {
                    size,
                    mtime_ms,
                    sha256: sha256.clone(),
                },
            );
        Ok(sha256)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
