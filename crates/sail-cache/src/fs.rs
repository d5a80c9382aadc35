use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use filetime::FileTime;
use tracing::{debug, warn};

use crate::{
    manifest::{CacheManifest, OutputFileEntry, StoredBy},
    CacheError, CacheKey, CACHE_SCHEMA_VERSION,
};

const VERSION_DIR: &str = "v1";

#[derive(Debug, Clone)]
pub struct FsCacheOptions {
    pub high_water_mark_bytes: u64,
    pub low_water_mark_bytes: u64,
    /// Entries accessed more recently than this are never pruned, so a
    /// concurrent restore cannot have its manifest deleted under it.
    pub prune_min_age_ms: i64,
}

impl Default for FsCacheOptions {
    fn default() -> Self {
        FsCacheOptions {
            high_water_mark_bytes: 10 * 1024 * 1024 * 1024,
            low_water_mark_bytes: 8 * 1024 * 1024 * 1024,
            prune_min_age_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// A file put back into the repo by [`FsCache::restore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredFile {
    pub rel_path: Utf8PathBuf,
    pub bytes: u64,
}

/// Content-addressed cache rooted at a directory, shareable between
/// processes and machines.
///
/// Layout:
/// ```text
/// <root>/v1/entries/<cacheKeyHex>/manifest.json
/// <root>/v1/files/<sha256 prefix>/<sha256>
/// <root>/v1/index/recent.log
/// ```
///
/// Content files are immutable once created and shared across entries;
/// manifests commit via rename, so readers are lock-free.
pub struct FsCache {
    root: Utf8PathBuf,
    options: FsCacheOptions,
}

impl FsCache {
    pub fn new(cache_dir: &Utf8Path, options: FsCacheOptions) -> Result<Self, CacheError> {
        let cache = FsCache {
            root: cache_dir.to_owned(),
            options,
        };
        for dir in [cache.entries_dir(), cache.files_dir(), cache.index_dir()] {
            std::fs::create_dir_all(&dir).map_err(|source| CacheError::io(&dir, source))?;
        }
        Ok(cache)
    }

    pub(crate) fn entries_dir(&self) -> Utf8PathBuf {
        self.root.join(VERSION_DIR).join("entries")
    }

    pub(crate) fn files_dir(&self) -> Utf8PathBuf {
        self.root.join(VERSION_DIR).join("files")
    }

    pub(crate) fn index_dir(&self) -> Utf8PathBuf {
        self.root.join(VERSION_DIR).join("index")
    }

    pub(crate) fn options(&self) -> &FsCacheOptions {
        &self.options
    }

    fn manifest_path(&self, key_hex: &str) -> Utf8PathBuf {
        self.entries_dir().join(key_hex).join("manifest.json")
    }

    pub(crate) fn content_path(&self, sha256: &str) -> Utf8PathBuf {
        let prefix = &sha256[..2.min(sha256.len())];
        self.files_dir().join(prefix).join(sha256)
    }

    /// Stores the given repo-relative output files under `key`. Returns the
    /// number of content bytes newly written (deduplicated files count
    /// zero). Leaves no partial entry behind on failure.
    pub fn store(
        &self,
        anchor: &Utf8Path,
        key: &CacheKey,
        output_files: &[Utf8PathBuf],
        time_cost_ms: u64,
    ) -> Result<u64, CacheError> {
        let result = self.store_inner(anchor, key, output_files, time_cost_ms);
        if result.is_err() {
            // Drop whatever we managed to write for this entry; content
            // files are harmless leftovers, the manifest is the commit.
            let _ = std::fs::remove_dir_all(self.entries_dir().join(key.hex()));
        }
        result
    }

    fn store_inner(
        &self,
        anchor: &Utf8Path,
        key: &CacheKey,
        output_files: &[Utf8PathBuf],
        time_cost_ms: u64,
    ) -> Result<u64, CacheError> {
        let now_ms = epoch_ms();
        let mut entries = Vec::with_capacity(output_files.len());
        let mut bytes_written = 0u64;

        for rel_path in output_files {
            let abs = anchor.join(rel_path);
            let metadata =
                std::fs::metadata(&abs).map_err(|source| CacheError::io(&abs, source))?;
            let sha256 = sail_hash::hash_file(&abs)?;

            let content_path = self.content_path(&sha256);
            if !content_path.exists() {
                bytes_written += self.write_content_file(&abs, &content_path)?;
            }

            let mtime = FileTime::from_last_modification_time(&metadata);
            entries.push(OutputFileEntry {
                rel_path: rel_path.to_string(),
                sha256,
                size: metadata.len(),
                mtime_ms: mtime.unix_seconds() * 1000 + i64::from(mtime.nanoseconds()) / 1_000_000,
                mode: file_mode(&metadata),
            });
        }

        let manifest = CacheManifest {
            schema_version: CACHE_SCHEMA_VERSION,
            cache_key: key.hex().to_string(),
            output_files: entries,
            produced_at_ms: now_ms,
            time_cost_ms,
            stored_by: StoredBy {
                pid: std::process::id(),
                host: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            },
        };

        let manifest_path = self.manifest_path(key.hex());
        let entry_dir = manifest_path.parent().expect("manifest path has a parent");
        std::fs::create_dir_all(entry_dir).map_err(|source| CacheError::io(entry_dir, source))?;
        manifest.write(&manifest_path)?;

        self.record_access(key, now_ms);
        if let Err(e) = self.prune_if_needed(now_ms) {
            warn!("cache pruning failed: {e}");
        }

        debug!(
            key = key.hex(),
            files = output_files.len(),
            bytes = bytes_written,
            "stored cache entry"
        );
        Ok(bytes_written)
    }

    /// Copies `src` into the content store via a temp file in the same
    /// directory. If another process won the race to create the target,
    /// the temp is discarded; contents are identical by construction.
    fn write_content_file(&self, src: &Utf8Path, content_path: &Utf8Path) -> Result<u64, CacheError> {
        let dir = content_path.parent().expect("content path has a parent");
        std::fs::create_dir_all(dir).map_err(|source| CacheError::io(dir, source))?;
        let tmp = dir.join(format!(
            ".{}.{}.tmp",
            content_path.file_name().expect("content file has a name"),
            std::process::id()
        ));
        let bytes = std::fs::copy(src, &tmp).map_err(|source| CacheError::io(&tmp, source))?;
        if content_path.exists() {
            let _ = std::fs::remove_file(&tmp);
            return Ok(0);
        }
        std::fs::rename(&tmp, content_path).map_err(|source| {
            let _ = std::fs::remove_file(&tmp);
            CacheError::io(content_path, source)
        })?;
        Ok(bytes)
    }

    /// Reads and validates the manifest for `key`. Anything wrong with the
    /// entry (absent, malformed, missing content, size drift) is a MISS,
    /// never an error; a miss just means the task executes.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<CacheManifest>, CacheError> {
        let manifest_path = self.manifest_path(key.hex());
        let contents = match std::fs::read_to_string(&manifest_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::io(&manifest_path, source)),
        };
        let manifest: CacheManifest = match serde_json::from_str(&contents) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("malformed cache manifest at {manifest_path}: {e}");
                return Ok(None);
            }
        };

        if manifest.schema_version != CACHE_SCHEMA_VERSION {
            return Ok(None);
        }
        if manifest.output_files.is_empty() {
            warn!("cache entry {key} has no outputs, treating as corrupt");
            return Ok(None);
        }
        for entry in &manifest.output_files {
            let content_path = self.content_path(&entry.sha256);
            match std::fs::metadata(&content_path) {
                Ok(metadata) if metadata.len() == entry.size => (),
                Ok(_) => {
                    warn!("cache content {content_path} has wrong size, treating as corrupt");
                    return Ok(None);
                }
                Err(_) => {
                    warn!("cache entry {key} references missing content {content_path}");
                    return Ok(None);
                }
            }
        }

        self.record_access(key, epoch_ms());
        Ok(Some(manifest))
    }

    /// Copies every output in `manifest` back under `anchor` and restores
    /// the stored modification times. Restoring mtimes is not cosmetic:
    /// incremental compilers key off them, and a fresh mtime cascades into
    /// rebuilding everything downstream.
    pub fn restore(
        &self,
        anchor: &Utf8Path,
        manifest: &CacheManifest,
    ) -> Result<Vec<RestoredFile>, CacheError> {
        let mut restored = Vec::with_capacity(manifest.output_files.len());
        for entry in &manifest.output_files {
            let src = self.content_path(&entry.sha256);
            let dst = anchor.join(&entry.rel_path);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|source| CacheError::io(parent, source))?;
            }
            let bytes = std::fs::copy(&src, &dst).map_err(|source| CacheError::io(&dst, source))?;
            if bytes != entry.size {
                return Err(CacheError::Corrupt {
                    path: src,
                    reason: format!("expected {} bytes, copied {bytes}", entry.size),
                });
            }

            #[cfg(unix)]
            if let Some(mode) = entry.mode {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(mode))
                    .map_err(|source| CacheError::io(&dst, source))?;
            }

            let mtime = FileTime::from_unix_time(
                entry.mtime_ms.div_euclid(1000),
                (entry.mtime_ms.rem_euclid(1000) * 1_000_000) as u32,
            );
            filetime::set_file_times(dst.as_std_path(), mtime, mtime)
                .map_err(|source| CacheError::io(&dst, source))?;

            restored.push(RestoredFile {
                rel_path: Utf8PathBuf::from(&entry.rel_path),
                bytes,
            });
        }
        debug!(files = restored.len(), "restored cache entry");
        Ok(restored)
    }
}

pub(crate) fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> Option<u32> {
    None
}
