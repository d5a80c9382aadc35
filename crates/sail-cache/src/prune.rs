use std::collections::{BTreeMap, HashSet};

use camino::Utf8PathBuf;
use tracing::{debug, warn};

use crate::{
    fs::{epoch_ms, FsCache},
    manifest::CacheManifest,
    CacheError, CacheKey,
};

const RECENT_LOG: &str = "recent.log";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PruneSummary {
    pub entries_removed: usize,
    pub bytes_freed: u64,
}

impl FsCache {
    fn recent_log_path(&self) -> Utf8PathBuf {
        self.index_dir().join(RECENT_LOG)
    }

    /// Appends an access hint for `key`. The log is append-only and purely
    /// advisory; a lost line just makes the entry look older to pruning.
    pub(crate) fn record_access(&self, key: &CacheKey, now_ms: i64) {
        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.recent_log_path())
            .and_then(|mut file| writeln!(file, "{} {now_ms}", key.hex()));
        if let Err(e) = result {
            warn!("unable to record cache access: {e}");
        }
    }

    /// Latest access time per key, reduced from the append-only log.
    /// Malformed lines are skipped.
    fn access_times(&self) -> BTreeMap<String, i64> {
        let mut times = BTreeMap::new();
        let Ok(contents) = std::fs::read_to_string(self.recent_log_path()) else {
            return times;
        };
        for line in contents.lines() {
            let Some((key, ms)) = line.split_once(' ') else {
                continue;
            };
            let Ok(ms) = ms.parse::<i64>() else { continue };
            let entry = times.entry(key.to_string()).or_insert(ms);
            *entry = (*entry).max(ms);
        }
        times
    }

    fn total_size(&self) -> u64 {
        walkdir::WalkDir::new(self.entries_dir())
            .into_iter()
            .chain(walkdir::WalkDir::new(self.files_dir()))
            .filter_map(Result::ok)
            .filter_map(|entry| entry.metadata().ok())
            .filter(|metadata| metadata.is_file())
            .map(|metadata| metadata.len())
            .sum()
    }

    /// Shrinks the cache below the low-water mark once it exceeds the
    /// high-water mark. Oldest-accessed entries go first, but entries
    /// younger than the minimum age are never touched so that a concurrent
    /// restore cannot lose its manifest mid-read. Manifests are deleted
    /// before content files; content is only garbage collected once no
    /// surviving manifest references it.
    pub(crate) fn prune_if_needed(&self, now_ms: i64) -> Result<PruneSummary, CacheError> {
        let mut size = self.total_size();
        let options = self.options();
        if size <= options.high_water_mark_bytes {
            return Ok(PruneSummary::default());
        }

        let access_times = self.access_times();
        let entries_dir = self.entries_dir();
        let mut candidates: Vec<(i64, String)> = Vec::new();
        let read_dir = std::fs::read_dir(&entries_dir)
            .map_err(|source| CacheError::io(&entries_dir, source))?;
        for entry in read_dir.filter_map(Result::ok) {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let last_access = access_times.get(&name).copied().or_else(|| {
                entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
            });
            let last_access = last_access.unwrap_or(0);
            if now_ms.saturating_sub(last_access) >= options.prune_min_age_ms {
                candidates.push((last_access, name));
            }
        }
        candidates.sort();

        let mut summary = PruneSummary::default();
        for (_, key_hex) in candidates {
            if size <= options.low_water_mark_bytes {
                break;
            }
            let entry_dir = entries_dir.join(&key_hex);
            if let Err(e) = std::fs::remove_dir_all(&entry_dir) {
                // Another pruner may have gotten here first.
                debug!("unable to remove cache entry {entry_dir}: {e}");
                continue;
            }
            summary.entries_removed += 1;
            self.collect_unreferenced_content()?;
            let new_size = self.total_size();
            summary.bytes_freed += size.saturating_sub(new_size);
            size = new_size;
        }

        self.compact_recent_log(now_ms);
        debug!(
            removed = summary.entries_removed,
            freed = summary.bytes_freed,
            "pruned shared cache"
        );
        Ok(summary)
    }

    /// Deletes content files no surviving manifest references. Manifests
    /// that fail to parse contribute no references; their entries are
    /// already unusable.
    fn collect_unreferenced_content(&self) -> Result<(), CacheError> {
        let mut referenced: HashSet<String> = HashSet::new();
        let entries_dir = self.entries_dir();
        let read_dir = std::fs::read_dir(&entries_dir)
            .map_err(|source| CacheError::io(&entries_dir, source))?;
        for entry in read_dir.filter_map(Result::ok) {
            let manifest_path = entries_dir
                .join(entry.file_name().to_string_lossy().as_ref())
                .join("manifest.json");
            if let Ok(manifest) = CacheManifest::read(&manifest_path) {
                referenced.extend(manifest.output_files.into_iter().map(|f| f.sha256));
            }
        }

        for entry in walkdir::WalkDir::new(self.files_dir())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(".tmp") || referenced.contains(name.as_ref()) {
                continue;
            }
            if let Err(e) = std::fs::remove_file(entry.path()) {
                debug!("unable to remove cache content {}: {e}", entry.path().display());
            }
        }
        Ok(())
    }

    /// Rewrites the log keeping only keys whose entries still exist.
    fn compact_recent_log(&self, now_ms: i64) {
        let entries_dir = self.entries_dir();
        let surviving: String = self
            .access_times()
            .into_iter()
            .filter(|(key, _)| entries_dir.join(key).join("manifest.json").exists())
            .map(|(key, ms)| format!("{key} {ms}\n"))
            .collect();
        let tmp = self
            .index_dir()
            .join(format!(".{RECENT_LOG}.{}.{now_ms}.tmp", std::process::id()));
        let result = std::fs::write(&tmp, surviving)
            .and_then(|()| std::fs::rename(&tmp, self.recent_log_path()));
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            warn!("unable to compact cache access log: {e}");
        }
    }
}
