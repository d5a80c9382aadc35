use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::CacheError;

/// Bumped whenever the on-disk layout or manifest shape changes; part of
/// every cache key, so old entries simply stop matching.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// One output file captured in a cache entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutputFileEntry {
    /// Path relative to the repo root.
    pub rel_path: String,
    pub sha256: String,
    pub size: u64,
    /// Modification time captured at store time, restored verbatim so
    /// incremental compilers downstream see unchanged inputs.
    pub mtime_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredBy {
    pub pid: u32,
    pub host: String,
}

/// The per-entry manifest. Written with temp-file + rename; the rename is
/// the commit point, so readers never observe a half-written manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheManifest {
    pub schema_version: u32,
    pub cache_key: String,
    pub output_files: Vec<OutputFileEntry>,
    pub produced_at_ms: i64,
    pub time_cost_ms: u64,
    pub stored_by: StoredBy,
}

impl CacheManifest {
    pub fn read(path: &Utf8Path) -> Result<CacheManifest, CacheError> {
        let contents =
            std::fs::read_to_string(path).map_err(|source| CacheError::io(path, source))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Atomic write: serialize to `<path>.<pid>.tmp`, then rename over the
    /// destination. Concurrent writers of the same key produce
    /// byte-identical manifests, so whoever loses the rename race still
    /// leaves a valid file behind.
    pub fn write(&self, path: &Utf8Path) -> Result<(), CacheError> {
        let contents = serde_json::to_string(self)?;
        let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
        std::fs::write(&tmp, contents).map_err(|source| CacheError::io(&tmp, source))?;
        std::fs::rename(&tmp, path).map_err(|source| {
            let _ = std::fs::remove_file(&tmp);
            CacheError::io(path, source)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use camino::Utf8PathBuf;

    use super::*;

    fn manifest() -> CacheManifest {
        CacheManifest {
            schema_version: CACHE_SCHEMA_VERSION,
            cache_key: "deadbeef".into(),
            output_files: vec![OutputFileEntry {
                rel_path: "packages/web/dist/index.js".into(),
                sha256: "abc".into(),
                size: 42,
                mtime_ms: 1_700_000_000_123,
                mode: Some(0o644),
            }],
            produced_at_ms: 1_700_000_000_500,
            time_cost_ms: 1500,
            stored_by: StoredBy {
                pid: 1234,
                host: "build-host".into(),
            },
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("manifest.json")).unwrap();
        let original = manifest();
        original.write(&path).unwrap();
        assert_eq!(CacheManifest::read(&path).unwrap(), original);
        // No temp files left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_field_names_are_camel_case() {
        let json = serde_json::to_string(&manifest()).unwrap();
        for field in [
            "schemaVersion",
            "cacheKey",
            "outputFiles",
            "relPath",
            "mtimeMs",
            "producedAtMs",
            "timeCostMs",
            "storedBy",
        ] {
            assert!(json.contains(field), "missing {field} in {json}");
        }
    }

    #[test]
    fn test_truncated_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("manifest.json")).unwrap();
        std::fs::write(&path, r#"{ "schemaVersion": 1, "cacheKey": "#).unwrap();
        assert!(matches!(
            CacheManifest::read(&path),
            Err(CacheError::InvalidManifest(_))
        ));
    }
}
