use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::Error;

/// On-disk shape of `sail.json`. `Option` everywhere so overlays can
/// distinguish "field absent" from "field set to empty".
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawSailJson {
    pub version: Option<u32>,
    #[serde(default)]
    pub tasks: BTreeMap<String, RawTaskConfig>,
    #[serde(default)]
    pub declarative_tasks: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub shared_cache: RawSharedCacheOptions,
    #[serde(default)]
    pub worker: RawWorkerOptions,
    pub concurrency: Option<usize>,
    pub bail_on_failure: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawTaskConfig {
    pub depends_on: Option<Vec<String>>,
    pub before: Option<Vec<String>>,
    pub after: Option<Vec<String>>,
    pub children: Option<Vec<String>>,
    /// `false` marks a pure grouping node with no script of its own.
    pub script: Option<bool>,
    pub inputs: Option<Vec<String>>,
    pub outputs: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawSharedCacheOptions {
    pub enabled: Option<bool>,
    pub directory: Option<Utf8PathBuf>,
    pub high_water_mark_bytes: Option<u64>,
    pub low_water_mark_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawWorkerOptions {
    pub use_threads: Option<bool>,
    pub memory_limit_mb: Option<u64>,
    pub max_count: Option<usize>,
}

impl RawSailJson {
    pub fn load(path: &Utf8Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| Error::InvalidJson {
            path: path.to_owned(),
            source,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<RawSailJson, _> =
            serde_json::from_str(r#"{ "version": 1, "pipeline": {} }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_absent_vs_empty() {
        let absent: RawTaskConfig = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(absent.depends_on, None);
        let empty: RawTaskConfig = serde_json::from_str(r#"{ "dependsOn": [] }"#).unwrap();
        assert_eq!(empty.depends_on, Some(vec![]));
    }
}
