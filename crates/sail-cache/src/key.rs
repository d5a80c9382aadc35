use std::{collections::BTreeMap, fmt};

use serde::Serialize;

use crate::{CacheError, CACHE_SCHEMA_VERSION};

/// One hashed input file, identified by its repo-relative path.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct InputHash {
    pub repo_relative_path: String,
    pub sha256: String,
}

/// Everything that identifies a shared-cache entry.
///
/// The key is the sha256 of the canonical JSON encoding of this record.
/// Field order is fixed by the struct declaration, the vectors are sorted
/// by the constructor, and optional fields are omitted when absent; the
/// same policy applies on store and lookup, so the key is a pure function
/// of its fields.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKeyInputs {
    pub package_name: String,
    pub task_name: String,
    pub executable: String,
    pub command: String,
    input_hashes: Vec<InputHash>,
    pub lockfile_hash: String,
    dependency_hashes: Vec<String>,
    pub cache_schema_version: u32,
    pub node_version: String,
    pub arch: String,
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_hashes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_bust_vars: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_env: Option<String>,
}

impl CacheKeyInputs {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        package_name: impl Into<String>,
        task_name: impl Into<String>,
        executable: impl Into<String>,
        command: impl Into<String>,
        mut input_hashes: Vec<InputHash>,
        lockfile_hash: String,
        mut dependency_hashes: Vec<String>,
        node_version: String,
    ) -> Self {
        input_hashes.sort();
        dependency_hashes.sort();
        CacheKeyInputs {
            package_name: package_name.into(),
            task_name: task_name.into(),
            executable: executable.into(),
            command: command.into(),
            input_hashes,
            lockfile_hash,
            dependency_hashes,
            cache_schema_version: CACHE_SCHEMA_VERSION,
            node_version,
            arch: std::env::consts::ARCH.to_string(),
            platform: std::env::consts::OS.to_string(),
            tool_version: None,
            config_hashes: None,
            cache_bust_vars: None,
            node_env: None,
        }
    }

    pub fn with_tool_version(mut self, tool_version: Option<String>) -> Self {
        self.tool_version = tool_version;
        self
    }

    pub fn with_config_hashes(mut self, mut config_hashes: Vec<String>) -> Self {
        if !config_hashes.is_empty() {
            config_hashes.sort();
            self.config_hashes = Some(config_hashes);
        }
        self
    }

    /// Mixes in the values of the env vars named by `CACHE_BUST_VARS` and,
    /// when present, `NODE_ENV`.
    pub fn with_environment(
        mut self,
        cache_bust_vars: BTreeMap<String, String>,
        node_env: Option<String>,
    ) -> Self {
        if !cache_bust_vars.is_empty() {
            self.cache_bust_vars = Some(cache_bust_vars);
        }
        self.node_env = node_env;
        self
    }

    pub fn key(&self) -> Result<CacheKey, CacheError> {
        Ok(CacheKey(sail_hash::hash_canonical(self)?))
    }
}

/// The sha256 identity of a shared-cache entry, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn inputs() -> CacheKeyInputs {
        CacheKeyInputs::new(
            "web",
            "build",
            "tsc",
            "tsc --build",
            vec![
                InputHash {
                    repo_relative_path: "packages/web/src/index.ts".into(),
                    sha256: "aaa".into(),
                },
                InputHash {
                    repo_relative_path: "packages/web/tsconfig.json".into(),
                    sha256: "bbb".into(),
                },
            ],
            "lockhash".into(),
            vec!["dep1".into(), "dep2".into()],
            "v20.11.0".into(),
        )
    }

    #[test]
    fn test_key_is_pure() {
        assert_eq!(inputs().key().unwrap(), inputs().key().unwrap());
    }

    #[test]
    fn test_key_is_order_invariant() {
        let reordered = CacheKeyInputs::new(
            "web",
            "build",
            "tsc",
            "tsc --build",
            vec![
                InputHash {
                    repo_relative_path: "packages/web/tsconfig.json".into(),
                    sha256: "bbb".into(),
                },
                InputHash {
                    repo_relative_path: "packages/web/src/index.ts".into(),
                    sha256: "aaa".into(),
                },
            ],
            "lockhash".into(),
            vec!["dep2".into(), "dep1".into()],
            "v20.11.0".into(),
        );
        assert_eq!(inputs().key().unwrap(), reordered.key().unwrap());
    }

    #[test]
    fn test_every_field_influences_key() {
        let base = inputs().key().unwrap();

        let mut changed = inputs();
        changed.command = "tsc --build --force".into();
        assert_ne!(base, changed.key().unwrap());

        let mut changed = inputs();
        changed.lockfile_hash = "other".into();
        assert_ne!(base, changed.key().unwrap());

        let changed = inputs().with_environment(
            BTreeMap::from([("CI".to_string(), "1".to_string())]),
            None,
        );
        assert_ne!(base, changed.key().unwrap());

        let changed = inputs().with_environment(BTreeMap::new(), Some("production".into()));
        assert_ne!(base, changed.key().unwrap());

        let changed = inputs().with_tool_version(Some("5.3.3".into()));
        assert_ne!(base, changed.key().unwrap());

        let changed = inputs().with_config_hashes(vec!["confighash".into()]);
        assert_ne!(base, changed.key().unwrap());
    }

    #[test]
    fn test_empty_optionals_do_not_change_key() {
        // Omitted and explicitly-empty optional fields must serialize
        // identically, so store and lookup agree.
        let with_empty = inputs()
            .with_environment(BTreeMap::new(), None)
            .with_config_hashes(Vec::new());
        assert_eq!(inputs().key().unwrap(), with_empty.key().unwrap());
    }
}
