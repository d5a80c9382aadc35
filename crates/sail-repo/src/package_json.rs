use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::Deserialize;

use crate::Error;

/// The subset of `package.json` sail reads. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageJson {
    pub name: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub peer_dependencies: BTreeMap<String, String>,
    /// Workspace globs, only meaningful in the root package.json.
    #[serde(default)]
    pub workspaces: Vec<String>,
}

impl PackageJson {
    pub fn load(path: &Utf8Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| Error::InvalidPackageJson {
            path: path.to_owned(),
            source,
        })
    }
}
