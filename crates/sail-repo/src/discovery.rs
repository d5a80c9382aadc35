use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::{Error, Package, PackageJson};

/// Lockfile names probed at the workspace root, in preference order.
const LOCKFILES: &[&str] = &["pnpm-lock.yaml", "package-lock.json", "yarn.lock"];

/// A loaded workspace: the root directory, every member package keyed by
/// name, and the workspace lockfile if one exists.
#[derive(Debug)]
pub struct Workspace {
    pub root: Utf8PathBuf,
    pub packages: BTreeMap<String, Package>,
    pub lockfile: Option<Utf8PathBuf>,
}

impl Workspace {
    pub fn package(&self, name: &str) -> Option<&Package> {
        self.packages.get(name)
    }

    pub fn package_dir(&self, name: &str) -> Option<Utf8PathBuf> {
        self.packages.get(name).map(|pkg| self.root.join(&pkg.dir))
    }
}

/// Discovers workspace packages from the root `package.json`'s `workspaces`
/// globs. Supported patterns are literal directories (`tools/cli`) and
/// single-level stars (`packages/*`).
pub fn discover_workspace(root: &Utf8Path) -> Result<Workspace, Error> {
    let root_json = PackageJson::load(&root.join("package.json"))?;
    let mut packages: BTreeMap<String, Package> = BTreeMap::new();

    for pattern in &root_json.workspaces {
        for dir in expand_workspace_glob(root, pattern)? {
            let manifest = dir.join("package.json");
            if !manifest.exists() {
                continue;
            }
            let json = PackageJson::load(&manifest)?;
            let rel_dir = dir
                .strip_prefix(root)
                .expect("workspace members live under the root")
                .to_owned();
            let package = Package::from_package_json(rel_dir, json)?;
            if let Some(existing) = packages.get(&package.name) {
                return Err(Error::DuplicatePackage {
                    name: package.name.clone(),
                    first: existing.dir.clone(),
                    second: package.dir.clone(),
                });
            }
            packages.insert(package.name.clone(), package);
        }
    }

    let lockfile = LOCKFILES
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.exists());
    debug!(
        packages = packages.len(),
        lockfile = ?lockfile,
        "discovered workspace at {root}"
    );

    Ok(Workspace {
        root: root.to_owned(),
        packages,
        lockfile,
    })
}

fn expand_workspace_glob(root: &Utf8Path, pattern: &str) -> Result<Vec<Utf8PathBuf>, Error> {
    match pattern.strip_suffix("/*") {
        None => Ok(vec![root.join(pattern)]),
        Some(parent) => {
            let parent = root.join(parent);
            let entries = match std::fs::read_dir(&parent) {
                Ok(entries) => entries,
                // A missing glob parent is not an error, the workspace may
                // declare directories it has not created yet.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(source) => {
                    return Err(Error::Io {
                        path: parent,
                        source,
                    })
                }
            };
            let mut dirs = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|source| Error::Io {
                    path: parent.clone(),
                    source,
                })?;
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    let path = entry.path();
                    let utf8 = Utf8PathBuf::from_path_buf(path)
                        .map_err(|p| Error::NonUtf8Path(p.display().to_string()))?;
                    dirs.push(utf8);
                }
            }
            dirs.sort();
            Ok(dirs)
        }
    }
}
