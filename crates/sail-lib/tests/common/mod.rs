//! Workspace fixtures for end-to-end build tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use camino::{Utf8Path, Utf8PathBuf};

pub struct Fixture {
    _tmp: tempfile::TempDir,
    pub root: Utf8PathBuf,
}

impl Fixture {
    /// An empty workspace with the given `sail.json` contents and a
    /// lockfile.
    pub fn new(sail_json: &str) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_owned()).unwrap();
        write(
            &root.join("package.json"),
            r#"{ "name": "fixture-root", "workspaces": ["packages/*"] }"#,
        );
        write(&root.join("package-lock.json"), r#"{ "lockfileVersion": 3 }"#);
        write(&root.join("sail.json"), sail_json);
        Fixture { _tmp: tmp, root }
    }

    /// The standard config used by most scenarios: a `build` task that
    /// depends on upstream builds and produces `dist/`.
    pub fn with_build_config() -> Self {
        Fixture::new(
            r#"{
                "version": 1,
                "tasks": {
                    "build": { "dependsOn": ["^build"], "outputs": ["dist/**"] }
                },
                "sharedCache": { "directory": ".sail-cache" }
            }"#,
        )
    }

    /// Adds a package whose `build` script copies `src/index.txt` into
    /// `dist/index.txt`.
    pub fn add_copy_package(&self, name: &str, deps: &[&str]) {
        let dependencies: Vec<String> = deps
            .iter()
            .map(|dep| format!(r#""{dep}": "workspace:*""#))
            .collect();
        write(
            &self.root.join(format!("packages/{name}/package.json")),
            &format!(
                r#"{{
                    "name": "{name}",
                    "version": "1.0.0",
                    "scripts": {{ "build": "mkdir -p dist && cp src/index.txt dist/index.txt" }},
                    "dependencies": {{ {} }}
                }}"#,
                dependencies.join(", ")
            ),
        );
        write(
            &self.root.join(format!("packages/{name}/src/index.txt")),
            &format!("contents of {name}\n"),
        );
    }

    pub fn add_package_with_script(&self, name: &str, script_name: &str, command: &str) {
        write(
            &self.root.join(format!("packages/{name}/package.json")),
            &format!(
                r#"{{
                    "name": "{name}",
                    "version": "1.0.0",
                    "scripts": {{ "{script_name}": "{command}" }}
                }}"#
            ),
        );
    }

    pub fn package_file(&self, package: &str, rel: &str) -> Utf8PathBuf {
        self.root.join("packages").join(package).join(rel)
    }

    pub fn write_package_file(&self, package: &str, rel: &str, contents: &str) {
        write(&self.package_file(package, rel), contents);
    }

    pub fn run_opts(&self, tasks: &[&str]) -> sail_lib::RunOpts {
        sail_lib::RunOpts {
            tasks: tasks.iter().map(ToString::to_string).collect(),
            quiet: true,
            ..Default::default()
        }
    }
}

pub fn write(path: &Utf8Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

pub fn mtime_ms(path: &Utf8Path) -> i64 {
    let metadata = std::fs::metadata(path).unwrap();
    let mtime = filetime_from(&metadata);
    mtime.0 * 1000 + mtime.1 / 1_000_000
}

fn filetime_from(metadata: &std::fs::Metadata) -> (i64, i64) {
    use std::time::UNIX_EPOCH;
    let modified = metadata.modified().unwrap();
    let duration = modified.duration_since(UNIX_EPOCH).unwrap();
    (duration.as_secs() as i64, duration.subsec_nanos() as i64)
}
