//! `sail clean`: removes task outputs and donefiles. The shared cache is
//! never touched, that is what makes clean+rebuild loops cheap.

use camino::Utf8Path;
use sail_config::SailConfig;
use sail_repo::Workspace;
use tracing::debug;

use crate::{
    run::done_file,
    task::simple_glob,
    Error,
};

#[derive(Debug, Clone, Default)]
pub struct CleanOpts {
    /// Package name glob; `--all` ignores it.
    pub filter: Option<String>,
    pub all: bool,
}

/// Deletes output files and donefiles for the selected packages. Returns
/// the number of files removed.
pub fn clean(repo_root: &Utf8Path, opts: CleanOpts) -> Result<usize, Error> {
    let config = SailConfig::load(repo_root)?;
    let workspace = sail_repo::discover_workspace(repo_root)?;

    let mut removed = 0;
    for name in workspace.packages.keys() {
        if !opts.all {
            if let Some(pattern) = &opts.filter {
                if !simple_glob::glob_match(pattern, name) {
                    continue;
                }
            }
        }
        removed += clean_package(&workspace, &config, name)?;
    }
    debug!(removed, "clean finished");
    Ok(removed)
}

fn clean_package(
    workspace: &Workspace,
    config: &SailConfig,
    package_name: &str,
) -> Result<usize, Error> {
    let package = workspace
        .package(package_name)
        .expect("iterating workspace packages");
    let package_dir = workspace.root.join(&package.dir);
    let overlay = SailConfig::load_package_overlay(&package_dir)?;
    let table = config.tasks_for_package(overlay.as_ref());

    // Output globs of every configured task, plus the tool defaults for
    // the scripts this package actually has.
    let mut output_globs: Vec<String> = Vec::new();
    for (task_name, entry) in table.iter() {
        output_globs.extend(entry.outputs.iter().cloned());
        if let Some(command) = package.script(task_name) {
            output_globs.extend(
                crate::task::Tool::infer(command)
                    .default_output_globs()
                    .iter()
                    .map(|s| s.to_string()),
            );
        }
    }
    output_globs.sort();
    output_globs.dedup();

    let mut removed = 0;
    let walk = walkdir::WalkDir::new(&package_dir)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            name != "node_modules" && name != ".git"
        });
    for entry in walk.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(rel) = path
            .strip_prefix(package_dir.as_std_path())
            .ok()
            .and_then(|p| p.to_str())
        else {
            continue;
        };
        let is_output = simple_glob::any_match(&output_globs, rel);
        let is_done_file = done_file::is_done_file(rel);
        if (is_output || is_done_file) && std::fs::remove_file(path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
