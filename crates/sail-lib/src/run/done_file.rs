//! Donefiles: per-task marker files that short-circuit unchanged work on
//! the same machine.
//!
//! A donefile lives inside the package directory under a stable,
//! hash-derived name, and holds a single sha256 over the task's current
//! inputs and the donefile contents of its upstream tasks. It is written
//! only after a task ran to success with all outputs present, which makes
//! it usable as a cache input for downstream tasks: any upstream change
//! ripples into every downstream donefile key.

use camino::{Utf8Path, Utf8PathBuf};
use sail_cache::InputHash;
use serde::Serialize;

use crate::task::TaskSpec;

const DONE_FILE_SUFFIX: &str = ".done.build.log";

/// Donefiles are co-located with package outputs so cleaning a package
/// also cleans its markers; this recognizes them in directory walks.
pub fn is_done_file(file_name: &str) -> bool {
    file_name.ends_with(DONE_FILE_SUFFIX)
}

/// The donefile path for a task: `<packageDir>/<hash>.done.build.log`,
/// where the hash covers the task identity (id + command) so renaming a
/// script or changing its command gets a fresh marker.
pub fn done_file_path(repo_root: &Utf8Path, spec: &TaskSpec) -> Utf8PathBuf {
    let command = spec.leaf().map(|leaf| leaf.command.as_str()).unwrap_or("");
    let identity = sail_hash::hash_bytes(format!("{}|{command}", spec.id));
    repo_root
        .join(&spec.package_dir)
        .join(format!("{}{DONE_FILE_SUFFIX}", &identity[..16]))
}

#[derive(Serialize)]
struct DoneFileContents<'a> {
    input_hashes: &'a [InputHash],
    upstream_done_files: &'a [String],
}

/// The hash a task's donefile should contain right now: sorted input
/// hashes plus the sorted donefile contents of upstream tasks.
pub fn expected_hash(
    mut input_hashes: Vec<InputHash>,
    mut upstream_done_files: Vec<String>,
) -> Result<String, sail_hash::Error> {
    input_hashes.sort();
    upstream_done_files.sort();
    sail_hash::hash_canonical(&DoneFileContents {
        input_hashes: &input_hashes,
        upstream_done_files: &upstream_done_files,
    })
}

/// Reads the stored hash, if any.
pub fn read(path: &Utf8Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

/// Atomically writes the donefile (temp + rename).
pub fn write(path: &Utf8Path, hash: &str) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("log.{}.tmp", std::process::id()));
    std::fs::write(&tmp, hash)?;
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}
