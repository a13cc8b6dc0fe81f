//! Best-effort copy of a job's inputs into `<project>/inputs/`.

use crate::spec::JobSpec;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const INPUTS_DIR: &str = "inputs";
pub const FORCEFIELDS_DIR: &str = "forcefields";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArchiveReport {
    pub copied: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl ArchiveReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Copies the job file, every format-relevant path of every system and
/// every local forcefield file. Failures are logged and recorded, never
/// raised.
pub fn archive(job: &JobSpec, job_path: &Path, project_root: &Path) -> ArchiveReport {
    let inputs = project_root.join(INPUTS_DIR);
    let mut report = ArchiveReport::default();

    copy_into(&inputs, job_path, &mut report);

    for system in &job.systems {
        let dest = inputs.join(&system.id);
        for path in system.input_paths() {
            copy_into(&dest, path, &mut report);
        }
    }

    let ff_dir = inputs.join(FORCEFIELDS_DIR);
    if let Err(e) = fs::create_dir_all(&ff_dir) {
        warn!("inputs/: cannot create {}: {}", ff_dir.display(), e);
    }
    if let Some(forcefields) = &job.defaults.forcefield {
        for name in forcefields.iter() {
            let candidate = Path::new(name);
            // Bundled names and URLs are not local files.
            if candidate.is_file() {
                copy_into(&ff_dir, candidate, &mut report);
            } else {
                debug!(forcefield = name, "not a local file; not archived");
            }
        }
    }
    report
}

fn copy_into(dest_dir: &Path, src: &Path, report: &mut ArchiveReport) {
    match try_copy_into(dest_dir, src) {
        Ok(dest) => {
            debug!("archived {} -> {}", src.display(), dest.display());
            report.copied.push(dest);
        }
        Err(e) => {
            warn!("inputs/: failed to copy {} -> {}: {}", src.display(), dest_dir.display(), e);
            report.failed.push(src.to_path_buf());
        }
    }
}

fn try_copy_into(dest_dir: &Path, src: &Path) -> io::Result<PathBuf> {
    let name = src.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no file name")
    })?;
    if !src.is_file() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "source file not found"));
    }
    fs::create_dir_all(dest_dir)?;
    let dest = dest_dir.join(name);
    if is_same_file(src, &dest) {
        return Ok(dest);
    }
    fs::copy(src, &dest)?;
    Ok(dest)
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
