use crate::engine::{BuildError, EngineError, RepairError};
use crate::spec::SpecError;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read job file '{path}': {source}", path = path.display())]
    ReadJob {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse job file '{path}': {source}", path = path.display())]
    ParseJob {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("Structure repair failed for system '{system_id}': {source}")]
    Repair {
        system_id: String,
        #[source]
        source: RepairError,
    },

    #[error("Failed to build simulation for '{system_id}' in '{run_dir}': {source}", run_dir = run_dir.display())]
    Build {
        system_id: String,
        run_dir: PathBuf,
        #[source]
        source: BuildError,
    },

    #[error("Stage '{stage}' failed for '{system_id}': {source}")]
    Stage {
        system_id: String,
        stage: String,
        #[source]
        source: EngineError,
    },

    #[error("I/O error at '{path}': {source}", path = path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Attaches `path` to an I/O error, for use with `map_err`.
pub(crate) fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::Io {
        path: path.to_path_buf(),
        source,
    }
}
