//! Capabilities the orchestrator delegates to: structure repair, simulation
//! build and stage execution. The physics lives behind these traits.

mod bridge;
mod probe;
mod repair;

pub use bridge::{BridgeEngine, BridgeSession, DEFAULT_ENGINE_COMMAND, ENGINE_CMD_ENV};
pub use probe::{python_interpreter, python_package_version, NOT_AVAILABLE, PYTHON_ENV};
pub use repair::{PdbFixerCli, DEFAULT_PDBFIXER};

use crate::spec::{Defaults, StageSpec, SystemSpec};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("input structure '{path}' does not exist", path = path.display())]
    MissingInput { path: PathBuf },

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("'{program}' exited with {status}: {detail}")]
    Failed {
        program: String,
        status: String,
        detail: String,
    },

    #[error("repaired structure '{path}' was not written", path = path.display())]
    MissingOutput { path: PathBuf },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start engine worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("engine worker I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("engine worker protocol error: {0}")]
    Protocol(String),

    #[error("engine rejected '{op}' ({kind}): {message}")]
    Rejected {
        op: String,
        kind: String,
        message: String,
    },
}

/// Outcome of a failed build. Only `UnsupportedOption` is retryable.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("engine does not accept option '{key}'")]
    UnsupportedOption { key: String },

    #[error(transparent)]
    Fatal(#[from] EngineError),
}

/// Completes a raw structure into a simulation-ready one. Implementations
/// must fail rather than leave a partially repaired file behind.
pub trait StructureRepair {
    fn repair(&self, input: &Path, output: &Path, ph: f64) -> Result<(), RepairError>;

    fn versions(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

pub struct BuildRequest<'a> {
    pub system: &'a SystemSpec,
    pub defaults: &'a Defaults,
    pub run_dir: &'a Path,
    /// System-construction options the engine must leave out.
    pub suppressed_options: &'a BTreeSet<String>,
}

pub trait SimulationEngine {
    type Handle;

    /// Builds a simulation for one execution unit and writes
    /// `topology.pdb` into the run directory.
    fn build(&self, request: &BuildRequest<'_>) -> Result<Self::Handle, BuildError>;

    fn run_stage(
        &self,
        sim: &mut Self::Handle,
        stage: &StageSpec,
        stage_dir: &Path,
        defaults: &Defaults,
    ) -> Result<(), EngineError>;

    fn versions(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}
