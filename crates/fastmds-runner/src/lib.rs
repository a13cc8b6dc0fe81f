//! Job planning and execution for molecular-dynamics campaigns.
//!
//! A job file names a project, shared defaults, a stage list, the systems to
//! simulate and an optional temperature sweep. The [`Orchestrator`] turns it
//! into one run directory per (system, temperature) pair, repairing raw
//! structures, archiving inputs and recording provenance on the way. The
//! physics is delegated to a [`SimulationEngine`] and structure repair to a
//! [`StructureRepair`] implementation.

pub mod analysis;
pub mod archive;
pub mod driver;
pub mod engine;
mod error;
pub mod expand;
pub mod logging;
pub mod normalize;
mod orchestrator;
pub mod quick;
pub mod spec;

#[cfg(test)]
mod testing;

pub use analysis::{analyze_project, build_analyze_cmd, runs_with_production, AnalysisOptions};
pub use archive::{archive, ArchiveReport};
pub use driver::{RunDriver, DONE_MARKER};
pub use engine::{
    BridgeEngine, BuildError, BuildRequest, EngineError, PdbFixerCli, RepairError,
    SimulationEngine, StructureRepair,
};
pub use error::{Error, Result};
pub use expand::{expand, resolve_plan, ExecutionUnit, Expansion, Plan, PlannedRun, PlannedStage};
pub use logging::{FileSinkHandle, LogContext, LogStyle};
pub use normalize::normalize;
pub use orchestrator::{Orchestrator, ProjectMeta, JOB_COPY, META_FILE};
pub use quick::{resolve_quick_plan, write_example_config};
pub use spec::{JobOverrides, JobSpec, SpecError, SystemFormat, SystemSpec};
