//! In-process stand-ins for the external capabilities.

use crate::engine::{
    BuildError, BuildRequest, EngineError, RepairError, SimulationEngine, StructureRepair,
};
use crate::spec::{Defaults, StageSpec};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Default)]
pub struct RecordingRepair {
    fail: bool,
    calls: RefCell<Vec<(PathBuf, PathBuf, f64)>>,
}

impl RecordingRepair {
    pub fn failing() -> Self {
        RecordingRepair {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(PathBuf, PathBuf, f64)> {
        self.calls.borrow().clone()
    }
}

impl StructureRepair for RecordingRepair {
    fn repair(&self, input: &Path, output: &Path, ph: f64) -> Result<(), RepairError> {
        self.calls
            .borrow_mut()
            .push((input.to_path_buf(), output.to_path_buf(), ph));
        if self.fail {
            return Err(RepairError::Failed {
                program: "fake-fixer".to_string(),
                status: "exit status: 1".to_string(),
                detail: "cannot repair".to_string(),
            });
        }
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(output, format!("REMARK repaired at pH {}\n", ph))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildCall {
    pub system_id: String,
    pub run_dir: PathBuf,
    pub defaults: Defaults,
    pub suppressed: BTreeSet<String>,
}

/// Engine that accepts everything except the options it is told to reject,
/// each of which it reports once as unsupported.
#[derive(Default)]
pub struct RecordingEngine {
    reject_options: Vec<String>,
    fail_stage: Option<String>,
    builds: RefCell<Vec<BuildCall>>,
    stages: RefCell<Vec<(String, PathBuf)>>,
}

pub struct FakeSim {
    pub system_id: String,
}

impl RecordingEngine {
    pub fn rejecting(options: &[&str]) -> Self {
        RecordingEngine {
            reject_options: options.iter().map(|o| o.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn failing_stage(name: &str) -> Self {
        RecordingEngine {
            fail_stage: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn builds(&self) -> Vec<BuildCall> {
        self.builds.borrow().clone()
    }

    pub fn stages(&self) -> Vec<(String, PathBuf)> {
        self.stages.borrow().clone()
    }
}

impl SimulationEngine for RecordingEngine {
    type Handle = FakeSim;

    fn build(&self, request: &BuildRequest<'_>) -> Result<FakeSim, BuildError> {
        self.builds.borrow_mut().push(BuildCall {
            system_id: request.system.id.clone(),
            run_dir: request.run_dir.to_path_buf(),
            defaults: request.defaults.clone(),
            suppressed: request.suppressed_options.clone(),
        });
        if let Some(key) = self
            .reject_options
            .iter()
            .find(|k| !request.suppressed_options.contains(*k))
        {
            return Err(BuildError::UnsupportedOption { key: key.clone() });
        }
        fs::write(request.run_dir.join("topology.pdb"), "MODEL\n").map_err(EngineError::from)?;
        Ok(FakeSim {
            system_id: request.system.id.clone(),
        })
    }

    fn run_stage(
        &self,
        sim: &mut FakeSim,
        stage: &StageSpec,
        stage_dir: &Path,
        _defaults: &Defaults,
    ) -> Result<(), EngineError> {
        self.stages
            .borrow_mut()
            .push((format!("{}:{}", sim.system_id, stage.name), stage_dir.to_path_buf()));
        if self.fail_stage.as_deref() == Some(stage.name.as_str()) {
            return Err(EngineError::Rejected {
                op: "stage".to_string(),
                kind: "runtime".to_string(),
                message: "NaN in positions".to_string(),
            });
        }
        Ok(())
    }
}
