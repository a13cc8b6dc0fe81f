//! Sequential execution of expanded units against a simulation engine.

use crate::engine::{BuildError, BuildRequest, SimulationEngine};
use crate::error::{io_at, Error, Result};
use crate::expand::ExecutionUnit;
use crate::spec::{Defaults, JobSpec};
use fastmds_core::{atomic_write_json_pretty, ensure_dir};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DONE_MARKER: &str = "done.ok";
pub const STAGE_RECORD: &str = "stage.json";

pub fn is_complete(run_dir: &Path) -> bool {
    run_dir.join(DONE_MARKER).is_file()
}

pub fn run_defaults(base: &Defaults, unit: &ExecutionUnit) -> Defaults {
    let scoped = Defaults {
        temperature_k: Some(unit.temperature.clone()),
        forcefield: unit.forcefield.clone(),
        ..Defaults::default()
    };
    base.layered(&scoped)
}

pub struct RunDriver<'a, E: SimulationEngine + ?Sized> {
    engine: &'a E,
}

impl<'a, E: SimulationEngine + ?Sized> RunDriver<'a, E> {
    pub fn new(engine: &'a E) -> Self {
        RunDriver { engine }
    }

    /// Runs every unit in order. The first failure aborts the remaining
    /// units; finished units keep their `done.ok`.
    pub fn execute(&self, units: &[ExecutionUnit], defaults: &Defaults) -> Result<Vec<PathBuf>> {
        let mut completed = Vec::with_capacity(units.len());
        for unit in units {
            self.execute_unit(unit, defaults)?;
            completed.push(unit.run_dir.clone());
        }
        Ok(completed)
    }

    pub fn execute_unit(&self, unit: &ExecutionUnit, defaults: &Defaults) -> Result<()> {
        let run_dir = &unit.run_dir;
        ensure_dir(run_dir).map_err(io_at(run_dir))?;
        let marker = run_dir.join(DONE_MARKER);
        match fs::remove_file(&marker) {
            Ok(()) => info!("removed stale {}", marker.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_at(&marker)(e)),
        }
        info!(
            "Run: {} @ {} K -> {}",
            unit.system_id,
            unit.temperature,
            run_dir.display()
        );

        let scoped = run_defaults(defaults, unit);
        let mut sim = self.build(unit, &scoped)?;

        for stage in &unit.stages {
            let stage_dir = run_dir.join(&stage.name);
            ensure_dir(&stage_dir).map_err(io_at(&stage_dir))?;
            info!(stage = %stage.name, steps = stage.steps, "stage started");
            self.engine
                .run_stage(&mut sim, stage, &stage_dir, &scoped)
                .map_err(|source| Error::Stage {
                    system_id: unit.system_id.clone(),
                    stage: stage.name.clone(),
                    source,
                })?;
            let record = stage_dir.join(STAGE_RECORD);
            atomic_write_json_pretty(&record, stage).map_err(io_at(&record))?;
        }

        fs::write(&marker, "simulation completed\n").map_err(io_at(&marker))?;
        Ok(())
    }

    /// Builds the unit's simulation, dropping each option the engine reports
    /// as unsupported. A key reported twice is fatal.
    fn build(&self, unit: &ExecutionUnit, defaults: &Defaults) -> Result<E::Handle> {
        let mut suppressed = BTreeSet::new();
        loop {
            let request = BuildRequest {
                system: &unit.input,
                defaults,
                run_dir: &unit.run_dir,
                suppressed_options: &suppressed,
            };
            match self.engine.build(&request) {
                Ok(sim) => return Ok(sim),
                Err(BuildError::UnsupportedOption { key }) if !suppressed.contains(&key) => {
                    warn!(
                        system = %unit.system_id,
                        "engine does not accept '{}'; retrying without it", key
                    );
                    suppressed.insert(key);
                }
                Err(source) => {
                    return Err(Error::Build {
                        system_id: unit.system_id.clone(),
                        run_dir: unit.run_dir.clone(),
                        source,
                    })
                }
            }
        }
    }
}

pub fn execute<E: SimulationEngine + ?Sized>(
    engine: &E,
    units: &[ExecutionUnit],
    job: &JobSpec,
) -> Result<Vec<PathBuf>> {
    RunDriver::new(engine).execute(units, &job.defaults)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expand::expand;
    use crate::testing::RecordingEngine;

    fn job(yaml: &str) -> JobSpec {
        serde_yaml::from_str(yaml).expect("job yaml")
    }

    const JOB: &str = "\
project: p
defaults: { temperature_K: 300, forcefield: [charmm36.xml] }
stages:
  - { name: minimize, steps: 0 }
  - { name: nvt, steps: 100, ensemble: NVT }
systems:
  - { id: a, fixed_pdb: a.pdb }
  - { id: b, fixed_pdb: b.pdb, forcefield: amber14-all.xml }
sweep: { temperature_K: [300, 310] }
";

    #[test]
    fn runs_every_unit_and_stage_in_order() {
        let out = tempfile::tempdir().expect("tempdir");
        let job = job(JOB);
        let exp = expand(&job, out.path());
        let engine = RecordingEngine::default();
        let done = execute(&engine, &exp.runs, &job).expect("execute");
        assert_eq!(done.len(), 4);

        let stages: Vec<String> = engine.stages().into_iter().map(|(s, _)| s).collect();
        assert_eq!(
            stages,
            vec![
                "a:minimize", "a:nvt", "a:minimize", "a:nvt", "b:minimize", "b:nvt", "b:minimize",
                "b:nvt"
            ]
        );
        for unit in &exp.runs {
            assert!(is_complete(&unit.run_dir));
            assert!(unit.run_dir.join("minimize").join(STAGE_RECORD).is_file());
            assert!(unit.run_dir.join("nvt").join(STAGE_RECORD).is_file());
        }
    }

    #[test]
    fn unit_defaults_carry_temperature_and_forcefield() {
        let out = tempfile::tempdir().expect("tempdir");
        let job = job(JOB);
        let exp = expand(&job, out.path());
        let engine = RecordingEngine::default();
        execute(&engine, &exp.runs, &job).expect("execute");
        let builds = engine.builds();
        let temps: Vec<String> = builds
            .iter()
            .map(|b| b.defaults.temperature().to_string())
            .collect();
        assert_eq!(temps, vec!["300", "310", "300", "310"]);
        let ff = |i: usize| builds[i].defaults.forcefield.clone().expect("ff").0;
        assert_eq!(ff(0), vec!["charmm36.xml"]);
        assert_eq!(ff(2), vec!["amber14-all.xml"]);
    }

    #[test]
    fn unsupported_options_are_dropped_one_by_one() {
        let out = tempfile::tempdir().expect("tempdir");
        let job = job("project: p\nstages: [{ name: minimize }]\nsystems: [{ id: s, fixed_pdb: s.pdb }]\n");
        let exp = expand(&job, out.path());
        let engine = RecordingEngine::rejecting(&["rigidWater", "ewaldErrorTolerance"]);
        execute(&engine, &exp.runs, &job).expect("execute");
        let builds = engine.builds();
        assert_eq!(builds.len(), 3);
        assert!(builds[0].suppressed.is_empty());
        assert_eq!(builds[2].suppressed.len(), 2);
        assert!(is_complete(&exp.runs[0].run_dir));
    }

    #[test]
    fn failed_stage_leaves_no_marker_and_aborts_the_job() {
        let out = tempfile::tempdir().expect("tempdir");
        let job = job(JOB);
        let exp = expand(&job, out.path());
        let engine = RecordingEngine::failing_stage("nvt");
        let err = execute(&engine, &exp.runs, &job).expect_err("stage fails");
        assert!(matches!(err, Error::Stage { ref stage, .. } if stage == "nvt"), "{:?}", err);
        assert_eq!(engine.builds().len(), 1);
        assert!(!is_complete(&exp.runs[0].run_dir));
        assert!(exp.runs[0].run_dir.join("minimize").join(STAGE_RECORD).is_file());
        assert!(!exp.runs[0].run_dir.join("nvt").join(STAGE_RECORD).exists());
        assert!(!exp.runs[1].run_dir.exists());
    }

    #[test]
    fn stale_marker_is_removed_before_rerun() {
        let out = tempfile::tempdir().expect("tempdir");
        let job = job(JOB);
        let exp = expand(&job, out.path());
        let unit = &exp.runs[0];
        fs::create_dir_all(&unit.run_dir).expect("mkdir");
        fs::write(unit.run_dir.join(DONE_MARKER), "old\n").expect("marker");
        let engine = RecordingEngine::failing_stage("minimize");
        RunDriver::new(&engine)
            .execute_unit(unit, &job.defaults)
            .expect_err("stage fails");
        assert!(!is_complete(&unit.run_dir));
    }
}
