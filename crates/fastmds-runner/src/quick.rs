//! One-shot jobs built around a single PDB file, and the starter job file.

use crate::error::{io_at, Error, Result};
use crate::expand::Plan;
use crate::spec::{
    Defaults, Ensemble, Forcefields, JobOverrides, JobSpec, PdbInput, StageSpec, SystemInput,
    SystemSpec, Temperature, DEFAULT_PH,
};
use fastmds_core::absolutize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const AUTO_SYSTEM_ID: &str = "auto";
pub const AUTO_JOB_FILE: &str = "job.auto.yml";

pub fn auto_project_name(pdb: &Path) -> String {
    let stem = pdb
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "system".to_string());
    format!("{}-auto", stem)
}

pub fn fixed_name(pdb: &Path, dir: &Path) -> PathBuf {
    let stem = pdb
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "system".to_string());
    dir.join(format!("{}_fixed.pdb", stem))
}

pub fn auto_defaults() -> Defaults {
    Defaults {
        engine: Some("openmm".to_string()),
        platform: Some("auto".to_string()),
        temperature_k: Some(Temperature::from(300)),
        timestep_fs: Some(2.0),
        constraints: Some("HBonds".to_string()),
        minimize_tolerance_kjmol_per_nm: Some(10.0),
        minimize_max_iterations: Some(0),
        forcefield: Some(Forcefields(vec![
            "charmm36.xml".to_string(),
            "charmm36/water.xml".to_string(),
        ])),
        ionic_strength_molar: Some(0.15),
        neutralize: Some(true),
        ions: Some(Value::String("NaCl".to_string())),
        box_padding_nm: Some(1.0),
        report_interval: Some(1000),
        checkpoint_interval: Some(10000),
        ..Defaults::default()
    }
}

pub fn auto_stages() -> Vec<StageSpec> {
    vec![
        StageSpec::new("minimize", 0, None),
        StageSpec::new("nvt", 250_000, Some(Ensemble::Nvt)),
        StageSpec::new("npt", 500_000, Some(Ensemble::Npt)),
        StageSpec::new("production", 1_000_000, Some(Ensemble::Npt)),
    ]
}

/// Job for one already-fixed structure, solvated and run through the
/// standard minimize/NVT/NPT/production sequence.
pub fn auto_job(fixed_pdb: &Path, source_pdb: Option<&Path>, project: &str) -> JobSpec {
    let system = SystemSpec {
        id: AUTO_SYSTEM_ID.to_string(),
        forcefield: None,
        ph: None,
        input: SystemInput::Pdb(PdbInput {
            pdb: None,
            fixed_pdb: Some(fixed_pdb.to_path_buf()),
            source_pdb: source_pdb.map(Path::to_path_buf),
        }),
        extra: BTreeMap::new(),
    };
    JobSpec {
        project: project.to_string(),
        defaults: auto_defaults(),
        stages: auto_stages(),
        systems: vec![system],
        sweep: None,
    }
}

pub fn quick_ph(overrides: Option<&JobOverrides>) -> f64 {
    overrides
        .and_then(|o| o.defaults.as_ref())
        .and_then(|d| d.ph)
        .unwrap_or(DEFAULT_PH)
}

/// Dry-run plan for a one-shot job. Nothing is repaired: the structure is
/// assumed to repair into `<stem>_fixed.pdb` beside the input.
pub fn resolve_quick_plan(
    pdb: &Path,
    output_root: &Path,
    overrides: Option<&Path>,
) -> Result<Plan> {
    let overrides = overrides.map(JobOverrides::load).transpose()?;
    let placeholder = fixed_name(pdb, pdb.parent().unwrap_or(Path::new("")));
    let mut job = auto_job(&placeholder, Some(pdb), &auto_project_name(pdb));
    if let Some(over) = overrides {
        job = job.with_overrides(over);
    }
    job.validate()?;
    let root = absolutize(output_root).map_err(io_at(output_root))?;
    Ok(Plan::for_job(&job, &root))
}

const EXAMPLE_JOB: &str = "\
# fastmds job file. Run with: fastmds simulate -s job.yml
project: example-project

defaults:
  engine: openmm
  platform: auto              # auto | CUDA | OpenCL | CPU
  ph: 7.0                     # used when repairing raw `pdb` inputs
  temperature_K: 300
  timestep_fs: 2.0
  constraints: HBonds
  minimize_tolerance_kjmol_per_nm: 10.0
  minimize_max_iterations: 0
  forcefield: [charmm36.xml, charmm36/water.xml]
  ionic_strength_molar: 0.15
  neutralize: true
  ions: NaCl
  box_padding_nm: 1.0
  report_interval: 1000
  checkpoint_interval: 10000

stages:
  - { name: minimize, steps: 0 }
  - { name: nvt, steps: 250000, ensemble: NVT }
  - { name: npt, steps: 500000, ensemble: NPT }
  - { name: production, steps: 1000000, ensemble: NPT }

systems:
  - id: protein1
    pdb: protein.pdb          # raw structure, repaired before use
    # fixed_pdb: protein_fixed.pdb

sweep:
  temperature_K: [300]
";

pub fn write_example_config(path: &Path, force: bool) -> Result<()> {
    if !force && path.exists() {
        return Err(Error::Io {
            path: path.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                "file already exists (use --force)",
            ),
        });
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_at(parent))?;
    }
    fs::write(path, EXAMPLE_JOB).map_err(io_at(path))
}
