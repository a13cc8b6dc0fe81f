//! Declarative job description: project, defaults, stages, systems, sweep.

mod defaults;
mod system;

pub use defaults::{
    Defaults, Forcefields, IntegratorBlock, IntegratorSpec, Temperature, DEFAULT_PH,
    DEFAULT_TEMPERATURE_K, DEFAULT_TIMESTEP_FS, SUPPORTED_INTEGRATORS,
};
pub use system::{
    detect_format, AmberInput, CharmmInput, GromacsInput, PdbInput, SystemFormat, SystemInput,
    SystemSpec,
};

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum SpecError {
    #[error("Unrecognized system spec: no input format matches keys [{keys}]")]
    UnrecognizedSystem { keys: String },

    #[error("{format} system is missing required key '{key}'")]
    MissingKey { format: SystemFormat, key: String },

    #[error("invalid value for '{key}': {reason}")]
    InvalidField { key: String, reason: String },

    #[error("invalid job specification: {0}")]
    Invalid(String),
}

/// Sampling regime of a stage. Only `NPT` adds a barostat; any other name
/// is passed through to the engine untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ensemble {
    Nvt,
    Npt,
    Other(String),
}

impl Ensemble {
    pub fn as_str(&self) -> &str {
        match self {
            Ensemble::Nvt => "NVT",
            Ensemble::Npt => "NPT",
            Ensemble::Other(name) => name,
        }
    }

    pub fn uses_barostat(&self) -> bool {
        matches!(self, Ensemble::Npt)
    }
}

impl Serialize for Ensemble {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Ensemble {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let name = raw.trim();
        Ok(match name.to_uppercase().as_str() {
            "NVT" => Ensemble::Nvt,
            "NPT" => Ensemble::Npt,
            _ => Ensemble::Other(name.to_string()),
        })
    }
}

/// One simulation phase. A stage named `minimize` (any case) runs energy
/// minimization before its steps and records no trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub steps: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensemble: Option<Ensemble>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_interval: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl StageSpec {
    pub fn new(name: &str, steps: u64, ensemble: Option<Ensemble>) -> Self {
        StageSpec {
            name: name.to_string(),
            steps,
            ensemble,
            report_interval: None,
            checkpoint_interval: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn is_minimize(&self) -> bool {
        self.name.eq_ignore_ascii_case("minimize")
    }

    pub fn ensemble(&self) -> Ensemble {
        self.ensemble.clone().unwrap_or(Ensemble::Nvt)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sweep {
    #[serde(
        rename = "temperature_K",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub temperature_k: Option<Vec<Temperature>>,
    /// Conditions other than temperature; recognized but not expanded.
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub project: String,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
    pub systems: Vec<SystemSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep: Option<Sweep>,
}

/// Partial job used to override an automatically built one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobOverrides {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub defaults: Option<Defaults>,
    #[serde(default)]
    pub stages: Option<Vec<StageSpec>>,
    #[serde(default)]
    pub systems: Option<Vec<SystemSpec>>,
    #[serde(default)]
    pub sweep: Option<Sweep>,
}

impl JobOverrides {
    pub fn load(path: &Path) -> Result<JobOverrides> {
        let raw = fs::read_to_string(path).map_err(|source| Error::ReadJob {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(JobOverrides::default());
        }
        serde_yaml::from_str(&raw).map_err(|source| Error::ParseJob {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl JobSpec {
    /// Reads, parses and validates a YAML job file.
    pub fn load(path: &Path) -> Result<JobSpec> {
        let raw = fs::read_to_string(path).map_err(|source| Error::ReadJob {
            path: path.to_path_buf(),
            source,
        })?;
        let job: JobSpec = serde_yaml::from_str(&raw).map_err(|source| Error::ParseJob {
            path: path.to_path_buf(),
            source,
        })?;
        job.validate()?;
        Ok(job)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Spec(SpecError::Invalid(e.to_string())))
    }

    /// Sweep temperatures, or the single default temperature when unswept.
    pub fn temperatures(&self) -> Vec<Temperature> {
        self.sweep
            .as_ref()
            .and_then(|s| s.temperature_k.clone())
            .unwrap_or_else(|| vec![self.defaults.temperature()])
    }

    pub fn with_overrides(mut self, overrides: JobOverrides) -> JobSpec {
        if let Some(project) = overrides.project {
            self.project = project;
        }
        if let Some(defaults) = overrides.defaults {
            self.defaults = self.defaults.layered(&defaults);
        }
        if let Some(stages) = overrides.stages {
            self.stages = stages;
        }
        if let Some(systems) = overrides.systems {
            self.systems = systems;
        }
        if let Some(sweep) = overrides.sweep {
            self.sweep = Some(sweep);
        }
        self
    }

    pub fn validate(&self) -> std::result::Result<(), SpecError> {
        let project = self.project.trim();
        if project.is_empty() {
            return Err(SpecError::Invalid("'project' must not be empty".to_string()));
        }
        if project.contains('/') || project.contains('\\') || project == "." || project == ".." {
            return Err(SpecError::Invalid(format!(
                "'project' must be a plain directory name, got '{}'",
                self.project
            )));
        }
        if self.systems.is_empty() {
            return Err(SpecError::Invalid(
                "'systems' must list at least one system".to_string(),
            ));
        }
        let mut ids = BTreeSet::new();
        for system in &self.systems {
            if !ids.insert(system.id.as_str()) {
                return Err(SpecError::Invalid(format!(
                    "duplicate system id '{}'",
                    system.id
                )));
            }
        }
        for (idx, stage) in self.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(SpecError::Invalid(format!("stage #{} has an empty name", idx + 1)));
            }
        }
        let mut labels = BTreeSet::new();
        for t in self.temperatures() {
            let kelvin = t.kelvin();
            if kelvin.is_nan() || kelvin <= 0.0 {
                return Err(SpecError::Invalid(format!(
                    "temperature must be positive, got {}",
                    t
                )));
            }
            if !labels.insert(t.to_string()) {
                return Err(SpecError::Invalid(format!("duplicate sweep temperature {}", t)));
            }
        }
        if let Some(engine) = &self.defaults.engine {
            if !engine.eq_ignore_ascii_case("openmm") {
                return Err(SpecError::Invalid(format!(
                    "unsupported engine '{}' (only 'openmm' is available)",
                    engine
                )));
            }
        }
        if let Some(integrator) = &self.defaults.integrator {
            let name = integrator.name();
            if !SUPPORTED_INTEGRATORS.contains(&name.as_str()) {
                return Err(SpecError::Invalid(format!(
                    "unsupported integrator '{}'; use one of: {}",
                    name,
                    SUPPORTED_INTEGRATORS.join(", ")
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = "\
project: demo
defaults:
  temperature_K: 300
  timestep_fs: 2.0
  ph: 7.0
stages:
  - { name: minimize, steps: 0 }
  - { name: nvt, steps: 5000, ensemble: nvt }
  - { name: npt, steps: 5000, ensemble: NPT, report_interval: 100 }
systems:
  - { id: protA, fixed_pdb: a_fixed.pdb }
  - { id: ligB, prmtop: b.prmtop, inpcrd: b.inpcrd }
sweep:
  temperature_K: [300, 310]
";

    fn parse(yaml: &str) -> JobSpec {
        serde_yaml::from_str(yaml).expect("job yaml")
    }

    #[test]
    fn parses_a_complete_job() {
        let job = parse(JOB);
        job.validate().expect("valid");
        assert_eq!(job.project, "demo");
        assert_eq!(job.stages.len(), 3);
        assert!(job.stages[0].is_minimize());
        assert_eq!(job.stages[1].ensemble(), Ensemble::Nvt);
        assert_eq!(job.stages[2].ensemble(), Ensemble::Npt);
        assert_eq!(job.stages[2].report_interval, Some(100));
        assert_eq!(job.systems[0].format(), SystemFormat::Pdb);
        assert_eq!(job.systems[1].format(), SystemFormat::Amber);
        let temps: Vec<String> = job.temperatures().iter().map(|t| t.to_string()).collect();
        assert_eq!(temps, vec!["300", "310"]);
    }

    #[test]
    fn minimize_is_detected_case_insensitively() {
        assert!(StageSpec::new("MINIMIZE", 0, None).is_minimize());
        assert!(StageSpec::new("Minimize", 0, None).is_minimize());
        assert!(!StageSpec::new("minimize2", 0, None).is_minimize());
        assert_eq!(StageSpec::new("nvt", 10, None).ensemble(), Ensemble::Nvt);
    }

    #[test]
    fn unknown_ensembles_run_without_barostat() {
        let job = parse(
            "project: p\nstages:\n  - { name: nve, steps: 10, ensemble: nve }\n  - { name: npt, steps: 10, ensemble: npt }\nsystems: [{ fixed_pdb: x.pdb }]\n",
        );
        let nve = job.stages[0].ensemble();
        assert_eq!(nve, Ensemble::Other("nve".to_string()));
        assert!(!nve.uses_barostat());
        assert!(job.stages[1].ensemble().uses_barostat());
        let yaml = job.to_yaml().expect("yaml");
        assert!(yaml.contains("ensemble: nve"), "{}", yaml);
    }

    #[test]
    fn missing_sweep_uses_default_temperature() {
        let job = parse("project: p\ndefaults: { temperature_K: 320 }\nsystems: [{ fixed_pdb: x.pdb }]\n");
        let temps: Vec<String> = job.temperatures().iter().map(|t| t.to_string()).collect();
        assert_eq!(temps, vec!["320"]);
        let bare = parse("project: p\nsystems: [{ fixed_pdb: x.pdb }]\n");
        assert_eq!(bare.temperatures()[0].to_string(), "300");
    }

    #[test]
    fn unrecognized_system_fails_to_parse() {
        let err = serde_yaml::from_str::<JobSpec>("project: p\nsystems: [{ id: x, xyz: a.xyz }]\n")
            .expect_err("unrecognized");
        assert!(err.to_string().contains("Unrecognized system spec"), "{}", err);
    }

    #[test]
    fn validate_rejects_duplicate_ids_and_bad_project_names() {
        let dup = parse("project: p\nsystems: [{ id: a, fixed_pdb: x.pdb }, { id: a, fixed_pdb: y.pdb }]\n");
        assert!(dup.validate().expect_err("dup").to_string().contains("duplicate system id"));

        let nested = parse("project: a/b\nsystems: [{ fixed_pdb: x.pdb }]\n");
        assert!(nested.validate().is_err());

        let empty = parse("project: p\nsystems: []\n");
        assert!(empty.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_sweep_values() {
        let job = parse("project: p\nsystems: [{ fixed_pdb: x.pdb }]\nsweep: { temperature_K: [300, 300] }\n");
        assert!(job
            .validate()
            .expect_err("dup temps")
            .to_string()
            .contains("duplicate sweep temperature"));
    }

    #[test]
    fn validate_rejects_unknown_engine_and_integrator() {
        let engine = parse("project: p\ndefaults: { engine: gromacs }\nsystems: [{ fixed_pdb: x.pdb }]\n");
        assert!(engine.validate().is_err());
        let integrator =
            parse("project: p\ndefaults: { integrator: leapfrog }\nsystems: [{ fixed_pdb: x.pdb }]\n");
        assert!(integrator
            .validate()
            .expect_err("integrator")
            .to_string()
            .contains("unsupported integrator"));
    }

    #[test]
    fn overrides_layer_defaults_and_replace_lists() {
        let job = parse(JOB);
        let overrides: JobOverrides = serde_yaml::from_str(
            "defaults: { timestep_fs: 4.0 }\nstages: [{ name: production, steps: 100 }]\n",
        )
        .expect("overrides");
        let merged = job.with_overrides(overrides);
        assert_eq!(merged.defaults.timestep_fs, Some(4.0));
        assert_eq!(merged.defaults.ph, Some(7.0));
        assert_eq!(merged.stages.len(), 1);
        assert_eq!(merged.stages[0].name, "production");
        assert_eq!(merged.systems.len(), 2);
    }

    #[test]
    fn yaml_round_trip_preserves_ids_and_formats() {
        let job = parse(JOB);
        let reloaded = parse(&job.to_yaml().expect("yaml"));
        assert_eq!(reloaded.systems.len(), job.systems.len());
        for (a, b) in job.systems.iter().zip(&reloaded.systems) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.format(), b.format());
        }
        assert_eq!(reloaded.stages, job.stages);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = JobSpec::load(&dir.path().join("nope.yml")).expect_err("missing");
        assert!(matches!(err, Error::ReadJob { .. }));
    }
}
