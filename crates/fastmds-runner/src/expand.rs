//! Fan-out of a job into execution units, and the read-only plan view.

use crate::error::{io_at, Result};
use crate::spec::{Ensemble, Forcefields, JobSpec, StageSpec, SystemFormat, SystemSpec, Temperature};
use fastmds_core::absolutize;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionUnit {
    pub system_id: String,
    #[serde(rename = "temperature_K")]
    pub temperature: Temperature,
    pub run_dir: PathBuf,
    pub stages: Vec<StageSpec>,
    pub input: SystemSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forcefield: Option<Forcefields>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Expansion {
    pub project: String,
    pub output_dir: PathBuf,
    pub runs: Vec<ExecutionUnit>,
}

/// `{output_root}/{project}/{system_id}_T{temperature}`. Tools parse these
/// names, so the format is fixed.
pub fn run_dir_for(
    output_root: &Path,
    project: &str,
    system_id: &str,
    temperature: &Temperature,
) -> PathBuf {
    output_root
        .join(project)
        .join(format!("{}_T{}", system_id, temperature))
}

pub fn expand(job: &JobSpec, output_root: &Path) -> Expansion {
    let temperatures = job.temperatures();
    let mut runs = Vec::with_capacity(job.systems.len() * temperatures.len());
    for system in &job.systems {
        for t in &temperatures {
            runs.push(ExecutionUnit {
                system_id: system.id.clone(),
                temperature: t.clone(),
                run_dir: run_dir_for(output_root, &job.project, &system.id, t),
                stages: job.stages.clone(),
                input: system.clone(),
                forcefield: system.forcefield.clone(),
            });
        }
    }
    Expansion {
        project: job.project.clone(),
        output_dir: output_root.join(&job.project),
        runs,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedStage {
    pub name: String,
    pub steps: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ensemble: Option<Ensemble>,
    pub approx_ps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedRun {
    pub system_id: String,
    #[serde(rename = "temperature_K")]
    pub temperature: Temperature,
    pub format: SystemFormat,
    pub run_dir: PathBuf,
    pub stages: Vec<PlannedStage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub project: String,
    pub output_dir: PathBuf,
    pub timestep_fs: f64,
    pub runs: Vec<PlannedRun>,
}

impl Plan {
    pub fn for_job(job: &JobSpec, output_root: &Path) -> Plan {
        let timestep_fs = job.defaults.timestep_fs();
        let expansion = expand(job, output_root);
        let runs = expansion
            .runs
            .into_iter()
            .map(|unit| PlannedRun {
                format: unit.input.format(),
                stages: unit
                    .stages
                    .iter()
                    .map(|s| PlannedStage {
                        name: s.name.clone(),
                        steps: s.steps,
                        ensemble: s.ensemble.clone(),
                        approx_ps: approx_ps(s.steps, timestep_fs),
                    })
                    .collect(),
                system_id: unit.system_id,
                temperature: unit.temperature,
                run_dir: unit.run_dir,
            })
            .collect();
        Plan {
            project: expansion.project,
            output_dir: expansion.output_dir,
            timestep_fs,
            runs,
        }
    }

    pub fn total_ps(&self) -> f64 {
        self.runs
            .iter()
            .flat_map(|r| r.stages.iter())
            .map(|s| s.approx_ps)
            .sum()
    }
}

pub fn approx_ps(steps: u64, timestep_fs: f64) -> f64 {
    let ps = steps as f64 * timestep_fs / 1000.0;
    // round the stored binary value, not a rescaled copy of it
    format!("{:.3}", ps).parse().unwrap_or(ps)
}

pub fn resolve_plan(job_path: &Path, output_root: &Path) -> Result<Plan> {
    let job = JobSpec::load(job_path)?;
    let root = absolutize(output_root).map_err(io_at(output_root))?;
    Ok(Plan::for_job(&job, &root))
}
