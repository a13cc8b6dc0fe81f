use crate::archive::archive;
use crate::driver::RunDriver;
use crate::engine::{
    BridgeEngine, PdbFixerCli, SimulationEngine, StructureRepair, NOT_AVAILABLE,
};
use crate::error::{io_at, Error, Result};
use crate::expand::{expand, resolve_plan, Plan};
use crate::logging::{FileSinkHandle, LogContext, PROJECT_LOG_FILE};
use crate::normalize::{build_dir, normalize};
use crate::quick::{auto_job, auto_project_name, fixed_name, quick_ph, AUTO_JOB_FILE, AUTO_SYSTEM_ID};
use crate::spec::{JobOverrides, JobSpec};
use chrono::Utc;
use fastmds_core::{absolutize, atomic_write_bytes, atomic_write_json_pretty, ensure_dir, sha256_file};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const META_FILE: &str = "meta.json";
pub const JOB_COPY: &str = "job.yml";

/// Provenance record kept at `<project>/meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub time_start: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_end: Option<f64>,
    pub config_sha256: String,
    pub cli_argv: Vec<String>,
    pub versions: BTreeMap<String, String>,
}

impl ProjectMeta {
    pub fn load(path: &Path) -> Result<ProjectMeta> {
        let bytes = fs::read(path).map_err(io_at(path))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: std::io::Error::other(e),
        })
    }

    fn write(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, self).map_err(io_at(path))
    }
}

fn lossy_argv(args: impl IntoIterator<Item = OsString>) -> Vec<String> {
    args.into_iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect()
}

fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

struct FileSinkGuard<'a> {
    logs: &'a LogContext,
    handle: Option<FileSinkHandle>,
}

impl Drop for FileSinkGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.logs.detach(handle);
        }
    }
}

/// Composition root: load, normalize, archive, expand and run.
pub struct Orchestrator<R, E> {
    repair: R,
    engine: E,
    logs: Option<LogContext>,
    argv: Vec<String>,
}

impl Orchestrator<PdbFixerCli, BridgeEngine> {
    pub fn with_default_capabilities() -> Self {
        Orchestrator::new(PdbFixerCli::default(), BridgeEngine::from_env())
    }
}

impl<R, E> Orchestrator<R, E>
where
    R: StructureRepair,
    E: SimulationEngine,
{
    pub fn new(repair: R, engine: E) -> Self {
        Orchestrator {
            repair,
            engine,
            logs: None,
            argv: lossy_argv(std::env::args_os()),
        }
    }

    pub fn with_logging(mut self, logs: LogContext) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn with_argv(mut self, argv: Vec<String>) -> Self {
        self.argv = argv;
        self
    }

    pub fn repair(&self) -> &R {
        &self.repair
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn logs(&self) -> Option<&LogContext> {
        self.logs.as_ref()
    }

    /// Tool fingerprint: this crate, the platform and whatever the
    /// capabilities report.
    pub fn versions(&self) -> BTreeMap<String, String> {
        let mut versions = BTreeMap::new();
        versions.insert("fastmds".to_string(), env!("CARGO_PKG_VERSION").to_string());
        versions.insert("os".to_string(), std::env::consts::OS.to_string());
        versions.insert("arch".to_string(), std::env::consts::ARCH.to_string());
        versions.extend(self.repair.versions());
        versions.extend(self.engine.versions());
        versions
    }

    pub fn resolve_plan(&self, job_path: &Path, output_root: &Path) -> Result<Plan> {
        resolve_plan(job_path, output_root)
    }

    fn attach_project_log(&self, project_dir: &Path) -> Option<FileSinkGuard<'_>> {
        let logs = self.logs.as_ref()?;
        let path = project_dir.join(PROJECT_LOG_FILE);
        match logs.attach_file(&path) {
            Ok(handle) => Some(FileSinkGuard {
                logs,
                handle: Some(handle),
            }),
            Err(e) => {
                warn!("cannot log to {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Runs a job file end to end and returns `<output_root>/<project>`.
    pub fn run_from_spec(&self, job_path: &Path, output_root: &Path) -> Result<PathBuf> {
        let job = JobSpec::load(job_path)?;
        let root = absolutize(output_root).map_err(io_at(output_root))?;
        let project_dir = root.join(&job.project);
        ensure_dir(&project_dir).map_err(io_at(&project_dir))?;
        let _log_guard = self.attach_project_log(&project_dir);

        let versions = self.versions();
        info!(
            "fastmds {} | OS {} | arch {}",
            versions.get("fastmds").map(String::as_str).unwrap_or(NOT_AVAILABLE),
            versions.get("os").map(String::as_str).unwrap_or(NOT_AVAILABLE),
            versions.get("arch").map(String::as_str).unwrap_or(NOT_AVAILABLE),
        );
        let engine_versions: Vec<String> = versions
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "fastmds" | "os" | "arch"))
            .map(|(k, v)| format!("{} {}", k, v))
            .collect();
        if !engine_versions.is_empty() {
            info!("{}", engine_versions.join(" | "));
        }
        info!("Command: {}", self.argv.join(" "));
        info!("Project: {}", job.project);
        info!("Output:  {}", project_dir.display());

        let meta_path = project_dir.join(META_FILE);
        let mut meta = ProjectMeta {
            time_start: epoch_seconds(),
            time_end: None,
            config_sha256: sha256_file(job_path).map_err(io_at(job_path))?,
            cli_argv: self.argv.clone(),
            versions,
        };
        meta.write(&meta_path)?;

        let job_copy = project_dir.join(JOB_COPY);
        if !same_file(job_path, &job_copy) {
            fs::copy(job_path, &job_copy).map_err(io_at(&job_copy))?;
        }

        let normalized = normalize(&job, &project_dir, &self.repair)?;
        let report = archive(&normalized, job_path, &project_dir);
        if !report.is_complete() {
            warn!("{} input file(s) could not be archived", report.failed.len());
        }

        let expansion = expand(&normalized, &root);
        info!("{} run(s) planned", expansion.runs.len());
        RunDriver::new(&self.engine).execute(&expansion.runs, &normalized.defaults)?;
        info!("All runs completed.");

        meta.time_end = Some(epoch_seconds());
        meta.write(&meta_path)?;
        Ok(project_dir)
    }

    /// One-shot flow: repair `pdb`, build the automatic job (layered with
    /// the optional overrides file) and run it.
    pub fn simulate_from_pdb(
        &self,
        pdb: &Path,
        output_root: &Path,
        overrides: Option<&Path>,
    ) -> Result<PathBuf> {
        let overrides = overrides.map(JobOverrides::load).transpose()?;
        let source = absolutize(pdb).map_err(io_at(pdb))?;
        let project = overrides
            .as_ref()
            .and_then(|o| o.project.clone())
            .unwrap_or_else(|| auto_project_name(&source));
        let root = absolutize(output_root).map_err(io_at(output_root))?;
        let build = build_dir(&root.join(&project));
        let fixed = fixed_name(&source, &build);
        let ph = quick_ph(overrides.as_ref());

        let mut job = auto_job(&fixed, Some(&source), &project);
        if let Some(over) = overrides {
            job = job.with_overrides(over);
        }
        job.validate()?;

        ensure_dir(&build).map_err(io_at(&build))?;
        info!("Fixing PDB: {} (pH={})", source.display(), ph);
        self.repair
            .repair(&source, &fixed, ph)
            .map_err(|e| Error::Repair {
                system_id: AUTO_SYSTEM_ID.to_string(),
                source: e,
            })?;

        let job_path = build.join(AUTO_JOB_FILE);
        let yaml = job.to_yaml()?;
        atomic_write_bytes(&job_path, yaml.as_bytes()).map_err(io_at(&job_path))?;
        self.run_from_spec(&job_path, &root)
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::is_complete;
    use crate::testing::{RecordingEngine, RecordingRepair};

    fn orchestrator() -> Orchestrator<RecordingRepair, RecordingEngine> {
        Orchestrator::new(RecordingRepair::default(), RecordingEngine::default())
            .with_argv(vec!["fastmds".to_string(), "simulate".to_string()])
    }

    #[test]
    fn versions_include_platform_and_crate() {
        let v = orchestrator().versions();
        assert_eq!(v.get("fastmds").map(String::as_str), Some(env!("CARGO_PKG_VERSION")));
        assert!(v.contains_key("os"));
        assert!(v.contains_key("arch"));
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_arguments_are_recorded_lossily() {
        use std::os::unix::ffi::OsStringExt;
        let argv = lossy_argv([
            OsString::from("fastmds"),
            OsString::from_vec(vec![b'j', 0xff, b'.', b'y', b'm', b'l']),
        ]);
        assert_eq!(argv, vec!["fastmds".to_string(), "j\u{FFFD}.yml".to_string()]);
    }

    #[test]
    fn one_shot_repairs_once_and_runs_the_auto_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pdb = dir.path().join("prot.pdb");
        fs::write(&pdb, "ATOM\n").expect("pdb");
        let over = dir.path().join("over.yml");
        fs::write(
            &over,
            "defaults: { ph: 6.5 }\nstages: [{ name: minimize, steps: 0 }]\n",
        )
        .expect("overrides");

        let orch = orchestrator();
        let project = orch
            .simulate_from_pdb(&pdb, &dir.path().join("out"), Some(&over))
            .expect("simulate");

        assert_eq!(project, dir.path().join("out/prot-auto"));
        let calls = orch.repair().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, project.join("_build/prot_fixed.pdb"));
        assert_eq!(calls[0].2, 6.5);
        assert!(project.join("_build").join(AUTO_JOB_FILE).is_file());
        assert!(is_complete(&project.join("auto_T300")));
        assert!(project.join("inputs/auto/prot.pdb").is_file());
    }

    #[test]
    fn one_shot_rejects_escaping_project_before_writing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pdb = dir.path().join("prot.pdb");
        fs::write(&pdb, "ATOM\n").expect("pdb");
        let over = dir.path().join("over.yml");
        fs::write(&over, "project: ../elsewhere\n").expect("overrides");
        let out = dir.path().join("out");

        let orch = orchestrator();
        orch.simulate_from_pdb(&pdb, &out, Some(&over))
            .expect_err("project escapes the output root");
        assert!(orch.repair().calls().is_empty());
        assert!(!out.exists());
        assert!(!dir.path().join("elsewhere").exists());
    }

    #[test]
    fn failed_run_leaves_meta_without_end_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = dir.path().join("job.yml");
        fs::write(
            &job,
            "project: broken\nstages: [{ name: minimize }]\nsystems: [{ id: s, fixed_pdb: s.pdb }]\n",
        )
        .expect("job");
        let orch = Orchestrator::new(
            RecordingRepair::default(),
            RecordingEngine::failing_stage("minimize"),
        );
        orch.run_from_spec(&job, &dir.path().join("out"))
            .expect_err("stage fails");
        let project = dir.path().join("out/broken");
        let meta = ProjectMeta::load(&project.join(META_FILE)).expect("meta");
        assert!(meta.time_end.is_none());
        assert!(project.join(JOB_COPY).is_file());
        assert!(!is_complete(&project.join("s_T300")));
    }
}
