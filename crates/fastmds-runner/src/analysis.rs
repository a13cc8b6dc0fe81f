//! Hand-off of finished production stages to the external analysis tool.

use crate::engine::python_interpreter;
use serde::Serialize;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use tracing::{error, info, warn};
use walkdir::WalkDir;

pub const ANALYSIS_PROGRAM: &str = "fastmda";
pub const ANALYSIS_MODULE: &str = "fastmdanalysis";
const OUTPUT_PREFIX: &str = "[fastmda] ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisOptions {
    pub slides: bool,
    pub frames: Option<String>,
    pub atoms: Option<String>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        AnalysisOptions {
            slides: true,
            frames: None,
            atoms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductionRun {
    pub run_dir: PathBuf,
    pub traj: PathBuf,
    pub topology: PathBuf,
}

fn analyze_args(traj: &Path, top: &Path, opts: &AnalysisOptions) -> Vec<String> {
    let mut args = vec![
        "analyze".to_string(),
        "-traj".to_string(),
        traj.display().to_string(),
        "-top".to_string(),
        top.display().to_string(),
    ];
    if opts.slides {
        args.push("--slides".to_string());
    }
    if let Some(frames) = opts.frames.as_deref().filter(|s| !s.is_empty()) {
        args.extend(["--frames".to_string(), frames.to_string()]);
    }
    if let Some(atoms) = opts.atoms.as_deref().filter(|s| !s.is_empty()) {
        args.extend(["--atoms".to_string(), atoms.to_string()]);
    }
    args
}

pub fn build_analyze_cmd(traj: &Path, top: &Path, opts: &AnalysisOptions) -> Vec<String> {
    let mut cmd = vec![ANALYSIS_PROGRAM.to_string()];
    cmd.extend(analyze_args(traj, top, opts));
    cmd
}

/// Run directories of `project_dir`, sorted by name, that hold
/// `production/traj.dcd` and `production/topology.pdb`.
pub fn runs_with_production(project_dir: &Path) -> Vec<ProductionRun> {
    WalkDir::new(project_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter_map(|entry| {
            let run_dir = entry.into_path();
            let prod = run_dir.join("production");
            let traj = prod.join("traj.dcd");
            let topology = prod.join("topology.pdb");
            (traj.is_file() && topology.is_file()).then_some(ProductionRun {
                run_dir,
                traj,
                topology,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Analyzer {
    primary: Vec<String>,
    fallback: Vec<String>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Analyzer {
            primary: vec![ANALYSIS_PROGRAM.to_string()],
            fallback: vec![
                python_interpreter(),
                "-m".to_string(),
                ANALYSIS_MODULE.to_string(),
            ],
        }
    }
}

impl Analyzer {
    pub fn new(primary: Vec<String>, fallback: Vec<String>) -> Self {
        Analyzer { primary, fallback }
    }

    /// Analyzes every production run of the project. True when at least
    /// one run was analyzed; failures are logged, never raised.
    pub fn analyze_project(&self, project_dir: &Path, opts: &AnalysisOptions) -> bool {
        if !project_dir.is_dir() {
            error!("project dir not found: {}", project_dir.display());
            return false;
        }
        let mut ok = false;
        for run in runs_with_production(project_dir) {
            let args = analyze_args(&run.traj, &run.topology, opts);
            let primary = with_args(&self.primary, &args);
            info!("run analysis: {}", primary.join(" "));
            if run_and_stream(&primary) == Some(0) {
                ok = true;
                continue;
            }
            let fallback = with_args(&self.fallback, &args);
            info!("run analysis fallback: {}", fallback.join(" "));
            match run_and_stream(&fallback) {
                Some(0) => ok = true,
                code => error!(
                    "analysis failed for {}: exit {}",
                    run.run_dir.display(),
                    code.map(|c| c.to_string()).unwrap_or_else(|| "n/a".to_string())
                ),
            }
        }
        if !ok {
            warn!("no production stages found or analysis failed; skipping analysis.");
        }
        ok
    }
}

pub fn analyze_project(project_dir: &Path, opts: &AnalysisOptions) -> bool {
    Analyzer::default().analyze_project(project_dir, opts)
}

fn with_args(program: &[String], args: &[String]) -> Vec<String> {
    program.iter().chain(args).cloned().collect()
}

fn run_and_stream(cmd: &[String]) -> Option<i32> {
    let (program, args) = cmd.split_first()?;
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            error!("{}failed to start process: {}", OUTPUT_PREFIX, e);
            return None;
        }
    };
    let stderr = child.stderr.take().map(|err| {
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        thread::spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || stream_lines(err));
        })
    });
    if let Some(out) = child.stdout.take() {
        stream_lines(out);
    }
    if let Some(handle) = stderr {
        let _ = handle.join();
    }
    child.wait().ok().and_then(|status| status.code())
}

fn stream_lines<R: Read>(reader: R) {
    for line in BufReader::new(reader).lines().map_while(Result::ok) {
        info!("{}{}", OUTPUT_PREFIX, line.trim_end());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn production(project: &Path, run: &str) {
        let prod = project.join(run).join("production");
        fs::create_dir_all(&prod).expect("mkdir");
        fs::write(prod.join("traj.dcd"), b"DCD").expect("traj");
        fs::write(prod.join("topology.pdb"), b"PDB").expect("top");
    }

    #[test]
    fn command_maps_every_option() {
        let opts = AnalysisOptions {
            slides: true,
            frames: Some("0,-1,10".to_string()),
            atoms: Some("protein".to_string()),
        };
        let cmd = build_analyze_cmd(Path::new("t.dcd"), Path::new("p.pdb"), &opts);
        assert_eq!(
            cmd,
            vec![
                "fastmda", "analyze", "-traj", "t.dcd", "-top", "p.pdb", "--slides", "--frames",
                "0,-1,10", "--atoms", "protein"
            ]
        );
        let bare = AnalysisOptions {
            slides: false,
            ..Default::default()
        };
        let cmd = build_analyze_cmd(Path::new("t.dcd"), Path::new("p.pdb"), &bare);
        assert_eq!(cmd, vec!["fastmda", "analyze", "-traj", "t.dcd", "-top", "p.pdb"]);
    }

    #[test]
    fn only_complete_production_runs_are_listed_in_name_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        production(dir.path(), "b_T300");
        production(dir.path(), "a_T310");
        fs::create_dir_all(dir.path().join("c_T300/production")).expect("mkdir");
        fs::create_dir_all(dir.path().join("inputs")).expect("mkdir");
        let runs = runs_with_production(dir.path());
        let names: Vec<String> = runs
            .iter()
            .map(|r| r.run_dir.file_name().expect("name").to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a_T310", "b_T300"]);
    }

    #[test]
    fn missing_project_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(!analyze_project(&dir.path().join("absent"), &AnalysisOptions::default()));
    }

    #[cfg(unix)]
    #[test]
    fn fallback_runs_when_primary_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        production(dir.path(), "s_T300");
        let analyzer = Analyzer::new(vec!["false".to_string()], vec!["true".to_string()]);
        assert!(analyzer.analyze_project(dir.path(), &AnalysisOptions::default()));
        let broken = Analyzer::new(
            vec!["/nonexistent/fastmda".to_string()],
            vec!["false".to_string()],
        );
        assert!(!broken.analyze_project(dir.path(), &AnalysisOptions::default()));
    }
}
