use anyhow::Result;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use fastmds_runner::analysis::{analyze_project, build_analyze_cmd, AnalysisOptions};
use fastmds_runner::logging::PROJECT_LOG_FILE;
use fastmds_runner::{
    resolve_plan, resolve_quick_plan, write_example_config, LogContext, LogStyle, Orchestrator,
    Plan,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "fastmds",
    version,
    about = "Automated MD simulation: job files for multi-system sweeps, single PDB files for one-shot runs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job file (.yml/.yaml) or a one-shot simulation of a PDB file.
    Simulate {
        #[arg(short = 's', long)]
        system: PathBuf,
        #[arg(short = 'o', long, default_value = "simulate_output")]
        output: PathBuf,
        /// Overrides YAML for one-shot runs; ignored for job files.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        analyze: bool,
        /// Frame selection passed to the analysis tool, e.g. "0,-1,10".
        #[arg(long)]
        frames: Option<String>,
        /// Atom selection passed to the analysis tool, e.g. "protein".
        #[arg(long)]
        atoms: Option<String>,
        #[arg(
            long,
            default_value = "true",
            action = ArgAction::Set,
            value_parser = BoolishValueParser::new()
        )]
        slides: bool,
        /// Print the resolved plan and exit.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Write a starter job file.
    Init {
        #[arg(long, default_value = "job.yml")]
        output: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Simulate {
            system,
            output,
            config,
            analyze,
            frames,
            atoms,
            slides,
            dry_run,
            json,
        } => {
            let job_file = is_job_file(&system);
            let logs = install_logging(&system, job_file, config.as_deref());
            let config = if job_file && config.is_some() {
                warn!("--config is ignored for job files");
                None
            } else {
                config
            };
            let opts = AnalysisOptions {
                slides,
                frames,
                atoms,
            };

            if dry_run {
                let plan = if job_file {
                    resolve_plan(&system, &output)?
                } else {
                    resolve_quick_plan(&system, &output, config.as_deref())?
                };
                let analysis = analyze.then_some(&opts);
                if json {
                    return Ok(Some(plan_to_json(&plan, analysis)?));
                }
                print_plan(&plan, job_file, analysis);
                return Ok(None);
            }

            let mut orch = Orchestrator::with_default_capabilities();
            if let Some(logs) = logs {
                orch = orch.with_logging(logs);
            }
            let project_dir = if job_file {
                orch.run_from_spec(&system, &output)?
            } else {
                orch.simulate_from_pdb(&system, &output, config.as_deref())?
            };

            let analyzed = if analyze {
                let sink = orch
                    .logs()
                    .and_then(|logs| logs.attach_file(&project_dir.join(PROJECT_LOG_FILE)).ok());
                let ok = analyze_project(&project_dir, &opts);
                if let (Some(logs), Some(handle)) = (orch.logs(), sink) {
                    logs.detach(handle);
                }
                if !ok && !json {
                    println!("Analysis skipped or failed; install FastMDAnalysis or adjust flags.");
                }
                Some(ok)
            } else {
                None
            };

            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "simulate",
                    "project_dir": project_dir.display().to_string(),
                    "analysis": analyzed,
                })));
            }
            println!("project: {}", project_dir.display());
        }
        Commands::Init { output, force } => {
            write_example_config(&output, force)?;
            println!("wrote: {}", output.display());
            println!("next: edit {} and set your systems", output.display());
            println!("next: fastmds simulate -s {} --dry-run", output.display());
        }
    }
    Ok(None)
}

fn is_job_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("yml") || e.eq_ignore_ascii_case("yaml"))
        .unwrap_or(false)
}

/// `defaults.log_style` of a YAML file, if readable.
fn yaml_log_style(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&raw).ok()?;
    doc.get("defaults")?
        .get("log_style")?
        .as_str()
        .map(str::to_string)
}

/// Style from the job file, else the overrides file, else the environment.
fn install_logging(system: &Path, job_file: bool, config: Option<&Path>) -> Option<LogContext> {
    let from_yaml = if job_file {
        yaml_log_style(system)
    } else {
        config.and_then(yaml_log_style)
    };
    let style = LogStyle::resolve([from_yaml.as_deref()]);
    match LogContext::install(style) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("warning: logging unavailable: {}", e);
            None
        }
    }
}

fn plan_to_json(plan: &Plan, analysis: Option<&AnalysisOptions>) -> Result<Value> {
    let mut value = serde_json::to_value(plan)?;
    if let (Some(opts), Some(runs)) = (analysis, value.get_mut("runs").and_then(Value::as_array_mut)) {
        for (entry, run) in runs.iter_mut().zip(&plan.runs) {
            let prod = run.run_dir.join("production");
            entry["analysis_cmd"] = json!(build_analyze_cmd(
                &prod.join("traj.dcd"),
                &prod.join("topology.pdb"),
                opts
            ));
        }
    }
    Ok(value)
}

fn print_plan(plan: &Plan, job_file: bool, analysis: Option<&AnalysisOptions>) {
    if job_file {
        println!("=== DRY RUN (JOB FILE) ===");
    } else {
        println!("=== DRY RUN (ONE-SHOT) ===");
    }
    println!("Project: {}", plan.project);
    println!("Output:  {}", plan.output_dir.display());
    match analysis {
        Some(opts) => println!(
            "Analysis: Yes (slides={}, frames={}, atoms={})",
            opts.slides,
            opts.frames.as_deref().unwrap_or("all"),
            opts.atoms.as_deref().unwrap_or("all"),
        ),
        None => println!("Analysis: No"),
    }
    for run in &plan.runs {
        println!(
            "- Run: {} @ {} K -> {}",
            run.system_id,
            run.temperature,
            run.run_dir.display()
        );
        for stage in &run.stages {
            println!(
                "    {}: {} steps (~{} ps)",
                stage.name, stage.steps, stage.approx_ps
            );
        }
        if let Some(opts) = analysis {
            let prod = run.run_dir.join("production");
            let cmd = build_analyze_cmd(&prod.join("traj.dcd"), &prod.join("topology.pdb"), opts);
            println!("    fastmda command: {}", cmd.join(" "));
        }
    }
    println!("Total: ~{} ps over {} run(s)", plan.total_ps(), plan.runs.len());
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Simulate { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}
