use super::probe::{python_interpreter, python_package_version};
use super::{BuildError, BuildRequest, EngineError, SimulationEngine};
use crate::spec::{Defaults, StageSpec};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_ENGINE_COMMAND: &str = "fastmds-openmm-worker";
pub const ENGINE_CMD_ENV: &str = "FASTMDS_ENGINE_CMD";

const CLOSE_GRACE: Duration = Duration::from_secs(10);

/// Simulation engine backed by an external worker process speaking JSON
/// lines on stdin/stdout. Each build spawns a fresh worker; the worker
/// holds the live simulation until its session is dropped.
#[derive(Debug, Clone)]
pub struct BridgeEngine {
    command: Vec<String>,
}

impl BridgeEngine {
    pub fn new(command: Vec<String>) -> Self {
        BridgeEngine { command }
    }

    /// Uses `FASTMDS_ENGINE_CMD` (split on whitespace) when set.
    pub fn from_env() -> Self {
        let command = std::env::var(ENGINE_CMD_ENV)
            .ok()
            .map(|raw| raw.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|parts| !parts.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_ENGINE_COMMAND.to_string()]);
        BridgeEngine::new(command)
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    fn spawn(&self) -> Result<BridgeSession, EngineError> {
        let program = self
            .command
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_ENGINE_COMMAND.to_string());
        let mut cmd = Command::new(&program);
        if self.command.len() > 1 {
            cmd.args(&self.command[1..]);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
            program: program.clone(),
            source,
        })?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Protocol("worker stdout was not captured".to_string()))?;
        debug!(program = %program, pid = child.id(), "engine worker started");
        Ok(BridgeSession {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            program,
        })
    }
}

impl Default for BridgeEngine {
    fn default() -> Self {
        BridgeEngine::from_env()
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    error: Option<ReplyError>,
}

#[derive(Debug, Default, Deserialize)]
struct ReplyError {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    message: String,
}

/// A running engine worker holding one built simulation.
pub struct BridgeSession {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    program: String,
}

impl BridgeSession {
    fn request(&mut self, op: &str, payload: Value) -> Result<(), ReplyError> {
        match self.exchange(&payload) {
            Ok(reply) if reply.ok => Ok(()),
            Ok(reply) => Err(reply.error.unwrap_or(ReplyError {
                kind: "error".to_string(),
                key: None,
                message: format!("worker refused '{}' without detail", op),
            })),
            Err(err) => Err(ReplyError {
                kind: "transport".to_string(),
                key: None,
                message: err.to_string(),
            }),
        }
    }

    fn exchange(&mut self, payload: &Value) -> Result<Reply, EngineError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EngineError::Protocol("worker stdin already closed".to_string()))?;
        let line = serde_json::to_string(payload)
            .map_err(|e| EngineError::Protocol(format!("cannot encode request: {}", e)))?;
        writeln!(stdin, "{}", line)?;
        stdin.flush()?;

        let mut buf = String::new();
        loop {
            buf.clear();
            if self.stdout.read_line(&mut buf)? == 0 {
                let status = self
                    .child
                    .try_wait()
                    .ok()
                    .flatten()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "still running".to_string());
                return Err(EngineError::Protocol(format!(
                    "worker '{}' closed stdout before replying ({})",
                    self.program, status
                )));
            }
            let trimmed = buf.trim();
            if !trimmed.starts_with('{') {
                if !trimmed.is_empty() {
                    debug!(target: "fastmds::worker", "{}", trimmed);
                }
                continue;
            }
            return serde_json::from_str(trimmed)
                .map_err(|e| EngineError::Protocol(format!("malformed reply '{}': {}", trimmed, e)));
        }
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = writeln!(stdin, "{}", json!({"op": "close"}));
            let _ = stdin.flush();
        }
        let deadline = Instant::now() + CLOSE_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(100)),
                _ => break,
            }
        }
        warn!(program = %self.program, "engine worker did not exit after close; killing it");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn rejected(op: &str, err: ReplyError) -> EngineError {
    EngineError::Rejected {
        op: op.to_string(),
        kind: err.kind,
        message: err.message,
    }
}

impl SimulationEngine for BridgeEngine {
    type Handle = BridgeSession;

    fn build(&self, request: &BuildRequest<'_>) -> Result<BridgeSession, BuildError> {
        let mut session = self.spawn()?;
        let payload = json!({
            "op": "build",
            "format": request.system.format().as_str(),
            "system": request.system,
            "defaults": request.defaults,
            "run_dir": request.run_dir,
            "suppressed_options": request.suppressed_options,
        });
        match session.request("build", payload) {
            Ok(()) => Ok(session),
            Err(ReplyError {
                kind,
                key: Some(key),
                ..
            }) if kind == "unsupported_option" => Err(BuildError::UnsupportedOption { key }),
            Err(err) => Err(BuildError::Fatal(rejected("build", err))),
        }
    }

    fn run_stage(
        &self,
        sim: &mut BridgeSession,
        stage: &StageSpec,
        stage_dir: &Path,
        defaults: &Defaults,
    ) -> Result<(), EngineError> {
        let payload = json!({
            "op": "stage",
            "stage": stage,
            "stage_dir": stage_dir,
            "defaults": defaults,
        });
        sim.request("stage", payload).map_err(|err| rejected("stage", err))
    }

    fn versions(&self) -> BTreeMap<String, String> {
        let python = python_interpreter();
        ["openmm", "openmmforcefields"]
            .into_iter()
            .map(|pkg| (pkg.to_string(), python_package_version(&python, pkg)))
            .collect()
    }
}
