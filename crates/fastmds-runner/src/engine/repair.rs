use super::probe::{python_interpreter, python_package_version};
use super::{RepairError, StructureRepair};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::info;

pub const DEFAULT_PDBFIXER: &str = "pdbfixer";

/// Structure repair through the `pdbfixer` command-line tool: adds missing
/// residues and heavy atoms, strips heterogens, protonates at the given pH.
#[derive(Debug, Clone)]
pub struct PdbFixerCli {
    program: String,
}

impl PdbFixerCli {
    pub fn new(program: impl Into<String>) -> Self {
        PdbFixerCli {
            program: program.into(),
        }
    }

    fn args(input: &Path, output: &Path, ph: f64) -> Vec<String> {
        vec![
            input.display().to_string(),
            format!("--output={}", output.display()),
            "--add-atoms=all".to_string(),
            "--add-residues".to_string(),
            "--keep-heterogens=none".to_string(),
            format!("--ph={}", ph),
        ]
    }
}

impl Default for PdbFixerCli {
    fn default() -> Self {
        PdbFixerCli::new(DEFAULT_PDBFIXER)
    }
}

impl StructureRepair for PdbFixerCli {
    fn repair(&self, input: &Path, output: &Path, ph: f64) -> Result<(), RepairError> {
        if !input.is_file() {
            return Err(RepairError::MissingInput {
                path: input.to_path_buf(),
            });
        }
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        // A leftover from an earlier attempt must not pass the output check.
        if output.exists() {
            fs::remove_file(output)?;
        }
        info!(input = %input.display(), ph, "repairing structure with {}", self.program);
        let result = Command::new(&self.program)
            .args(Self::args(input, output, ph))
            .stdin(Stdio::null())
            .output()
            .map_err(|source| RepairError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !result.status.success() {
            let detail = String::from_utf8_lossy(&result.stderr)
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no diagnostic output")
                .to_string();
            return Err(RepairError::Failed {
                program: self.program.clone(),
                status: result.status.to_string(),
                detail,
            });
        }
        let written = fs::metadata(output).map(|m| m.len() > 0).unwrap_or(false);
        if !written {
            return Err(RepairError::MissingOutput {
                path: output.to_path_buf(),
            });
        }
        Ok(())
    }

    fn versions(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert(
            "pdbfixer".to_string(),
            python_package_version(&python_interpreter(), "pdbfixer"),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_pdbfixer_arguments() {
        let args = PdbFixerCli::args(Path::new("in.pdb"), Path::new("out/fixed.pdb"), 7.5);
        assert_eq!(
            args,
            vec![
                "in.pdb",
                "--output=out/fixed.pdb",
                "--add-atoms=all",
                "--add-residues",
                "--keep-heterogens=none",
                "--ph=7.5",
            ]
        );
    }

    #[test]
    fn missing_input_is_reported_before_spawning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixer = PdbFixerCli::new("/nonexistent/pdbfixer");
        let err = fixer
            .repair(&dir.path().join("absent.pdb"), &dir.path().join("out.pdb"), 7.0)
            .expect_err("missing input");
        assert!(matches!(err, RepairError::MissingInput { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn tool_that_writes_nothing_is_a_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in.pdb");
        fs::write(&input, "ATOM\n").expect("write input");
        let fixer = PdbFixerCli::new("true");
        let err = fixer
            .repair(&input, &dir.path().join("_build/out.pdb"), 7.0)
            .expect_err("no output written");
        assert!(matches!(err, RepairError::MissingOutput { .. }), "{:?}", err);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_a_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in.pdb");
        fs::write(&input, "ATOM\n").expect("write input");
        let fixer = PdbFixerCli::new("false");
        let err = fixer
            .repair(&input, &dir.path().join("out.pdb"), 7.0)
            .expect_err("exit 1");
        assert!(matches!(err, RepairError::Failed { .. }), "{:?}", err);
    }
}
