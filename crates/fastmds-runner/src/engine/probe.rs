use std::process::{Command, Stdio};

pub const NOT_AVAILABLE: &str = "n/a";
pub const PYTHON_ENV: &str = "FASTMDS_PYTHON";

pub fn python_interpreter() -> String {
    std::env::var(PYTHON_ENV)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "python3".to_string())
}

/// Installed version of a Python distribution, or `n/a` if it cannot be
/// determined for any reason.
pub fn python_package_version(python: &str, package: &str) -> String {
    let script = format!(
        "import importlib.metadata as m; print(m.version({:?}))",
        package
    );
    let output = Command::new(python)
        .args(["-c", &script])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();
    match output {
        Ok(out) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if version.is_empty() {
                NOT_AVAILABLE.to_string()
            } else {
                version
            }
        }
        _ => NOT_AVAILABLE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_interpreter_reports_not_available() {
        assert_eq!(
            python_package_version("/nonexistent/python-for-fastmds", "openmm"),
            NOT_AVAILABLE
        );
    }
}
