// src/system/subordinate.rs

//! Runs the engine for a job step in a child process of this same binary.
//! The child prints its step results as JSON on its last stdout line.

use crate::core::job::{JobError, SubordinateLauncher};
use crate::models::StepResult;
use crate::system::executor;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
    /// One subordinate run at a time.
    gate: Mutex<()>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            gate: Mutex::new(()),
        }
    }

    /// Launches the running executable.
    pub fn current() -> Result<Self, JobError> {
        let exe = std::env::current_exe()
            .map_err(|e| JobError::Failed(format!("Cannot locate the engine executable: {e}")))?;
        Ok(Self::new(exe))
    }
}

impl SubordinateLauncher for ProcessLauncher {
    fn launch(&self, argv: &[String]) -> Result<Vec<StepResult>, JobError> {
        let _guard = self
            .gate
            .lock()
            .map_err(|_| JobError::Failed("Subordinate gate poisoned".to_string()))?;
        let mut command = vec![self.program.to_string_lossy().into_owned(), "--json".to_string()];
        command.extend(argv.iter().cloned());
        let stdout = executor::execute_and_capture_output(&command, None, &HashMap::new())?;
        parse_results(&stdout)
    }
}

/// Reads the step results from the last non-empty line of a child's stdout.
pub fn parse_results(stdout: &str) -> Result<Vec<StepResult>, JobError> {
    let last = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| JobError::Response("no output".to_string()))?;
    serde_json::from_str(last.trim()).map_err(|e| JobError::Response(format!("{e}: {last}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_results_come_from_the_last_line() {
        let stdout = "progress: CM\n[{\"cmd\":\"CM\",\"value\":true},{\"cmd\":\"AR\",\"value\":false,\"output\":\"/gdb/md\"}]\n\n";
        let results = parse_results(stdout).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], StepResult::new("CM", true, None));
        assert_eq!(results[1].output, Some(json!("/gdb/md")));
    }

    #[test]
    fn test_unreadable_output_is_a_response_error() {
        assert!(matches!(parse_results(""), Err(JobError::Response(_))));
        assert!(matches!(parse_results("Failed!\n"), Err(JobError::Response(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_launch_passes_json_flag_first() {
        let launcher = ProcessLauncher::new("echo");
        let err = launcher.launch(&["-c:CM".to_string()]).unwrap_err();
        assert!(matches!(err, JobError::Response(m) if m.contains("--json -c:CM")));
    }
}
