// src/cli/handlers/job.rs

use crate::cli::Cli;
use crate::cli::args::redact_arguments;
use crate::cli::handlers::commons;
use crate::core::job::{JobReport, JobRunner, StepNamespace};
use crate::core::run_log::RunLog;
use crate::system::subordinate::ProcessLauncher;
use crate::system::user_scripts::{ScriptNamespace, UserCodeManifest};
use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Runs a JSON job payload. Engine steps run in a subordinate process of this
/// binary; other steps call into the user-code manifest's namespaces.
pub fn handle(cli: Cli, raw_args: &[String]) -> Result<()> {
    let job_file = cli
        .job
        .as_deref()
        .ok_or_else(|| anyhow!("No job file given."))?;
    let root = commons::code_base(&cli)?;
    let mut log = commons::start_log(&cli)?;
    log.general(&format!("Input arguments {}", redact_arguments(raw_args)));
    let mut log = scopeguard::guard(log, commons::finish_log);

    let payload = read_payload(job_file)?;
    let namespace: Box<dyn StepNamespace> = match commons::load_user_manifest(&cli, &root)? {
        Some((manifest, base)) => Box::new(ScriptNamespace::new(&manifest, base)),
        None => Box::new(ScriptNamespace::new(&UserCodeManifest::default(), &root)),
    };
    let launcher = ProcessLauncher::current()?;
    let mut runner = JobRunner::new(&root, Box::new(launcher), namespace).with_code_base(&root);

    let report = runner.run(&payload);
    record(&mut log, &report);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.status {
        Ok(())
    } else {
        Err(anyhow!("Job did not complete successfully."))
    }
}

fn read_payload(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file '{}'", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Job file '{}' is not valid JSON", path.display()))
}

/// Copies the job's messages into the run log.
fn record(log: &mut RunLog, report: &JobReport) {
    log.create_category("job");
    for message in &report.logs {
        if message.starts_with("Err.") {
            log.critical(message);
        } else {
            log.general(message);
        }
    }
    log.close_category();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_must_be_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        fs::write(&path, "{not json").unwrap();
        assert!(read_payload(&path).is_err());
        fs::write(&path, r#"{"job": {"id": "j1"}}"#).unwrap();
        assert_eq!(read_payload(&path).unwrap()["job"]["id"], "j1");
    }

    #[test]
    fn test_empty_job_fails_and_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        fs::write(&path, "null").unwrap();
        let cli = Cli {
            job: Some(path),
            code_base: Some(dir.path().to_path_buf()),
            log: Some(format!("{}/", dir.path().join("logs").display())),
            ..Default::default()
        };
        assert!(handle(cli, &[]).is_err());
        assert_eq!(fs::read_dir(dir.path().join("logs")).unwrap().count(), 1);
    }
}
