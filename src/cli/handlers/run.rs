// src/cli/handlers/run.rs

use crate::cli::Cli;
use crate::cli::args::{parse_user_args, redact_arguments, split_mosaic_dataset_path};
use crate::cli::handlers::commons;
use crate::constants::STATUS_FAILED;
use crate::core::document::Document;
use crate::core::engine::{Engine, EngineOptions, UnresolvedPolicy};
use crate::core::variables::DynamicParams;
use crate::models::StepResult;
use anyhow::{Result, anyhow};
use colored::*;
use std::path::Path;

const JOB_USER_ARG: &str = "__job__";

/// Runs one command chain against a configuration file.
///
/// The report is written on every exit path once the engine exists.
pub fn handle(cli: Cli, raw_args: &[String]) -> Result<()> {
    let root = commons::code_base(&cli)?;
    let mut log = commons::start_log(&cli)?;
    log.general(&format!("Input arguments {}", redact_arguments(raw_args)));

    let config = cli.config.as_deref().map(str::trim).unwrap_or_default();
    if config.is_empty() || !Path::new(config).is_file() {
        log.critical(&format!(
            "Input config file is not specified/not found! ({config})"
        ));
        log.status(STATUS_FAILED);
        commons::finish_log(log);
        return Err(anyhow!("Configuration file '{}' was not found.", config));
    }

    let document = match Document::from_file(Path::new(config)) {
        Ok(doc) => doc,
        Err(e) => {
            log.critical(&e.to_string());
            log.status(STATUS_FAILED);
            commons::finish_log(log);
            return Err(e.into());
        }
    };
    let options = engine_options(&cli, &root);
    let toolkit = commons::load_toolkit(&cli, &root)?;
    let user_code = commons::load_user_code(&cli, &root)?;

    let engine = match Engine::new(document, toolkit, user_code, log.clone(), options) {
        Ok(engine) => engine,
        Err(e) => {
            log.critical(&e.to_string());
            log.status(STATUS_FAILED);
            commons::finish_log(log);
            return Err(e.into());
        }
    };
    drop(log);
    let mut engine = scopeguard::guard(engine, |engine| commons::finish_log(engine.into_log()));

    let results = engine.run(&cli.command_chain())?;
    report_results(&cli, &results)
}

/// Translates the flags into engine settings.
pub fn engine_options(cli: &Cli, root: &Path) -> EngineOptions {
    let mut params = DynamicParams::new();
    for raw in &cli.params {
        params.insert_flag(raw);
    }
    let user_args = parse_user_args(&cli.user_args);
    let unresolved = if user_args.contains_key(JOB_USER_ARG) {
        UnresolvedPolicy::CollapseToExit
    } else {
        UnresolvedPolicy::Skip
    };

    let mut options = EngineOptions {
        params,
        sources: cli.joined_sources(),
        user_args,
        root: root.to_path_buf(),
        unresolved,
        ..Default::default()
    };
    if let Some(md_path) = &cli.mosaic_dataset {
        match split_mosaic_dataset_path(md_path) {
            Some((workspace, geodatabase, name)) => {
                options.workspace = Some(workspace);
                options.geodatabase = Some(geodatabase);
                options.mosaic_dataset = Some(name);
            }
            None => log::warn!("Ignoring -m '{md_path}': expected <workspace>/<name>.gdb/<dataset>."),
        }
    }
    options
}

fn report_results(cli: &Cli, results: &[StepResult]) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string(results)?);
        return Ok(());
    }
    for result in results {
        let status = if result.value { "OK".green() } else { "Failed".red() };
        match &result.output {
            Some(output) => println!("{:<12} {status}  {output}", result.cmd),
            None => println!("{:<12} {status}", result.cmd),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::normalize_legacy_flags;
    use clap::Parser;

    fn cli(items: &[&str]) -> Cli {
        let argv = normalize_legacy_flags(items.iter().map(|s| (*s).to_string()));
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_options_carry_overrides_and_params() {
        let cli = cli(&[
            "mdcs",
            "-m:/data/World.gdb/Portland",
            "-p:2020$year",
            "-p:2021$YEAR",
            "-s:/src/a",
            "-s:/src/b",
        ]);
        let options = engine_options(&cli, Path::new("/mdcs"));
        assert_eq!(options.workspace.as_deref(), Some("/data/"));
        assert_eq!(options.geodatabase.as_deref(), Some("World.gdb"));
        assert_eq!(options.mosaic_dataset.as_deref(), Some("Portland"));
        assert_eq!(options.params.get("YEAR"), Some("2020"));
        assert_eq!(options.sources, "/src/a;/src/b");
        assert_eq!(options.unresolved, UnresolvedPolicy::Skip);
    }

    #[test]
    fn test_job_runs_collapse_unresolved_commands() {
        let cli = cli(&["mdcs", "-__job__:job7", "-__step__:build"]);
        let options = engine_options(&cli, Path::new("/mdcs"));
        assert_eq!(options.unresolved, UnresolvedPolicy::CollapseToExit);
        assert_eq!(options.user_args["__step__"], "build");
    }

    #[test]
    fn test_missing_config_still_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let logs = format!("{}/", dir.path().join("logs").display());
        let cli = cli(&["mdcs", "-i:/nowhere/cfg.xml", &format!("-l:{logs}"), "-b:/mdcs"]);
        assert!(handle(cli, &[]).is_err());
        let written: Vec<_> = std::fs::read_dir(dir.path().join("logs")).unwrap().collect();
        assert_eq!(written.len(), 1);
    }

    #[test]
    fn test_chain_runs_against_recording_toolkit() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("elevation.xml");
        std::fs::write(
            &config,
            format!(
                "<Application><Command>CP</Command><Workspace>\
                 <WorkspacePath>{}</WorkspacePath><Geodatabase>imagery</Geodatabase>\
                 <MosaicDataset><Name>md</Name></MosaicDataset></Workspace></Application>",
                dir.path().display()
            ),
        )
        .unwrap();
        let logs = format!("{}/", dir.path().join("logs").display());
        let cli = cli(&[
            "mdcs",
            &format!("-i:{}", config.display()),
            &format!("-l:{logs}"),
            &format!("-b:{}", dir.path().display()),
            "--json",
        ]);
        handle(cli, &[]).unwrap();
        let report = std::fs::read_dir(dir.path().join("logs")).unwrap().next().unwrap().unwrap();
        let xml = std::fs::read_to_string(report.path()).unwrap();
        assert!(xml.contains("Compacting file geodatabase"));
    }
}
