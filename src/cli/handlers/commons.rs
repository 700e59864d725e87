// src/cli/handlers/commons.rs

//! Setup shared by the run and job handlers: locating the code base, the run
//! log and the toolkit/user-code manifests.

use crate::cli::Cli;
use crate::cli::args::split_log_target;
use crate::constants::{REPORT_PROJECT_NAME, TOOLKIT_MANIFEST_FILENAME, USER_CODE_MANIFEST_FILENAME};
use crate::core::run_log::RunLog;
use crate::core::toolkit::{RecordingToolkit, Toolkit};
use crate::core::user_code::{NoUserCode, UserCode};
use crate::system::tool_manifest::ManifestToolkit;
use crate::system::user_scripts::{ScriptUserCode, UserCodeManifest};
use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};

/// The folder above the one holding the executable.
pub fn install_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Cannot locate the running executable")?;
    let exe = dunce::canonicalize(&exe).unwrap_or(exe);
    let bin_dir = exe
        .parent()
        .ok_or_else(|| anyhow!("Executable path '{}' has no parent", exe.display()))?;
    Ok(bin_dir.parent().unwrap_or(bin_dir).to_path_buf())
}

/// Expands `~` and `$VAR` in a user-supplied path.
pub fn expand_path(raw: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw.trim())
        .with_context(|| format!("Cannot expand path '{raw}'"))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// `-b` when given, otherwise the install folder.
pub fn code_base(cli: &Cli) -> Result<PathBuf> {
    match &cli.code_base {
        Some(dir) => expand_path(&dir.to_string_lossy()),
        None => install_dir(),
    }
}

/// A run log named after the configuration, writing to `-l` or `<install>/logs`.
pub fn start_log(cli: &Cli) -> Result<RunLog> {
    let mut log = RunLog::new(REPORT_PROJECT_NAME);
    if let Some(config) = &cli.config {
        let stem = Path::new(config.trim())
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        log.set_name_prefix(&stem);
    }

    let mut folder = install_dir()?.join("logs");
    if let Some(target) = &cli.log {
        let (dir, file) = split_log_target(target);
        if let Some(dir) = dir {
            folder = expand_path(&dir)?;
        }
        if let Some(file) = file {
            log.set_file_name(&file);
        }
    }
    log.set_folder(folder);
    log::debug!("Run id {}", log.run_id());
    Ok(log)
}

/// Closes the log and writes its report; failures are reported, not raised.
pub fn finish_log(mut log: RunLog) {
    log.general("Done...");
    log.end();
    match log.write_report() {
        Ok(Some(path)) => log::info!("Log written to {}", path.display()),
        Ok(None) => {}
        Err(e) => log::error!("Could not write the log report: {e}"),
    }
}

/// Looks for a manifest next to the code base, then in the user config folder.
fn find_manifest(explicit: Option<&PathBuf>, root: &Path, file_name: &str) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.clone());
    }
    let candidates = [
        Some(root.join(file_name)),
        dirs::config_dir().map(|dir| dir.join("mdcs").join(file_name)),
    ];
    candidates.into_iter().flatten().find(|p| p.is_file())
}

/// The manifest toolkit, or a recording dry-run toolkit when none is found.
pub fn load_toolkit(cli: &Cli, root: &Path) -> Result<Box<dyn Toolkit>> {
    match find_manifest(cli.toolkit.as_ref(), root, TOOLKIT_MANIFEST_FILENAME) {
        Some(path) => {
            let toolkit = ManifestToolkit::load(&path)
                .with_context(|| format!("Failed to load toolkit manifest '{}'", path.display()))?;
            log::debug!("Toolkit manifest: {}", path.display());
            Ok(Box::new(toolkit))
        }
        None => {
            log::warn!("No {TOOLKIT_MANIFEST_FILENAME} found; tool calls are recorded only.");
            Ok(Box::new(RecordingToolkit::new()))
        }
    }
}

/// The user-code manifest and its base folder, when one is found.
pub fn load_user_manifest(cli: &Cli, root: &Path) -> Result<Option<(UserCodeManifest, PathBuf)>> {
    let Some(path) = find_manifest(cli.user_code.as_ref(), root, USER_CODE_MANIFEST_FILENAME) else {
        return Ok(None);
    };
    let manifest = UserCodeManifest::load(&path)
        .with_context(|| format!("Failed to load user-code manifest '{}'", path.display()))?;
    let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok(Some((manifest, base)))
}

pub fn load_user_code(cli: &Cli, root: &Path) -> Result<Box<dyn UserCode>> {
    Ok(match load_user_manifest(cli, root)? {
        Some((manifest, base)) => Box::new(ScriptUserCode::new(&manifest, base)),
        None => Box::new(NoUserCode),
    })
}
