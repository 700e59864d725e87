// src/system/executor.rs

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::process::{Command as StdCommand, Output, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Command could not be parsed: {0}")]
    CommandParse(String),
    #[error("No command specified to run.")]
    EmptyCommand,
    #[error("Command '{0}' could not be executed: {1}")]
    CommandFailed(String, std::io::Error),
    #[error("Command '{command}' exited with a non-zero error code.{stderr}")]
    NonZeroExitStatus { command: String, stderr: String },
    #[error("Command '{command}' produced output that was not valid UTF-8")]
    InvalidUtf8Output {
        command: String,
        #[source]
        source: std::string::FromUtf8Error,
    },
}

/// Splits a manifest command line into program and arguments.
pub fn split_command_line(line: &str) -> Result<Vec<String>, ExecutionError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ExecutionError::EmptyCommand);
    }
    let parts =
        shlex::split(trimmed).ok_or_else(|| ExecutionError::CommandParse(trimmed.to_string()))?;
    if parts.is_empty() {
        return Err(ExecutionError::EmptyCommand);
    }
    Ok(parts)
}

/// Expands `~` and known `$VAR`s in a manifest command line, then splits it.
/// Unknown variables are left for the child shell.
pub fn expand_command_line(line: &str) -> Result<Vec<String>, ExecutionError> {
    let with_env = shellexpand::env_with_context_no_errors(line, |var| std::env::var(var).ok());
    let expanded = shellexpand::tilde(&with_env);
    split_command_line(&expanded)
}

/// Runs `program args...` and captures its standard output.
/// Stderr is captured as well and attached to a non-zero exit error.
pub fn execute_and_capture_output(
    command: &[String],
    cwd: Option<&Path>,
    env_vars: &HashMap<String, String>,
) -> Result<String, ExecutionError> {
    let (program, args) = command.split_first().ok_or(ExecutionError::EmptyCommand)?;
    let display = shlex::try_join(command.iter().map(String::as_str))
        .unwrap_or_else(|_| command.join(" "));
    log::debug!("Executing: {}", display);

    let build = |program: &str, args: &[String]| {
        let mut cmd = StdCommand::new(program);
        cmd.args(args)
            .envs(env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dunce::simplified(dir));
        }
        cmd
    };

    // Windows built-ins (`echo`, `type`) are only reachable through `cmd /C`.
    let output: Output = match build(program, args).output() {
        Ok(output) => output,
        Err(e) if e.kind() == ErrorKind::NotFound && cfg!(target_os = "windows") => {
            log::debug!("Command '{}' not found. Retrying with cmd /C.", program);
            build("cmd", &[String::from("/C"), display.clone()])
                .output()
                .map_err(|e| ExecutionError::CommandFailed(display.clone(), e))?
        }
        Err(e) => return Err(ExecutionError::CommandFailed(display, e)),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(ExecutionError::NonZeroExitStatus {
            command: display,
            stderr: if stderr.is_empty() {
                stderr
            } else {
                format!("\n{stderr}")
            },
        });
    }
    if !output.stderr.is_empty() {
        log::debug!("stderr: {}", String::from_utf8_lossy(&output.stderr).trim());
    }

    String::from_utf8(output.stdout).map_err(|e| ExecutionError::InvalidUtf8Output {
        command: display,
        source: e,
    })
}
