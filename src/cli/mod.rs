// src/cli/mod.rs

use crate::constants::DEFAULT_COMMAND_SENTINEL;
use clap::Parser;
use std::path::PathBuf;

pub mod args;
pub mod handlers;

/// mdcs: runs mosaic dataset workflows described by an XML configuration.
///
/// Every flag also accepts the legacy `-x:value` spelling, e.g.
/// `mdcs -i:elevation.xml -c:CM+AF+AR`.
#[derive(Parser, Debug, Default)]
#[command(author, version, about, disable_help_subcommand = true)]
pub struct Cli {
    /// Configuration file.
    #[arg(short = 'i', long = "input", value_name = "CONFIG")]
    pub config: Option<String>,

    /// Command chain such as `CM+AF+AR+BF`. Defaults to the configuration's `Command`.
    #[arg(short = 'c', long = "command", default_value = DEFAULT_COMMAND_SENTINEL)]
    pub command: String,

    /// Mosaic dataset path including the geodatabase, e.g. `/data/World.gdb/Portland`.
    #[arg(short = 'm', long = "mosaic-dataset", value_name = "PATH")]
    pub mosaic_dataset: Option<String>,

    /// Source data path for AR. Repeatable.
    #[arg(short = 's', long = "source", value_name = "PATH")]
    pub sources: Vec<String>,

    /// Log output folder or file.
    #[arg(short = 'l', long = "log", value_name = "PATH")]
    pub log: Option<String>,

    /// Folder holding `Parameter/`, `toolkit.toml` and `user_code.toml`.
    #[arg(short = 'b', long = "code-base", value_name = "DIR")]
    pub code_base: Option<PathBuf>,

    /// Dynamic variable as `value$KEY`, referenced in the configuration as `$KEY$`.
    #[arg(short = 'p', long = "param", value_name = "VALUE$KEY")]
    pub params: Vec<String>,

    /// JSON job payload to run instead of a single chain.
    #[arg(short = 'j', long = "job", value_name = "FILE")]
    pub job: Option<PathBuf>,

    /// User-code argument as `__name=value` (legacy `-__name:value`).
    #[arg(long = "user-arg", value_name = "__NAME=VALUE")]
    pub user_args: Vec<String>,

    /// Toolkit manifest; defaults to `<code base>/toolkit.toml`.
    #[arg(long, value_name = "FILE")]
    pub toolkit: Option<PathBuf>,

    /// User-code manifest; defaults to `<code base>/user_code.toml`.
    #[arg(long = "user-code", value_name = "FILE")]
    pub user_code: Option<PathBuf>,

    /// Print step results as JSON on the last line of stdout.
    #[arg(long)]
    pub json: bool,

    /// List the built-in command codes and exit.
    #[arg(long = "list-commands")]
    pub list_commands: bool,
}

impl Cli {
    /// The command chain with spaces removed; blank means the configured default.
    pub fn command_chain(&self) -> String {
        let chain: String = self.command.chars().filter(|c| !c.is_whitespace()).collect();
        if chain.is_empty() {
            DEFAULT_COMMAND_SENTINEL.to_string()
        } else {
            chain
        }
    }

    /// `-s` values joined with `;`.
    pub fn joined_sources(&self) -> String {
        self.sources.join(";")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::normalize_legacy_flags;

    fn parse(items: &[&str]) -> Cli {
        let argv = normalize_legacy_flags(items.iter().map(|s| (*s).to_string()));
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_legacy_and_long_spellings_agree() {
        let legacy = parse(&["mdcs", "-i:cfg.xml", "-c:CM + AF", "-s:/a", "-s:/b"]);
        let modern = parse(&["mdcs", "-i", "cfg.xml", "--command", "CM+AF", "--source", "/a", "-s", "/b"]);
        assert_eq!(legacy.config, modern.config);
        assert_eq!(legacy.command_chain(), "CM+AF");
        assert_eq!(modern.command_chain(), "CM+AF");
        assert_eq!(legacy.joined_sources(), "/a;/b");
    }

    #[test]
    fn test_command_defaults_to_sentinel() {
        let cli = parse(&["mdcs", "-i:cfg.xml"]);
        assert_eq!(cli.command_chain(), DEFAULT_COMMAND_SENTINEL);
        assert!(!cli.json);
    }

    #[test]
    fn test_params_and_user_args_are_collected() {
        let cli = parse(&["mdcs", "-p:2020$YEAR", "-p:x@KEY", "-__item:tile-9", "--json"]);
        assert_eq!(cli.params, vec!["2020$YEAR", "x@KEY"]);
        assert_eq!(cli.user_args, vec!["__item=tile-9"]);
        assert!(cli.json);
    }
}
