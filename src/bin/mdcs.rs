// src/bin/mdcs.rs

use anyhow::Result;
use clap::{CommandFactory, Parser};
use colored::*;
use mdcs::cli::{Cli, args::normalize_legacy_flags, handlers};

// --- Mode Definition and Registry ---

/// A CLI mode, chosen by the first entry whose predicate matches the flags.
struct ModeDefinition {
    name: &'static str,
    applies: fn(&Cli) -> bool,
    handler: fn(Cli, &[String]) -> Result<()>,
}

static MODE_REGISTRY: &[ModeDefinition] = &[
    ModeDefinition {
        name: "list-commands",
        applies: |cli| cli.list_commands,
        handler: handlers::list::handle,
    },
    ModeDefinition {
        name: "job",
        applies: |cli| cli.job.is_some(),
        handler: handlers::job::handle,
    },
    ModeDefinition {
        name: "run",
        applies: |_| true,
        handler: handlers::run::handle,
    },
];

fn find_mode(cli: &Cli) -> Option<&'static ModeDefinition> {
    MODE_REGISTRY.iter().find(|mode| (mode.applies)(cli))
}

fn main() {
    env_logger::init();

    let raw_args: Vec<String> = std::env::args().collect();
    if raw_args.len() < 2 {
        let mut command = Cli::command();
        let _ = command.print_help();
        print!("\n{}", handlers::list::command_listing());
        std::process::exit(1);
    }

    let cli = Cli::parse_from(normalize_legacy_flags(raw_args.iter().cloned()));
    if let Err(e) = run_cli(cli, raw_args.get(1..).unwrap_or_default()) {
        eprintln!("\n{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli, raw_args: &[String]) -> Result<()> {
    log::debug!("CLI args parsed: {:?}", cli);
    match find_mode(&cli) {
        Some(mode) => {
            log::debug!("Mode: {}", mode.name);
            (mode.handler)(cli, raw_args)
        }
        None => Ok(()),
    }
}
