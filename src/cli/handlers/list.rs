// src/cli/handlers/list.rs

use crate::cli::Cli;
use crate::core::registry::BUILTIN_COMMANDS;
use anyhow::Result;
use colored::*;

/// Prints the built-in command codes with their descriptions.
pub fn handle(_cli: Cli, _raw_args: &[String]) -> Result<()> {
    print!("{}", command_listing());
    Ok(())
}

pub fn command_listing() -> String {
    let mut out = format!(
        "{}\n",
        "Commands can be combined with '+' (e.g. CM+AF+AR+BF). Available commands:".bold()
    );
    for def in BUILTIN_COMMANDS {
        out.push_str(&format!("\t{} = {}\n", def.code.cyan(), def.desc));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_names_every_builtin() {
        colored::control::set_override(false);
        let listing = command_listing();
        assert!(listing.contains("\tCM = "));
        assert!(listing.contains("\tTF = Transfer files."));
        assert_eq!(listing.lines().count(), BUILTIN_COMMANDS.len() + 1);
    }
}
