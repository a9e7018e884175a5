//! Command-line interface for Tether
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Tether - container network manager
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "tether.toml")]
    pub config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Validate configuration
    Check,

    /// Create the networks and endpoints declared in the configuration
    Up {
        /// Simulate host links in memory instead of changing the host
        #[arg(long)]
        dry_run: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List available network drivers
    Drivers,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Default log filter for the verbosity count
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    /// Write a completion script for `shell` to stdout
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "tether", &mut std::io::stdout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_up() {
        let cli = Cli::try_parse_from(["tether", "-c", "net.toml", "-vv", "up", "--dry-run"]).unwrap();

        assert_eq!(cli.config, PathBuf::from("net.toml"));
        assert_eq!(cli.log_level(), "debug");
        assert!(matches!(cli.command, Commands::Up { dry_run: true, json: false }));
    }

    #[test]
    fn test_default_config() {
        let cli = Cli::try_parse_from(["tether", "check"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("tether.toml"));
        assert_eq!(cli.log_level(), "warn");
    }
}
