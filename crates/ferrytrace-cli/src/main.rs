//! ferrytrace CLI - Maintenance tool for ferrytrace record databases
//!
//! Provides commands for:
//! - Listing, validating, reconciling and clearing a record database
//! - Delivering stored reports once to a collector
//! - Showing and validating the configuration
//!
//! Host applications drive the queue through `ferrytrace-client`; this tool
//! is for operators looking at a database on disk.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ferrytrace_core::config::LoggingConfig;

mod commands;
mod output;

use commands::{
    config::ConfigCommand, database::DatabaseCommand, flush::FlushCommand, CommandContext,
};
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "ferrytrace", version, about = "Inspect and flush ferrytrace report databases")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Inspect and maintain the record database
    #[command(subcommand)]
    Database(DatabaseCommand),
    /// Deliver every stored report once
    Flush(FlushCommand),
    /// View and validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Log level implied by `-v` / `--quiet`
    fn log_level(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "warn",
            (false, 1) => "info",
            (false, 2) => "debug",
            _ => "trace",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    ferrytrace_client::init_tracing(&LoggingConfig {
        level: cli.log_level().to_string(),
        json: false,
    })?;

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };
    let ctx = CommandContext::load(cli.config.as_deref(), format, cli.quiet)?;

    let result = match &cli.command {
        Commands::Database(cmd) => cmd.execute(&ctx).await,
        Commands::Flush(cmd) => cmd.execute(&ctx).await,
        Commands::Config(cmd) => cmd.execute(&ctx).await,
    };
    if let Err(e) = &result {
        ctx.formatter().error(&format!("{e:#}"));
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_database_list() {
        let cli = Cli::try_parse_from(["ferrytrace", "--json", "database", "list", "--path", "/tmp/db"])
            .unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Database(DatabaseCommand::List { path: Some(_) })
        ));
    }

    #[test]
    fn test_parse_flush_with_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "ferrytrace",
            "flush",
            "--url",
            "https://collector.example.com/reports",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_level(), "debug");
        assert!(matches!(cli.command, Commands::Flush(_)));
    }

    #[test]
    fn test_quiet_overrides_verbose() {
        let cli = Cli::try_parse_from(["ferrytrace", "-q", "-v", "config", "show"]).unwrap();
        assert_eq!(cli.log_level(), "error");
    }

    #[test]
    fn test_clear_flag() {
        let cli = Cli::try_parse_from(["ferrytrace", "database", "clear", "--yes"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Database(DatabaseCommand::Clear { yes: true, path: None })
        ));
    }
}
