//! Config command - show and validate the ferrytrace configuration

use anyhow::{Context, Result};
use clap::Subcommand;
use ferrytrace_core::config::Config;
use tracing::info;

use super::CommandContext;

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
}

impl ConfigCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        match self {
            ConfigCommand::Show => show(ctx),
            ConfigCommand::Validate => validate(ctx),
        }
    }
}

fn show(ctx: &CommandContext) -> Result<()> {
    let formatter = ctx.formatter();
    info!(config_path = %ctx.config_path.display(), "Showing configuration");

    if ctx.format.is_json() {
        let json =
            serde_json::to_value(&ctx.config).context("Failed to serialize configuration to JSON")?;
        formatter.print_json(&json);
        return Ok(());
    }

    formatter.success(&format!("Configuration ({})", ctx.config_path.display()));
    let yaml =
        serde_yaml::to_string(&ctx.config).context("Failed to serialize configuration to YAML")?;
    for line in yaml.lines() {
        formatter.info(line);
    }
    Ok(())
}

fn validate(ctx: &CommandContext) -> Result<()> {
    let formatter = ctx.formatter();
    let path = &ctx.config_path;

    // parse again so a missing file is reported instead of silently defaulted
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) if !path.exists() => {
            if ctx.format.is_json() {
                formatter.print_json(&serde_json::json!({
                    "valid": true,
                    "config_path": path.display().to_string(),
                    "errors": [],
                    "defaults": true,
                }));
            } else {
                formatter.success("No configuration file, using defaults");
                formatter.info(&format!("Expected at {} ({e})", path.display()));
            }
            return Ok(());
        }
        Err(e) => {
            return Err(e.context(format!("Failed to parse configuration at {}", path.display())));
        }
    };

    let errors = config.validate();
    if ctx.format.is_json() {
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        formatter.print_json(&serde_json::json!({
            "valid": errors.is_empty(),
            "config_path": path.display().to_string(),
            "errors": messages,
        }));
    } else if errors.is_empty() {
        formatter.success("Configuration is valid");
        formatter.info(&format!("File: {}", path.display()));
    } else {
        formatter.error(&format!(
            "Configuration has {} error{}:",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" }
        ));
        for error in &errors {
            formatter.info(&format!("  {} - {}", error.field, error.message));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("Invalid configuration")
    }
}
