//! Subcommand implementations

pub mod config;
pub mod database;
pub mod flush;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use ferrytrace_core::config::Config;
use ferrytrace_core::ports::SystemClock;
use ferrytrace_store::{Database, DatabaseSettings};

use crate::output::{get_formatter, OutputFormat, OutputFormatter};

/// What every command needs from the global flags
pub struct CommandContext {
    pub config: Config,
    pub config_path: PathBuf,
    pub format: OutputFormat,
    pub quiet: bool,
}

impl CommandContext {
    /// Loads the configuration named by `--config`, or the default one.
    ///
    /// A missing default file yields the built-in defaults; an explicitly
    /// named file must exist and parse.
    pub fn load(config: Option<&Path>, format: OutputFormat, quiet: bool) -> Result<Self> {
        let (config, config_path) = match config {
            Some(path) => {
                let config = Config::load(path)
                    .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
                (config, path.to_path_buf())
            }
            None => {
                let path = Config::default_path();
                (Config::load_or_default(&path), path)
            }
        };
        Ok(Self {
            config,
            config_path,
            format,
            quiet,
        })
    }

    pub fn formatter(&self) -> Box<dyn OutputFormatter> {
        get_formatter(self.format, self.quiet)
    }

    /// Database directory from `--path`, falling back to the configuration.
    pub fn database_path(&self, path: Option<&Path>) -> PathBuf {
        path.map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.database.path.clone())
    }

    /// Opens the database, running its startup recovery.
    pub fn open_database(&self, path: Option<&Path>) -> Result<Database> {
        let mut settings = DatabaseSettings::from(&self.config.database);
        settings.path = self.database_path(path);
        Database::open(settings.clone(), Arc::new(SystemClock))
            .with_context(|| format!("Failed to open database at {}", settings.path.display()))
    }
}
