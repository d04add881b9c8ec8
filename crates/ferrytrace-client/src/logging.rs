//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured level.

use ferrytrace_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber described by `config`.
///
/// Returns an error if a global subscriber is already set.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = env_filter(&config.level);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    if config.json {
        builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
    } else {
        builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_is_used_without_env() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let filter = env_filter("warn");
        assert_eq!(filter.to_string(), "warn");
    }
}
