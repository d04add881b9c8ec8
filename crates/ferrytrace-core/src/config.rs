//! Configuration module for ferrytrace.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{PromotionOrder, RequeuePolicy, RetryOrder};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for ferrytrace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub submission: SubmissionConfig,
    pub metrics: MetricsConfig,
    pub endpoints: EndpointsConfig,
    pub logging: LoggingConfig,
}

/// Offline record database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Directory holding record manifests, payloads and attachments.
    pub path: PathBuf,
    /// Maximum number of stored records (0 = unlimited).
    pub max_record_count: u32,
    /// Maximum total size of the database in megabytes (0 = unlimited).
    pub max_database_size_mb: u64,
    /// Number of retry buckets; a record failing this many times is dropped.
    pub retry_limit: u32,
    /// Order in which records are retried: `queue` or `stack`.
    pub retry_order: RetryOrder,
    /// Which record a head-of-line promotion charges: `insertion` or `retrieval`.
    pub promotion_order: PromotionOrder,
    /// Seconds between automatic drains of the database (0 disables).
    pub retry_interval_secs: u64,
    /// Submit a report as soon as it is stored.
    pub auto_send: bool,
}

/// Backoff settings for failed submissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Delay before the first retry, in milliseconds (0 disables retries).
    pub base_delay_ms: u64,
    /// Multiplier applied per additional failure.
    pub backoff_factor: u32,
    /// Upper bound for the computed delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Random spread added on top of the delay, as a fraction of it.
    pub jitter_fraction: f64,
    /// Total attempts (first try included) before a batch is abandoned.
    pub max_attempts: u32,
}

/// Telemetry event batching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Maximum events held per batcher (0 = unlimited); reaching it flushes.
    pub max_events: u32,
    /// Seconds between automatic event flushes (0 disables).
    pub flush_interval_secs: u64,
    /// Fate of unique events in an abandoned batch: `drop` or `requeue_front`.
    pub unique_requeue: RequeuePolicy,
    /// Fate of summed events in an abandoned batch: `drop` or `requeue_front`.
    pub summed_requeue: RequeuePolicy,
    /// Application name reported with every event batch.
    pub application: String,
    /// Application version reported with every event batch.
    pub application_version: String,
}

/// Collector endpoints used by the default HTTP transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// URL receiving report payloads. `None` until configured.
    pub reports_url: Option<String>,
    /// Base URL for event submission; `unique-events` / `summed-events` are appended.
    pub events_url: Option<String>,
    /// Submission token sent as the `token` query parameter.
    pub token: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/ferrytrace/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("ferrytrace")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl DatabaseConfig {
    /// Default location of the record database.
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("ferrytrace")
            .join("database")
    }

    /// Size budget in bytes (0 = unlimited).
    pub fn max_database_size_bytes(&self) -> u64 {
        self.max_database_size_mb.saturating_mul(1000 * 1000)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: Self::default_dir(),
            max_record_count: 0,
            max_database_size_mb: 0,
            retry_limit: 3,
            retry_order: RetryOrder::Queue,
            promotion_order: PromotionOrder::Insertion,
            retry_interval_secs: 5,
            auto_send: true,
        }
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 10_000,
            backoff_factor: 10,
            max_delay_ms: 300_000,
            jitter_fraction: 1.0,
            max_attempts: 3,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_events: 350,
            flush_interval_secs: 30 * 60,
            unique_requeue: RequeuePolicy::Drop,
            summed_requeue: RequeuePolicy::Drop,
            application: String::new(),
            application_version: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"database.retry_limit"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- database ---
        if self.database.retry_limit == 0 {
            errors.push(ValidationError {
                field: "database.retry_limit".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.database.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "database.path".into(),
                message: "must not be empty".into(),
            });
        }

        // --- submission ---
        if self.submission.max_attempts == 0 {
            errors.push(ValidationError {
                field: "submission.max_attempts".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.submission.backoff_factor == 0 {
            errors.push(ValidationError {
                field: "submission.backoff_factor".into(),
                message: "must be greater than 0".into(),
            });
        }
        if !(self.submission.jitter_fraction.is_finite() && self.submission.jitter_fraction >= 0.0)
        {
            errors.push(ValidationError {
                field: "submission.jitter_fraction".into(),
                message: "must be a finite, non-negative number".into(),
            });
        }
        if self.submission.max_delay_ms < self.submission.base_delay_ms {
            errors.push(ValidationError {
                field: "submission.max_delay_ms".into(),
                message: format!(
                    "max_delay_ms ({}) must not be below base_delay_ms ({})",
                    self.submission.max_delay_ms, self.submission.base_delay_ms
                ),
            });
        }

        // --- endpoints ---
        for (field, url) in [
            ("endpoints.reports_url", &self.endpoints.reports_url),
            ("endpoints.events_url", &self.endpoints.events_url),
        ] {
            if let Some(url) = url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    errors.push(ValidationError {
                        field: field.into(),
                        message: format!("must be an http(s) URL, got '{url}'"),
                    });
                }
            }
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use ferrytrace_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .database_path(PathBuf::from("/var/lib/app/reports"))
///     .database_max_record_count(100)
///     .submission_max_attempts(5)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- database ---

    pub fn database_path(mut self, path: PathBuf) -> Self {
        self.config.database.path = path;
        self
    }

    pub fn database_max_record_count(mut self, n: u32) -> Self {
        self.config.database.max_record_count = n;
        self
    }

    pub fn database_max_size_mb(mut self, mb: u64) -> Self {
        self.config.database.max_database_size_mb = mb;
        self
    }

    pub fn database_retry_limit(mut self, n: u32) -> Self {
        self.config.database.retry_limit = n;
        self
    }

    pub fn database_retry_order(mut self, order: RetryOrder) -> Self {
        self.config.database.retry_order = order;
        self
    }

    pub fn database_promotion_order(mut self, order: PromotionOrder) -> Self {
        self.config.database.promotion_order = order;
        self
    }

    pub fn database_retry_interval_secs(mut self, seconds: u64) -> Self {
        self.config.database.retry_interval_secs = seconds;
        self
    }

    pub fn database_auto_send(mut self, auto_send: bool) -> Self {
        self.config.database.auto_send = auto_send;
        self
    }

    // --- submission ---

    pub fn submission_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.submission.base_delay_ms = ms;
        self
    }

    pub fn submission_backoff_factor(mut self, factor: u32) -> Self {
        self.config.submission.backoff_factor = factor;
        self
    }

    pub fn submission_max_delay_ms(mut self, ms: u64) -> Self {
        self.config.submission.max_delay_ms = ms;
        self
    }

    pub fn submission_jitter_fraction(mut self, fraction: f64) -> Self {
        self.config.submission.jitter_fraction = fraction;
        self
    }

    pub fn submission_max_attempts(mut self, n: u32) -> Self {
        self.config.submission.max_attempts = n;
        self
    }

    // --- metrics ---

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.config.metrics.enabled = enabled;
        self
    }

    pub fn metrics_max_events(mut self, n: u32) -> Self {
        self.config.metrics.max_events = n;
        self
    }

    pub fn metrics_flush_interval_secs(mut self, seconds: u64) -> Self {
        self.config.metrics.flush_interval_secs = seconds;
        self
    }

    pub fn metrics_unique_requeue(mut self, policy: RequeuePolicy) -> Self {
        self.config.metrics.unique_requeue = policy;
        self
    }

    pub fn metrics_summed_requeue(mut self, policy: RequeuePolicy) -> Self {
        self.config.metrics.summed_requeue = policy;
        self
    }

    pub fn metrics_application(
        mut self,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        self.config.metrics.application = name.into();
        self.config.metrics.application_version = version.into();
        self
    }

    // --- endpoints ---

    pub fn endpoints_reports_url(mut self, url: impl Into<String>) -> Self {
        self.config.endpoints.reports_url = Some(url.into());
        self
    }

    pub fn endpoints_events_url(mut self, url: impl Into<String>) -> Self {
        self.config.endpoints.events_url = Some(url.into());
        self
    }

    pub fn endpoints_token(mut self, token: impl Into<String>) -> Self {
        self.config.endpoints.token = Some(token.into());
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
