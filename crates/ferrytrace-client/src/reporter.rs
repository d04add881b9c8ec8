//! Reporter context
//!
//! A [`Reporter`] is the one object a host application keeps for the
//! lifetime of the process. It owns:
//!
//! - the record database and the report stream draining it
//! - the unique and summed event streams (when metrics are enabled)
//! - an outcome forwarder that updates [`QueueMetrics`] and rebroadcasts
//!   every [`SubmissionOutcome`] to subscribers
//!
//! Nothing is global: two reporters over two directories are independent.
//! All workers are spawned on the runtime `start` is called from.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ferrytrace_core::config::Config;
use ferrytrace_core::domain::{Attributes, Record};
use ferrytrace_core::ports::{IClock, ITransport, StreamKind, SystemClock};
use ferrytrace_metrics::EventMetrics;
use ferrytrace_store::{Database, DatabaseSettings};
use ferrytrace_submit::{
    HttpTransport, ReportItem, ReportQueue, RetryPolicy, SchedulerConfig, SchedulerHandle,
    SubmissionOutcome, SubmissionScheduler,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::metrics::QueueMetrics;

/// Outcomes buffered per subscriber before the slowest one starts lagging
const OUTCOME_BUFFER: usize = 256;

pub struct Reporter {
    config: Config,
    db: Arc<Database>,
    reports: SchedulerHandle<ReportItem>,
    events: Option<EventMetrics>,
    metrics: Arc<QueueMetrics>,
    outcomes: broadcast::Sender<SubmissionOutcome>,
    workers: Vec<JoinHandle<()>>,
}

impl Reporter {
    /// Starts a reporter that delivers over HTTP to the configured endpoints.
    ///
    /// Event metrics are switched off when no events URL is configured.
    pub fn from_config(mut config: Config, attributes: Attributes) -> Result<Self> {
        let transport =
            HttpTransport::from_config(&config.endpoints).map_err(ClientError::Transport)?;
        if config.metrics.enabled && config.endpoints.events_url.is_none() {
            warn!("No events URL configured, event metrics disabled");
            config.metrics.enabled = false;
        }
        Self::start(config, Arc::new(transport), attributes)
    }

    pub fn start(
        config: Config,
        transport: Arc<dyn ITransport>,
        attributes: Attributes,
    ) -> Result<Self> {
        Self::start_with_clock(config, transport, Arc::new(SystemClock), attributes)
    }

    /// Opens the database and spawns every worker.
    ///
    /// `attributes` are the default attributes added to every event.
    pub fn start_with_clock(
        config: Config,
        transport: Arc<dyn ITransport>,
        clock: Arc<dyn IClock>,
        attributes: Attributes,
    ) -> Result<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(ClientError::InvalidConfig(errors));
        }

        let metrics = Arc::new(QueueMetrics::new().map_err(ClientError::Metrics)?);
        let db = Arc::new(Database::open(
            DatabaseSettings::from(&config.database),
            Arc::clone(&clock),
        )?);
        metrics.set_pending_records(db.count());

        let policy = RetryPolicy::from(&config.submission);
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let mut scheduler_config = SchedulerConfig::new(policy.clone());
        if config.database.retry_interval_secs > 0 {
            scheduler_config = scheduler_config
                .with_flush_interval(Duration::from_secs(config.database.retry_interval_secs));
        }
        let (scheduler, reports) = SubmissionScheduler::new(
            Arc::new(ReportQueue::new(Arc::clone(&db))),
            Arc::clone(&transport),
            scheduler_config,
        );
        let report_worker = scheduler.with_outcomes(outcome_tx.clone()).spawn();

        let events = if config.metrics.enabled {
            Some(EventMetrics::start(
                &config.metrics,
                attributes,
                clock,
                transport,
                policy,
                Some(outcome_tx),
            ))
        } else {
            drop(outcome_tx);
            None
        };

        let (outcomes, _) = broadcast::channel(OUTCOME_BUFFER);
        let forwarder = tokio::spawn(forward_outcomes(
            outcome_rx,
            Arc::clone(&metrics),
            Arc::clone(&db),
            outcomes.clone(),
        ));

        info!(
            path = %config.database.path.display(),
            records = db.count(),
            auto_send = config.database.auto_send,
            metrics = config.metrics.enabled,
            "Reporter started"
        );

        let reporter = Self {
            config,
            db,
            reports,
            events,
            metrics,
            outcomes,
            workers: vec![report_worker, forwarder],
        };
        if reporter.config.database.auto_send && reporter.db.count() > 0 {
            reporter.reports.send()?;
        }
        Ok(reporter)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// Event streams, `None` when metrics are disabled
    pub fn events(&self) -> Option<&EventMetrics> {
        self.events.as_ref()
    }

    /// Receives every outcome produced after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SubmissionOutcome> {
        self.outcomes.subscribe()
    }

    // ========================================================================
    // Reports
    // ========================================================================

    /// Stores a report durably, then submits it when `auto_send` is set.
    pub fn add_report(&self, payload: &[u8], attachments: &[PathBuf]) -> Result<Record> {
        let record = self.db.add(payload, attachments)?;
        self.metrics.set_pending_records(self.db.count());
        debug!(record_id = %record.id(), size = record.size(), "Report stored");

        if self.config.database.auto_send {
            self.reports.send()?;
        }
        Ok(record)
    }

    /// Drains the record database.
    pub fn send_reports(&self) -> Result<()> {
        Ok(self.reports.send()?)
    }

    /// Drains the record database and waits until the drain ends.
    pub async fn flush_reports(&self) -> Result<()> {
        Ok(self.reports.flush().await?)
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn add_unique(&self, name: impl Into<String>, attributes: Attributes) -> Result<()> {
        Ok(self.require_events()?.add_unique(name, attributes)?)
    }

    pub fn add_summed(&self, metric_group: impl Into<String>, attributes: Attributes) -> Result<()> {
        Ok(self.require_events()?.add_summed(metric_group, attributes)?)
    }

    pub fn send_startup_events(&self) -> Result<()> {
        Ok(self.require_events()?.send_startup_events()?)
    }

    /// Flushes the reports and, when enabled, both event streams.
    pub fn send(&self) -> Result<()> {
        self.reports.send()?;
        if let Some(events) = &self.events {
            events.send()?;
        }
        Ok(())
    }

    fn require_events(&self) -> Result<&EventMetrics> {
        self.events.as_ref().ok_or(ClientError::MetricsDisabled)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stops every stream and waits for the workers.
    ///
    /// Records waiting for a retry stay in the database for the next run;
    /// queued events are dropped.
    pub async fn shutdown(self) {
        self.reports.stop();
        if let Some(events) = self.events {
            events.shutdown().await;
        }
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Reporter worker ended abnormally");
            }
        }
        info!(records = self.db.count(), "Reporter stopped");
    }
}

/// Runs until every scheduler has dropped its outcome sender.
async fn forward_outcomes(
    mut rx: mpsc::UnboundedReceiver<SubmissionOutcome>,
    metrics: Arc<QueueMetrics>,
    db: Arc<Database>,
    outcomes: broadcast::Sender<SubmissionOutcome>,
) {
    while let Some(outcome) = rx.recv().await {
        metrics.record_outcome(&outcome);
        if outcome.stream == StreamKind::Reports {
            metrics.set_pending_records(db.count());
        }
        // no subscribers is fine
        let _ = outcomes.send(outcome);
    }
}
