//! Unique and summed event streams together

use std::sync::Arc;

use ferrytrace_core::config::MetricsConfig;
use ferrytrace_core::domain::{is_empty_value, Attributes};
use ferrytrace_core::ports::{IClock, ITransport};
use ferrytrace_submit::{RetryPolicy, SubmissionOutcome};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::batcher::{SummedEventBatcher, UniqueEventBatcher};
use crate::error::Result;
use crate::queue::BatcherSettings;

/// Summed event recorded once per process start
pub const APPLICATION_LAUNCHES: &str = "Application Launches";

/// Attribute whose value identifies a unique user or installation
pub const DEFAULT_UNIQUE_EVENT: &str = "guid";

/// Both event batchers and their workers
pub struct EventMetrics {
    unique: UniqueEventBatcher,
    summed: SummedEventBatcher,
    attributes: Attributes,
    workers: Vec<JoinHandle<()>>,
}

impl EventMetrics {
    /// Starts both event streams on the current runtime.
    ///
    /// `attributes` are added to every event that does not set them itself.
    pub fn start(
        config: &MetricsConfig,
        attributes: Attributes,
        clock: Arc<dyn IClock>,
        transport: Arc<dyn ITransport>,
        policy: RetryPolicy,
        outcomes: Option<mpsc::UnboundedSender<SubmissionOutcome>>,
    ) -> Self {
        let (unique, unique_worker) = UniqueEventBatcher::start(
            BatcherSettings::unique(config).with_attributes(attributes.clone()),
            Arc::clone(&clock),
            Arc::clone(&transport),
            policy.clone(),
            outcomes.clone(),
        );
        let (summed, summed_worker) = SummedEventBatcher::start(
            BatcherSettings::summed(config).with_attributes(attributes.clone()),
            clock,
            transport,
            policy,
            outcomes,
        );
        info!(
            max_events = config.max_events,
            flush_interval_secs = config.flush_interval_secs,
            "Event metrics started"
        );
        Self {
            unique,
            summed,
            attributes,
            workers: vec![unique_worker, summed_worker],
        }
    }

    pub fn unique(&self) -> &UniqueEventBatcher {
        &self.unique
    }

    pub fn summed(&self) -> &SummedEventBatcher {
        &self.summed
    }

    pub fn add_unique(&self, name: impl Into<String>, attributes: Attributes) -> Result<()> {
        self.unique.add_unique(name, attributes)
    }

    pub fn add_summed(&self, metric_group: impl Into<String>, attributes: Attributes) -> Result<()> {
        self.summed.add_summed(metric_group, attributes)
    }

    /// Flushes both streams.
    pub fn send(&self) -> Result<()> {
        self.unique.send()?;
        self.summed.send()
    }

    /// Records the per-launch events and flushes both streams.
    ///
    /// The unique startup event is only recorded when the default
    /// attributes carry a non-empty `guid`.
    pub fn send_startup_events(&self) -> Result<()> {
        match self.attributes.get(DEFAULT_UNIQUE_EVENT) {
            Some(value) if !is_empty_value(value) => {
                self.unique
                    .add_unique(DEFAULT_UNIQUE_EVENT, self.attributes.clone())?;
            }
            _ => warn!(attribute = DEFAULT_UNIQUE_EVENT, "No unique startup attribute, skipping unique event"),
        }
        self.summed.add_summed(APPLICATION_LAUNCHES, Attributes::new())?;
        self.send()
    }

    /// Stops both schedulers and waits for their workers.
    pub async fn shutdown(self) {
        self.unique.stop();
        self.summed.stop();
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Event worker ended abnormally");
            }
        }
    }
}
