//! Event batchers
//!
//! An [`EventBatcher`] is the producer side of one event stream: it records
//! events into its [`EventQueue`] and asks the stream's scheduler to flush
//! once the queue reaches its maximum. Delivery, retry and the periodic
//! flush all happen on the scheduler's worker task.

use std::sync::Arc;

use ferrytrace_core::domain::{Attributes, SummedEvent, UniqueEvent};
use ferrytrace_core::ports::{IClock, ITransport};
use ferrytrace_submit::{
    RetryPolicy, SchedulerConfig, SchedulerHandle, SubmissionOutcome, SubmissionScheduler,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Result;
use crate::queue::{BatcherSettings, EventKind, EventQueue};

/// Producer handle for one event stream
pub struct EventBatcher<E: EventKind> {
    queue: Arc<EventQueue<E>>,
    handle: SchedulerHandle<E>,
}

pub type UniqueEventBatcher = EventBatcher<UniqueEvent>;
pub type SummedEventBatcher = EventBatcher<SummedEvent>;

impl<E: EventKind> EventBatcher<E> {
    /// Creates the queue and spawns its scheduler on the current runtime.
    pub fn start(
        settings: BatcherSettings,
        clock: Arc<dyn IClock>,
        transport: Arc<dyn ITransport>,
        policy: RetryPolicy,
        outcomes: Option<mpsc::UnboundedSender<SubmissionOutcome>>,
    ) -> (Self, JoinHandle<()>) {
        let mut config = SchedulerConfig::new(policy);
        config.flush_interval = settings.flush_interval;

        let queue = Arc::new(EventQueue::new(settings, clock));
        let (scheduler, handle) = SubmissionScheduler::new(Arc::clone(&queue), transport, config);
        let scheduler = match outcomes {
            Some(tx) => scheduler.with_outcomes(tx),
            None => scheduler,
        };
        let worker = scheduler.spawn();

        (Self { queue, handle }, worker)
    }

    pub fn queue(&self) -> &Arc<EventQueue<E>> {
        &self.queue
    }

    /// Number of events waiting for the next flush
    pub fn count(&self) -> usize {
        self.queue.len()
    }

    pub fn max_events(&self) -> u32 {
        self.queue.settings().max_events
    }

    /// Flushes every queued event. A no-op when nothing is queued.
    pub fn send(&self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        self.handle.send()?;
        Ok(())
    }

    /// Stops the scheduler; pending retries are dropped.
    pub fn stop(&self) {
        self.handle.stop();
    }

    fn record(&self, event: E) -> Result<()> {
        let len = self.queue.upsert(event)?;
        if self.queue.settings().is_full(len) {
            debug!(stream = %E::STREAM, len, "Event batcher full, flushing");
            self.handle.send()?;
        }
        Ok(())
    }
}

impl EventBatcher<UniqueEvent> {
    /// Records a unique event, refreshing the queued one with the same name.
    pub fn add_unique(&self, name: impl Into<String>, attributes: Attributes) -> Result<()> {
        let event = UniqueEvent::new(name, self.queue.now(), attributes)?;
        self.record(event)
    }
}

impl EventBatcher<SummedEvent> {
    /// Records one occurrence of a summed event.
    pub fn add_summed(&self, metric_group: impl Into<String>, attributes: Attributes) -> Result<()> {
        let event = SummedEvent::new(metric_group, self.queue.now(), attributes)?;
        self.record(event)
    }
}
