//! Submission scheduler - one retrying delivery worker per stream
//!
//! The [`SubmissionScheduler`] owns a [`BatchSource`] and an [`ITransport`].
//! Producers talk to it through a cloneable [`SchedulerHandle`]; the worker
//! itself runs as a single tokio task, so attempts within a stream are
//! strictly sequential.
//!
//! ## Flow
//!
//! ```text
//! SchedulerHandle ──Command──→ SubmissionScheduler ──SubmitRequest──→ ITransport
//!                                    │      ▲
//!                               timer heap  │ classify(status)
//!                          (retries, flush) │
//!                                    └──────┴──→ SubmissionOutcome channel
//! ```
//!
//! Retries and the auto flush are entries in a min-heap of due instants
//! rather than separate timer tasks. Stopping cancels a token that is
//! checked before every due entry fires; pending retries are dropped
//! silently and an attempt that is in flight when the stop arrives has its
//! result discarded.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use ferrytrace_core::ports::{ITransport, StreamKind, SubmitRequest};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{classify, Classification, RetryPolicy};
use crate::error::{Result, SubmitError};
use crate::outcome::{DeliveryStatus, SubmissionOutcome};
use crate::source::{Batch, BatchSource};

// ============================================================================
// Configuration
// ============================================================================

/// Per-stream scheduler settings
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub policy: RetryPolicy,
    /// Periodic flush of the source; `None` or zero disables it
    pub flush_interval: Option<Duration>,
    /// Fixed jitter seed for reproducible delays
    pub rng_seed: Option<u64>,
}

impl SchedulerConfig {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

// ============================================================================
// Commands and timers
// ============================================================================

enum Command<T> {
    /// Drain everything queued in the source
    Flush,
    /// Drain, then signal that the drain has ended
    FlushAndNotify(oneshot::Sender<()>),
    /// Deliver a ready batch
    Submit(Vec<T>),
}

enum TimerKind<T> {
    AutoFlush,
    Retry(Batch<T>),
}

struct Timer<T> {
    due: Instant,
    /// Tie-breaker so equal due times fire in scheduling order
    seq: u64,
    kind: TimerKind<T>,
}

impl<T> PartialEq for Timer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Timer<T> {}

impl<T> PartialOrd for Timer<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Timer<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

// ============================================================================
// SchedulerHandle
// ============================================================================

/// Handle for feeding a [`SubmissionScheduler`]
///
/// Cheap to clone; every clone talks to the same worker.
pub struct SchedulerHandle<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
    cancel: CancellationToken,
    stream: StreamKind,
}

impl<T> Clone for SchedulerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
            stream: self.stream,
        }
    }
}

impl<T> SchedulerHandle<T> {
    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    /// Asks the worker to drain its source. A no-op when nothing is queued.
    pub fn send(&self) -> Result<()> {
        self.command(Command::Flush)
    }

    /// Drains the source and resolves once the drain has ended.
    ///
    /// The drain ends when the source is empty or an attempt does not
    /// succeed; retries it scheduled are not waited for.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::FlushAndNotify(tx))?;
        rx.await.map_err(|_| SubmitError::Stopped(self.stream))
    }

    /// Hands a ready batch to the worker.
    pub fn submit(&self, items: Vec<T>) -> Result<()> {
        self.command(Command::Submit(items))
    }

    /// Stops the worker. Pending retries are dropped.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    fn command(&self, command: Command<T>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SubmitError::Stopped(self.stream));
        }
        self.tx
            .send(command)
            .map_err(|_| SubmitError::Stopped(self.stream))
    }
}

// ============================================================================
// SubmissionScheduler
// ============================================================================

/// Single-worker retry engine for one stream
///
/// # Example
///
/// ```ignore
/// let (scheduler, handle) = SubmissionScheduler::new(source, transport, config);
/// let (outcome_tx, mut outcomes) = tokio::sync::mpsc::unbounded_channel();
/// let worker = scheduler.with_outcomes(outcome_tx).spawn();
///
/// handle.send()?;
/// while let Some(outcome) = outcomes.recv().await {
///     println!("{} -> {}", outcome.batch_id, outcome.status);
/// }
/// ```
pub struct SubmissionScheduler<S: BatchSource> {
    source: Arc<S>,
    transport: Arc<dyn ITransport>,
    config: SchedulerConfig,
    commands: mpsc::UnboundedReceiver<Command<S::Item>>,
    cancel: CancellationToken,
    timers: BinaryHeap<Reverse<Timer<S::Item>>>,
    next_seq: u64,
    rng: StdRng,
    outcomes: Option<mpsc::UnboundedSender<SubmissionOutcome>>,
}

impl<S: BatchSource> SubmissionScheduler<S> {
    /// Creates the worker and its handle.
    ///
    /// The caller runs the worker with [`run`](Self::run) or
    /// [`spawn`](Self::spawn).
    pub fn new(
        source: Arc<S>,
        transport: Arc<dyn ITransport>,
        config: SchedulerConfig,
    ) -> (Self, SchedulerHandle<S::Item>) {
        let (tx, commands) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let handle = SchedulerHandle {
            tx,
            cancel: cancel.clone(),
            stream: source.stream(),
        };
        let scheduler = Self {
            source,
            transport,
            config,
            commands,
            cancel,
            timers: BinaryHeap::new(),
            next_seq: 0,
            rng,
            outcomes: None,
        };
        (scheduler, handle)
    }

    /// Reports every attempt's outcome on `tx`.
    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<SubmissionOutcome>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until the handle is stopped or every handle is dropped.
    pub async fn run(mut self) {
        let stream = self.source.stream();
        info!(stream = %stream, "Submission scheduler started");

        self.schedule_auto_flush();
        let cancel = self.cancel.clone();

        loop {
            let next_due = self.timers.peek().map(|Reverse(timer)| timer.due);

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                command = self.commands.recv() => match command {
                    Some(Command::Flush) => self.flush().await,
                    Some(Command::FlushAndNotify(done)) => {
                        self.flush().await;
                        let _ = done.send(());
                    }
                    Some(Command::Submit(items)) => {
                        if !items.is_empty() {
                            self.attempt(Batch::new(items)).await;
                        }
                    }
                    None => break,
                },

                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.fire_due().await;
                }
            }
        }

        self.shutdown();
        info!(stream = %stream, "Submission scheduler stopped");
    }

    // ========================================================================
    // Timers
    // ========================================================================

    fn schedule(&mut self, due: Instant, kind: TimerKind<S::Item>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.push(Reverse(Timer { due, seq, kind }));
    }

    fn schedule_auto_flush(&mut self) {
        if let Some(interval) = self.config.flush_interval.filter(|i| !i.is_zero()) {
            self.schedule(Instant::now() + interval, TimerKind::AutoFlush);
        }
    }

    async fn fire_due(&mut self) {
        loop {
            let now = Instant::now();
            if !matches!(self.timers.peek(), Some(Reverse(timer)) if timer.due <= now) {
                return;
            }
            if self.cancel.is_cancelled() {
                return;
            }
            let Some(Reverse(timer)) = self.timers.pop() else {
                return;
            };
            match timer.kind {
                TimerKind::AutoFlush => {
                    debug!(stream = %self.source.stream(), "Auto flush");
                    self.flush().await;
                    self.schedule_auto_flush();
                }
                TimerKind::Retry(batch) => {
                    self.attempt(batch).await;
                }
            }
        }
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Delivers queued batches until the source is empty or an attempt does
    /// not succeed.
    async fn flush(&mut self) {
        while !self.cancel.is_cancelled() {
            let Some(items) = self.source.next_batch() else {
                break;
            };
            if items.is_empty() {
                break;
            }
            if self.attempt(Batch::new(items)).await != Some(DeliveryStatus::Ok) {
                break;
            }
        }
    }

    /// Runs one attempt and routes the batch by its classification.
    ///
    /// Returns `None` when the scheduler stopped while the attempt was in
    /// flight.
    async fn attempt(&mut self, mut batch: Batch<S::Item>) -> Option<DeliveryStatus> {
        let stream = self.source.stream();
        let carried = batch.failures;
        let attempt = carried + 1;

        let encoded = match self.source.encode(&batch.items, carried) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(stream = %stream, batch_id = %batch.id, error = %e, "Failed to encode batch, dropping it");
                let abandoned = batch.len();
                let batch_id = batch.id;
                self.source.on_abandoned(batch.items);
                self.emit(SubmissionOutcome {
                    stream,
                    batch_id,
                    status: DeliveryStatus::PermanentFailure,
                    status_code: None,
                    attempt,
                    dropped_events: carried,
                    abandoned_items: abandoned,
                    retry_in: None,
                    message: Some(e.to_string()),
                });
                return Some(DeliveryStatus::PermanentFailure);
            }
        };

        let request = SubmitRequest {
            stream,
            batch_id: batch.id,
            attempt,
            payload: encoded.payload,
            attachments: encoded.attachments,
        };
        let result = self.transport.submit(request).await;

        if self.cancel.is_cancelled() {
            debug!(stream = %stream, batch_id = %batch.id, "Scheduler stopped during delivery, discarding result");
            self.source.on_cancelled(batch.items);
            return None;
        }

        let (status_code, message) = match result {
            Ok(response) => {
                let body = (!response.body.is_empty()).then_some(response.body);
                (Some(response.status), body)
            }
            Err(e) => (None, Some(format!("{e:#}"))),
        };

        let batch_id = batch.id;
        let total = batch.len();
        let mut outcome = SubmissionOutcome {
            stream,
            batch_id,
            status: DeliveryStatus::Ok,
            status_code,
            attempt,
            dropped_events: carried,
            abandoned_items: 0,
            retry_in: None,
            message,
        };

        match classify(status_code) {
            Classification::Delivered => {
                info!(stream = %stream, batch_id = %batch_id, attempt, items = total, "Batch delivered");
                self.source.on_delivered(batch.items);
            }
            Classification::Permanent => {
                warn!(stream = %stream, batch_id = %batch_id, status = ?status_code, items = total, "Batch rejected, dropping it");
                self.source.on_abandoned(batch.items);
                outcome.status = DeliveryStatus::PermanentFailure;
                outcome.abandoned_items = total;
            }
            Classification::Transient => {
                batch.failures += 1;
                let failures = batch.failures;

                if !self.config.policy.should_retry(failures) {
                    warn!(stream = %stream, batch_id = %batch_id, failures, items = total, "Retry budget exhausted, dropping batch");
                    self.source.on_abandoned(batch.items);
                    outcome.status = DeliveryStatus::RetryBudgetExhausted;
                    outcome.abandoned_items = total;
                } else {
                    let kept = self.source.on_retry(batch.items);
                    outcome.abandoned_items = total - kept.len().min(total);

                    if kept.is_empty() {
                        warn!(stream = %stream, batch_id = %batch_id, failures, "Every item exhausted its retries, dropping batch");
                        outcome.status = DeliveryStatus::RetryBudgetExhausted;
                    } else {
                        let delay = self.config.policy.delay_for(failures, &mut self.rng);
                        info!(
                            stream = %stream,
                            batch_id = %batch_id,
                            failures,
                            delay_ms = delay.as_millis() as u64,
                            status = ?status_code,
                            "Delivery failed, retry scheduled"
                        );
                        batch.items = kept;
                        self.schedule(Instant::now() + delay, TimerKind::Retry(batch));
                        outcome.status = DeliveryStatus::TransientFailure;
                        outcome.retry_in = Some(delay);
                    }
                }
            }
        }

        let status = outcome.status;
        self.emit(outcome);
        Some(status)
    }

    fn emit(&self, outcome: SubmissionOutcome) {
        if let Some(tx) = &self.outcomes {
            if tx.send(outcome).is_err() {
                debug!(stream = %self.source.stream(), "Outcome receiver dropped");
            }
        }
    }

    /// Hands pending work back to the source without delivering it.
    fn shutdown(&mut self) {
        let mut dropped = 0usize;
        for Reverse(timer) in std::mem::take(&mut self.timers) {
            if let TimerKind::Retry(batch) = timer.kind {
                dropped += batch.len();
                self.source.on_cancelled(batch.items);
            }
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Submit(items) = command {
                dropped += items.len();
                self.source.on_cancelled(items);
            }
        }

        if dropped > 0 {
            debug!(stream = %self.source.stream(), dropped, "Pending batches dropped on stop");
        }
    }
}
