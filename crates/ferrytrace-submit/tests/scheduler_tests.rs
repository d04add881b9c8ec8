//! Integration tests for the submission scheduler
//!
//! All timing tests run on a paused tokio clock, so backoff delays of
//! minutes complete instantly and deterministically.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use ferrytrace_core::ports::{
    ITransport, StreamKind, SubmitRequest, SystemClock, TransportResponse,
};
use ferrytrace_store::{Database, DatabaseSettings};
use ferrytrace_submit::{
    BatchSource, DeliveryStatus, EncodedBatch, ReportQueue, RetryPolicy, SchedulerConfig,
    SubmissionOutcome, SubmissionScheduler,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

// ============================================================================
// Test doubles
// ============================================================================

/// Replies from a script of statuses; `None` simulates a network error.
struct ScriptedTransport {
    script: Mutex<VecDeque<Option<u16>>>,
    fallback: Option<u16>,
    requests: Mutex<Vec<SubmitRequest>>,
    called_at: Mutex<Vec<Instant>>,
}

impl ScriptedTransport {
    fn new(script: Vec<Option<u16>>, fallback: Option<u16>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
            called_at: Mutex::new(Vec::new()),
        })
    }

    fn always(status: u16) -> Arc<Self> {
        Self::new(vec![], Some(status))
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn payload(&self, n: usize) -> serde_json::Value {
        serde_json::from_slice(&self.requests.lock().unwrap()[n].payload).unwrap()
    }
}

#[async_trait]
impl ITransport for ScriptedTransport {
    async fn submit(&self, request: SubmitRequest) -> anyhow::Result<TransportResponse> {
        self.requests.lock().unwrap().push(request);
        self.called_at.lock().unwrap().push(Instant::now());
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        match next {
            Some(status) => Ok(TransportResponse::new(status, "")),
            None => Err(anyhow!("connection refused")),
        }
    }
}

/// Holds every attempt until released.
struct GatedTransport {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ITransport for GatedTransport {
    async fn submit(&self, _request: SubmitRequest) -> anyhow::Result<TransportResponse> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(TransportResponse::new(200, ""))
    }
}

/// In-memory event queue that records what happened to each item.
#[derive(Default)]
struct MemorySource {
    queued: Mutex<Vec<String>>,
    delivered: Mutex<Vec<String>>,
    abandoned: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
}

impl MemorySource {
    fn with(items: &[&str]) -> Arc<Self> {
        let source = Self::default();
        source
            .queued
            .lock()
            .unwrap()
            .extend(items.iter().map(|s| s.to_string()));
        Arc::new(source)
    }
}

impl BatchSource for MemorySource {
    type Item = String;

    fn stream(&self) -> StreamKind {
        StreamKind::UniqueEvents
    }

    fn next_batch(&self) -> Option<Vec<String>> {
        let items = std::mem::take(&mut *self.queued.lock().unwrap());
        (!items.is_empty()).then_some(items)
    }

    fn encode(&self, items: &[String], dropped_events: u32) -> anyhow::Result<EncodedBatch> {
        let body = json!({ "metadata": { "dropped_events": dropped_events }, "items": items });
        Ok(EncodedBatch::new(serde_json::to_vec(&body)?))
    }

    fn on_delivered(&self, items: Vec<String>) {
        self.delivered.lock().unwrap().extend(items);
    }

    fn on_abandoned(&self, items: Vec<String>) {
        self.abandoned.lock().unwrap().extend(items);
    }

    fn on_cancelled(&self, items: Vec<String>) {
        self.cancelled.lock().unwrap().extend(items);
    }
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        ..RetryPolicy::default()
    }
}

/// The paused clock lands on millisecond timer ticks.
fn assert_waited(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual <= expected + Duration::from_millis(5),
        "waited {actual:?}, expected {expected:?}"
    );
}

fn start<S: BatchSource>(
    source: Arc<S>,
    transport: Arc<dyn ITransport>,
    config: SchedulerConfig,
) -> (
    ferrytrace_submit::SchedulerHandle<S::Item>,
    mpsc::UnboundedReceiver<SubmissionOutcome>,
    tokio::task::JoinHandle<()>,
) {
    let (scheduler, handle) = SubmissionScheduler::new(source, transport, config.with_rng_seed(42));
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = scheduler.with_outcomes(tx).spawn();
    (handle, rx, worker)
}

// ============================================================================
// Retry scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_failures_carry_dropped_events_until_success() {
    let source = MemorySource::with(&["app.launch"]);
    let transport = ScriptedTransport::new(vec![Some(503), None, Some(502), Some(200)], None);
    let (handle, mut outcomes, _worker) = start(
        Arc::clone(&source),
        transport.clone(),
        SchedulerConfig::new(policy(5)),
    );

    handle.send().unwrap();

    let mut seen = Vec::new();
    loop {
        let outcome = outcomes.recv().await.unwrap();
        let done = outcome.status.is_final();
        seen.push(outcome);
        if done {
            break;
        }
    }

    assert_eq!(seen.len(), 4);
    assert!(seen[..3]
        .iter()
        .all(|o| o.status == DeliveryStatus::TransientFailure && o.retry_in.is_some()));
    assert_eq!(seen[1].status_code, None);
    let last = &seen[3];
    assert_eq!(last.status, DeliveryStatus::Ok);
    assert_eq!(last.attempt, 4);
    assert_eq!(last.dropped_events, 3);
    assert!(seen.iter().all(|o| o.batch_id == last.batch_id));

    assert_eq!(transport.payload(0)["metadata"]["dropped_events"], 0);
    assert_eq!(transport.payload(3)["metadata"]["dropped_events"], 3);
    assert_eq!(*source.delivered.lock().unwrap(), vec!["app.launch"]);
}

#[tokio::test(start_paused = true)]
async fn test_retries_follow_exponential_backoff() {
    let source = MemorySource::with(&["a"]);
    let transport = ScriptedTransport::new(vec![Some(500), Some(500)], Some(200));
    let config = SchedulerConfig::new(RetryPolicy {
        jitter_fraction: 0.0,
        max_attempts: 5,
        ..RetryPolicy::default()
    });
    let (handle, mut outcomes, _worker) = start(source, transport.clone(), config);

    handle.send().unwrap();
    let first = outcomes.recv().await.unwrap();
    let second = outcomes.recv().await.unwrap();
    let third = outcomes.recv().await.unwrap();

    assert_eq!(first.retry_in, Some(Duration::from_secs(10)));
    assert_eq!(second.retry_in, Some(Duration::from_secs(100)));
    assert!(third.is_delivered());

    let times = transport.called_at.lock().unwrap().clone();
    assert_waited(times[1] - times[0], Duration::from_secs(10));
    assert_waited(times[2] - times[1], Duration::from_secs(100));
}

#[tokio::test(start_paused = true)]
async fn test_single_attempt_policy_abandons_without_retry() {
    let source = MemorySource::with(&["a", "b"]);
    let transport = ScriptedTransport::always(503);
    let (handle, mut outcomes, _worker) = start(
        Arc::clone(&source),
        transport.clone(),
        SchedulerConfig::new(policy(1)),
    );

    handle.send().unwrap();
    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.status, DeliveryStatus::RetryBudgetExhausted);
    assert_eq!(outcome.abandoned_items, 2);
    assert_eq!(outcome.retry_in, None);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(transport.calls(), 1);
    assert!(outcomes.try_recv().is_err());
    assert_eq!(source.abandoned.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_base_delay_disables_retries() {
    let source = MemorySource::with(&["a"]);
    let transport = ScriptedTransport::always(503);
    let config = SchedulerConfig::new(RetryPolicy {
        base_delay: Duration::ZERO,
        ..RetryPolicy::default()
    });
    let (handle, mut outcomes, _worker) = start(source, transport.clone(), config);

    handle.send().unwrap();
    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.status, DeliveryStatus::RetryBudgetExhausted);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_drops_the_batch() {
    let source = MemorySource::with(&["a"]);
    let transport = ScriptedTransport::always(400);
    let (handle, mut outcomes, _worker) = start(
        Arc::clone(&source),
        transport.clone(),
        SchedulerConfig::default(),
    );

    handle.send().unwrap();
    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.status, DeliveryStatus::PermanentFailure);
    assert_eq!(outcome.status_code, Some(400));
    assert_eq!(outcome.abandoned_items, 1);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(transport.calls(), 1);
    assert_eq!(*source.abandoned.lock().unwrap(), vec!["a"]);
}

#[tokio::test(start_paused = true)]
async fn test_version_not_supported_is_permanent() {
    let source = MemorySource::with(&["a"]);
    let transport = ScriptedTransport::always(505);
    let (handle, mut outcomes, _worker) =
        start(source, transport.clone(), SchedulerConfig::default());

    handle.send().unwrap();
    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.status, DeliveryStatus::PermanentFailure);
}

// ============================================================================
// Flushing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_send_without_queued_items_is_a_no_op() {
    let source = MemorySource::with(&[]);
    let transport = ScriptedTransport::always(200);
    let (handle, mut outcomes, _worker) =
        start(source, transport.clone(), SchedulerConfig::default());

    handle.send().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(transport.calls(), 0);
    assert!(outcomes.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_submit_delivers_a_ready_batch() {
    let source = MemorySource::with(&[]);
    let transport = ScriptedTransport::always(202);
    let (handle, mut outcomes, _worker) = start(
        Arc::clone(&source),
        transport.clone(),
        SchedulerConfig::default(),
    );

    handle.submit(vec!["ready".to_string()]).unwrap();
    let outcome = outcomes.recv().await.unwrap();
    assert!(outcome.is_delivered());
    assert_eq!(outcome.stream, StreamKind::UniqueEvents);
    assert_eq!(*source.delivered.lock().unwrap(), vec!["ready"]);
}

#[tokio::test(start_paused = true)]
async fn test_auto_flush_fires_on_its_interval() {
    let source = MemorySource::with(&["periodic"]);
    let transport = ScriptedTransport::always(200);
    let started = Instant::now();
    let config = SchedulerConfig::default().with_flush_interval(Duration::from_secs(30 * 60));
    let (_handle, mut outcomes, _worker) = start(source.clone(), transport.clone(), config);

    let outcome = outcomes.recv().await.unwrap();
    assert!(outcome.is_delivered());
    let fired = transport.called_at.lock().unwrap()[0];
    assert!(fired - started >= Duration::from_secs(30 * 60));

    // reschedules itself
    source.queued.lock().unwrap().push("again".to_string());
    let outcome = outcomes.recv().await.unwrap();
    assert!(outcome.is_delivered());
    let fired = transport.called_at.lock().unwrap()[1];
    assert!(fired - started >= Duration::from_secs(60 * 60));
}

// ============================================================================
// Stopping
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_drops_pending_retries() {
    let source = MemorySource::with(&["a"]);
    let transport = ScriptedTransport::always(503);
    let (handle, mut outcomes, worker) = start(
        Arc::clone(&source),
        transport.clone(),
        SchedulerConfig::default(),
    );

    handle.send().unwrap();
    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.status, DeliveryStatus::TransientFailure);

    handle.stop();
    worker.await.unwrap();

    assert_eq!(transport.calls(), 1);
    assert_eq!(*source.cancelled.lock().unwrap(), vec!["a"]);
    assert!(source.abandoned.lock().unwrap().is_empty());
    assert!(handle.send().is_err());
}

#[tokio::test]
async fn test_in_flight_result_is_discarded_after_stop() {
    let source = MemorySource::with(&[]);
    let transport = Arc::new(GatedTransport {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let (handle, mut outcomes, worker) = start(
        Arc::clone(&source),
        transport.clone(),
        SchedulerConfig::default(),
    );

    handle.submit(vec!["in-flight".to_string()]).unwrap();
    transport.entered.notified().await;
    handle.stop();
    transport.release.notify_one();
    worker.await.unwrap();

    assert!(outcomes.recv().await.is_none());
    assert!(source.delivered.lock().unwrap().is_empty());
    assert_eq!(*source.cancelled.lock().unwrap(), vec!["in-flight"]);
}

// ============================================================================
// Report stream
// ============================================================================

fn report_queue(dir: &TempDir, retry_limit: u32) -> Arc<ReportQueue> {
    let mut settings = DatabaseSettings::new(dir.path());
    settings.retry_limit = retry_limit;
    let db = Database::open(settings, Arc::new(SystemClock)).unwrap();
    Arc::new(ReportQueue::new(Arc::new(db)))
}

#[tokio::test(start_paused = true)]
async fn test_report_stream_drains_the_database() {
    let dir = TempDir::new().unwrap();
    let queue = report_queue(&dir, 3);
    for i in 0..3u8 {
        queue.database().add(&[b'r', i], &[]).unwrap();
    }
    let transport = ScriptedTransport::always(200);
    let (handle, mut outcomes, _worker) = start(
        Arc::clone(&queue),
        transport.clone(),
        SchedulerConfig::default(),
    );

    handle.send().unwrap();
    for _ in 0..3 {
        let outcome = outcomes.recv().await.unwrap();
        assert!(outcome.is_delivered());
        assert_eq!(outcome.stream, StreamKind::Reports);
    }

    assert_eq!(queue.database().count(), 0);
    assert_eq!(transport.calls(), 3);
    assert_eq!(transport.requests.lock().unwrap()[0].payload, vec![b'r', 0]);
}

#[tokio::test(start_paused = true)]
async fn test_report_flush_stops_at_first_failure() {
    let dir = TempDir::new().unwrap();
    let queue = report_queue(&dir, 3);
    queue.database().add(b"first", &[]).unwrap();
    queue.database().add(b"second", &[]).unwrap();
    let transport = ScriptedTransport::new(vec![Some(503)], Some(200));
    let (handle, mut outcomes, _worker) = start(
        Arc::clone(&queue),
        transport.clone(),
        SchedulerConfig::default(),
    );

    handle.send().unwrap();
    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.status, DeliveryStatus::TransientFailure);
    assert_eq!(transport.calls(), 1);

    // the retry succeeds and the second record waits for the next flush
    let outcome = outcomes.recv().await.unwrap();
    assert!(outcome.is_delivered());
    assert_eq!(queue.database().count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_report_is_deleted_when_its_buckets_run_out() {
    let dir = TempDir::new().unwrap();
    let queue = report_queue(&dir, 2);
    queue.database().add(b"doomed", &[]).unwrap();
    let transport = ScriptedTransport::always(503);
    let (handle, mut outcomes, _worker) = start(
        Arc::clone(&queue),
        transport.clone(),
        SchedulerConfig::new(policy(10)),
    );

    handle.send().unwrap();
    let first = outcomes.recv().await.unwrap();
    assert_eq!(first.status, DeliveryStatus::TransientFailure);
    let second = outcomes.recv().await.unwrap();
    assert_eq!(second.status, DeliveryStatus::RetryBudgetExhausted);
    assert_eq!(second.abandoned_items, 1);

    assert_eq!(queue.database().count(), 0);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stopping_the_report_stream_unlocks_records() {
    let dir = TempDir::new().unwrap();
    let queue = report_queue(&dir, 3);
    let record = queue.database().add(b"later", &[]).unwrap();
    let transport = ScriptedTransport::always(503);
    let (handle, mut outcomes, worker) = start(
        Arc::clone(&queue),
        transport.clone(),
        SchedulerConfig::default(),
    );

    handle.send().unwrap();
    outcomes.recv().await.unwrap();
    handle.stop();
    worker.await.unwrap();

    let state = queue.database().index().state(record.id()).unwrap();
    assert!(!state.locked);
    assert_eq!(state.bucket, 1);
}
