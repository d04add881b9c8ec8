//! Prometheus metrics for the delivery pipeline
//!
//! Counters are fed from the [`SubmissionOutcome`] stream, the pending gauge
//! from the record database. Nothing is exported over HTTP; hosts call
//! [`QueueMetrics::encode`] when they want a text snapshot.

use ferrytrace_submit::SubmissionOutcome;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Registry holding the queue and delivery metrics.
pub struct QueueMetrics {
    registry: Registry,
    /// Counter: delivery attempts by (stream, status)
    pub outcomes_total: IntCounterVec,
    /// Counter: items discarded after a permanent failure or exhausted budget
    pub abandoned_items_total: IntCounterVec,
    /// Gauge: records currently stored in the database
    pub pending_records: IntGauge,
    /// Histogram: delay scheduled before a retry, in seconds
    pub retry_delay_seconds: HistogramVec,
}

impl QueueMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new_custom(Some("ferrytrace".to_string()), None)?;

        let outcomes_total = IntCounterVec::new(
            Opts::new("outcomes_total", "Delivery attempts by outcome"),
            &["stream", "status"],
        )?;
        registry.register(Box::new(outcomes_total.clone()))?;

        let abandoned_items_total = IntCounterVec::new(
            Opts::new("abandoned_items_total", "Items given up on"),
            &["stream"],
        )?;
        registry.register(Box::new(abandoned_items_total.clone()))?;

        let pending_records = IntGauge::new("pending_records", "Records waiting for delivery")?;
        registry.register(Box::new(pending_records.clone()))?;

        let retry_delay_seconds = HistogramVec::new(
            HistogramOpts::new("retry_delay_seconds", "Delay before the next attempt")
                .buckets(vec![10.0, 30.0, 100.0, 300.0, 600.0]),
            &["stream"],
        )?;
        registry.register(Box::new(retry_delay_seconds.clone()))?;

        Ok(Self {
            registry,
            outcomes_total,
            abandoned_items_total,
            pending_records,
            retry_delay_seconds,
        })
    }

    // ========================================================================
    // Recording helpers
    // ========================================================================

    pub fn record_outcome(&self, outcome: &SubmissionOutcome) {
        let stream = outcome.stream.as_str();
        self.outcomes_total
            .with_label_values(&[stream, outcome.status.as_str()])
            .inc();
        if outcome.abandoned_items > 0 {
            self.abandoned_items_total
                .with_label_values(&[stream])
                .inc_by(outcome.abandoned_items as u64);
        }
        if let Some(delay) = outcome.retry_in {
            self.retry_delay_seconds
                .with_label_values(&[stream])
                .observe(delay.as_secs_f64());
        }
    }

    pub fn set_pending_records(&self, count: usize) {
        self.pending_records
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Number of attempts recorded for `stream` with `status`.
    pub fn outcome_count(&self, stream: &str, status: &str) -> u64 {
        self.outcomes_total.with_label_values(&[stream, status]).get()
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Encode all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
