//! Flush command - deliver every stored report once
//!
//! Runs a short-lived reporter over the database. A transient failure stops
//! the flush and leaves the remaining records for the next run; a rejected
//! report is deleted like it would be by the host application.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use ferrytrace_client::Reporter;
use ferrytrace_core::config::Config;
use ferrytrace_core::domain::Attributes;
use ferrytrace_submit::{DeliveryStatus, SubmissionOutcome};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct FlushCommand {
    /// Report endpoint (overrides endpoints.reports_url)
    #[arg(long)]
    url: Option<String>,

    /// Submission token (overrides endpoints.token)
    #[arg(long)]
    token: Option<String>,

    /// Database directory (defaults to database.path)
    #[arg(long)]
    path: Option<PathBuf>,
}

/// Tally of the outcomes seen during one flush
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushSummary {
    pub delivered: usize,
    pub rejected: usize,
    pub deferred: usize,
    pub dropped: usize,
}

impl FlushSummary {
    fn record(&mut self, outcome: &SubmissionOutcome) {
        match outcome.status {
            DeliveryStatus::Ok => self.delivered += 1,
            DeliveryStatus::PermanentFailure => self.rejected += 1,
            DeliveryStatus::TransientFailure => self.deferred += 1,
            DeliveryStatus::RetryBudgetExhausted => self.dropped += 1,
        }
    }
}

impl FlushCommand {
    /// Configuration for a one-shot reporter: no events, no timers.
    fn flush_config(&self, ctx: &CommandContext) -> Config {
        let mut config = ctx.config.clone();
        config.database.path = ctx.database_path(self.path.as_deref());
        config.database.auto_send = false;
        config.database.retry_interval_secs = 0;
        config.metrics.enabled = false;
        if let Some(url) = &self.url {
            config.endpoints.reports_url = Some(url.clone());
        }
        if let Some(token) = &self.token {
            config.endpoints.token = Some(token.clone());
        }
        config
    }

    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let config = self.flush_config(ctx);
        if config.endpoints.reports_url.is_none() {
            anyhow::bail!("No report endpoint configured; pass --url or set endpoints.reports_url");
        }

        let reporter = Reporter::from_config(config, Attributes::new())
            .context("Failed to start reporter")?;
        let collector = tokio::spawn(collect(reporter.subscribe()));

        let initial = reporter.database().count();
        info!(records = initial, "Flushing reports");

        // each drain stops at the first failure; keep going while records disappear
        loop {
            let before = reporter.database().count();
            if before == 0 {
                break;
            }
            reporter.flush_reports().await?;
            if reporter.database().count() >= before {
                break;
            }
        }

        reporter.shutdown().await;
        let summary = collector.await.context("Outcome collector failed")?;
        self.print(ctx, &summary, initial);
        Ok(())
    }

    fn print(&self, ctx: &CommandContext, summary: &FlushSummary, initial: usize) {
        let formatter = ctx.formatter();
        if ctx.format.is_json() {
            formatter.print_json(&serde_json::json!({
                "records": initial,
                "delivered": summary.delivered,
                "rejected": summary.rejected,
                "deferred": summary.deferred,
                "dropped": summary.dropped,
            }));
            return;
        }

        formatter.success(&format!(
            "Delivered {} of {} report(s)",
            summary.delivered, initial
        ));
        if summary.rejected > 0 {
            formatter.warn(&format!("{} report(s) rejected and deleted", summary.rejected));
        }
        if summary.dropped > 0 {
            formatter.warn(&format!(
                "{} report(s) dropped after exhausting their retries",
                summary.dropped
            ));
        }
        if summary.deferred > 0 {
            formatter.info("Collector unavailable; remaining reports kept for the next run");
        }
    }
}

/// Tallies outcomes until the reporter has shut down.
async fn collect(mut rx: broadcast::Receiver<SubmissionOutcome>) -> FlushSummary {
    let mut summary = FlushSummary::default();
    loop {
        match rx.recv().await {
            Ok(outcome) => summary.record(&outcome),
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Outcome collector lagged"),
            Err(RecvError::Closed) => return summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use ferrytrace_core::domain::BatchId;
    use ferrytrace_core::ports::StreamKind;

    use super::*;
    use crate::output::OutputFormat;

    fn outcome(status: DeliveryStatus) -> SubmissionOutcome {
        SubmissionOutcome {
            stream: StreamKind::Reports,
            batch_id: BatchId::new(),
            status,
            status_code: Some(200),
            attempt: 1,
            dropped_events: 0,
            abandoned_items: 0,
            retry_in: None,
            message: None,
        }
    }

    #[test]
    fn test_summary_tally() {
        let mut summary = FlushSummary::default();
        summary.record(&outcome(DeliveryStatus::Ok));
        summary.record(&outcome(DeliveryStatus::Ok));
        summary.record(&outcome(DeliveryStatus::PermanentFailure));
        summary.record(&outcome(DeliveryStatus::TransientFailure));
        assert_eq!(
            summary,
            FlushSummary {
                delivered: 2,
                rejected: 1,
                deferred: 1,
                dropped: 0,
            }
        );
    }

    #[test]
    fn test_flush_config_overrides() {
        let ctx = CommandContext {
            config: Config::default(),
            config_path: PathBuf::from("config.yaml"),
            format: OutputFormat::Human,
            quiet: true,
        };
        let command = FlushCommand {
            url: Some("https://collector.example.com/reports".to_string()),
            token: Some("abc".to_string()),
            path: Some(PathBuf::from("/tmp/db")),
        };

        let config = command.flush_config(&ctx);
        assert_eq!(
            config.endpoints.reports_url.as_deref(),
            Some("https://collector.example.com/reports")
        );
        assert_eq!(config.endpoints.token.as_deref(), Some("abc"));
        assert_eq!(config.database.path, PathBuf::from("/tmp/db"));
        assert!(!config.database.auto_send);
        assert!(!config.metrics.enabled);
    }
}
