//! Database command - inspect and maintain an on-disk record database
//!
//! Opening a database runs its startup recovery, so corrupt records and
//! orphaned files are already gone by the time any subcommand looks at it.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Subcommand;
use ferrytrace_core::domain::{Record, RecordState};
use tracing::info;

use super::CommandContext;
use crate::output::human_bytes;

#[derive(Debug, Subcommand)]
pub enum DatabaseCommand {
    /// List stored records, oldest first
    List {
        /// Database directory (defaults to database.path)
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Check that the files on disk fit the configured budgets
    Validate {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Delete files that belong to no record
    Reconcile {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Delete every record
    Clear {
        #[arg(long)]
        path: Option<PathBuf>,
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

impl DatabaseCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        match self {
            DatabaseCommand::List { path } => list(ctx, path.as_deref()),
            DatabaseCommand::Validate { path } => validate(ctx, path.as_deref()),
            DatabaseCommand::Reconcile { path } => reconcile(ctx, path.as_deref()),
            DatabaseCommand::Clear { path, yes } => clear(ctx, path.as_deref(), *yes),
        }
    }
}

fn record_json(record: &Record, state: &RecordState) -> serde_json::Value {
    serde_json::json!({
        "id": record.id().to_string(),
        "created_at": record.created_at().to_rfc3339(),
        "size": record.size(),
        "payload_len": record.payload_len(),
        "attachments": record.attachments().len(),
        "retry_bucket": state.bucket,
    })
}

fn list(ctx: &CommandContext, path: Option<&Path>) -> Result<()> {
    let formatter = ctx.formatter();
    let db = ctx.open_database(path)?;
    let records = db.index().snapshot();

    if ctx.format.is_json() {
        let entries: Vec<_> = records
            .iter()
            .map(|(record, state)| record_json(record, state))
            .collect();
        formatter.print_json(&serde_json::json!({
            "path": db.settings().path.display().to_string(),
            "count": db.count(),
            "total_size": db.total_size(),
            "records": entries,
        }));
        return Ok(());
    }

    formatter.success(&format!(
        "{} record(s), {} in {}",
        db.count(),
        human_bytes(db.total_size()),
        db.settings().path.display()
    ));
    for (record, state) in &records {
        formatter.info(&format!(
            "{}  {}  {:>9}  bucket {}  {} attachment(s)",
            record.id(),
            record.created_at().format("%Y-%m-%d %H:%M:%S"),
            human_bytes(record.size()),
            state.bucket,
            record.attachments().len()
        ));
    }
    Ok(())
}

fn validate(ctx: &CommandContext, path: Option<&Path>) -> Result<()> {
    let formatter = ctx.formatter();
    let db = ctx.open_database(path)?;
    let valid = db.validate_consistency();
    let limits = db.settings().limits();

    if ctx.format.is_json() {
        formatter.print_json(&serde_json::json!({
            "valid": valid,
            "count": db.count(),
            "total_size": db.total_size(),
            "max_records": limits.max_records,
            "max_bytes": limits.max_bytes,
        }));
    } else if valid {
        formatter.success(&format!(
            "Database is consistent ({} record(s), {})",
            db.count(),
            human_bytes(db.total_size())
        ));
    }

    if !valid {
        bail!(
            "Database at {} exceeds its budgets",
            db.settings().path.display()
        );
    }
    Ok(())
}

fn reconcile(ctx: &CommandContext, path: Option<&Path>) -> Result<()> {
    let formatter = ctx.formatter();
    let db = ctx.open_database(path)?;
    let removed = db.reconcile()?;
    info!(removed, "Reconciled database");

    if ctx.format.is_json() {
        formatter.print_json(&serde_json::json!({ "removed_files": removed }));
    } else {
        formatter.success(&format!("Removed {removed} orphaned file(s)"));
    }
    Ok(())
}

fn clear(ctx: &CommandContext, path: Option<&Path>, yes: bool) -> Result<()> {
    if !yes {
        bail!("Refusing to delete every record without --yes");
    }
    let formatter = ctx.formatter();
    let db = ctx.open_database(path)?;
    let count = db.count();
    db.clear()?;

    if ctx.format.is_json() {
        formatter.print_json(&serde_json::json!({ "deleted": count }));
    } else {
        formatter.success(&format!("Deleted {count} record(s)"));
    }
    Ok(())
}
