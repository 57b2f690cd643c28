//! Stale-run recovery.
//!
//! A worker that crashes mid-run leaves its run in `Running` with no one to
//! finish it. The reaper requeues such runs with exponential backoff until
//! their retry budget is spent, then fails them. Requeued runs resume from
//! their persisted checkpoint with the original extraction id, which is what
//! keeps the store stage idempotent across crashes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::retry::calculate_retry_backoff;
use crate::services::runs::{
    PipelineRun, PipelineRunStore, RunStatus, RunStoreError, current_timestamp_ms,
};

/// Configuration for the stale run reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Maximum age for runs in Pending status (milliseconds)
    pub pending_max_age_ms: i64,
    /// Maximum age for runs in Running status (milliseconds)
    pub running_max_age_ms: i64,
    /// Base delay for exponential backoff (milliseconds)
    pub base_retry_delay_ms: i64,
    /// Maximum retry delay cap (milliseconds)
    pub max_retry_delay_ms: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            pending_max_age_ms: 86_400_000, // 24 hours
            running_max_age_ms: 1_800_000,  // 30 minutes
            base_retry_delay_ms: 60_000,    // 1 minute
            max_retry_delay_ms: 900_000,    // 15 minutes
        }
    }
}

/// Action to take when reaping stale runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperAction {
    /// Requeue stale runs with retry backoff
    Requeue,
    /// Mark stale runs as failed
    Fail,
    /// Requeue while retries remain, fail once exhausted
    Both,
}

/// Report of reaper execution results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperReport {
    /// Runs that were requeued for retry
    pub requeued: Vec<String>,
    /// Runs that were marked as failed
    pub failed: Vec<String>,
    /// Runs that were skipped (not yet at retry time)
    pub skipped: usize,
}

impl ReaperReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty() && self.skipped == 0
    }

    pub fn total(&self) -> usize {
        self.requeued.len() + self.failed.len() + self.skipped
    }
}

#[derive(Debug, Error)]
pub enum ReaperError {
    #[error(transparent)]
    Store(#[from] RunStoreError),
    #[error("reaper configuration invalid: {0}")]
    InvalidConfig(String),
}

/// Reap stale runs from the store.
pub fn reap_stale_runs(
    store: &PipelineRunStore,
    config: &ReaperConfig,
    action: ReaperAction,
) -> Result<ReaperReport, ReaperError> {
    if config.pending_max_age_ms <= 0 || config.running_max_age_ms <= 0 {
        return Err(ReaperError::InvalidConfig(
            "age thresholds must be positive".to_string(),
        ));
    }

    let mut report = ReaperReport {
        requeued: Vec::new(),
        failed: Vec::new(),
        skipped: 0,
    };

    reap_status(
        store,
        config,
        action,
        RunStatus::Pending,
        config.pending_max_age_ms,
        &mut report,
    )?;

    reap_status(
        store,
        config,
        action,
        RunStatus::Running,
        config.running_max_age_ms,
        &mut report,
    )?;

    Ok(report)
}

fn reap_status(
    store: &PipelineRunStore,
    config: &ReaperConfig,
    action: ReaperAction,
    status: RunStatus,
    age_threshold_ms: i64,
    report: &mut ReaperReport,
) -> Result<(), ReaperError> {
    let stale_runs = store.list_stale_runs(status, age_threshold_ms, 1000)?;

    for run in stale_runs {
        if action == ReaperAction::Requeue && run.retry_count >= run.max_retries {
            report.skipped = report.skipped.saturating_add(1);
            continue;
        }

        let should_requeue = match action {
            ReaperAction::Requeue => true,
            ReaperAction::Fail => false,
            ReaperAction::Both => run.retry_count < run.max_retries,
        };

        if should_requeue {
            requeue_run(store, config, &run, report)?;
        } else {
            fail_run(store, &run, report)?;
        }
    }

    Ok(())
}

fn requeue_run(
    store: &PipelineRunStore,
    config: &ReaperConfig,
    run: &PipelineRun,
    report: &mut ReaperReport,
) -> Result<(), ReaperError> {
    let mut updated_run = run.clone();
    updated_run.status = RunStatus::Pending;
    updated_run.stale = true;
    updated_run.retry_count = updated_run.retry_count.saturating_add(1);
    updated_run.updated_at_ms = current_timestamp_ms();

    if let Some(ref err) = updated_run.error {
        updated_run.last_error = Some(err.clone());
    }

    let backoff_delay = calculate_retry_backoff(
        updated_run.retry_count,
        config.base_retry_delay_ms,
        config.max_retry_delay_ms,
    );
    updated_run.next_retry_at_ms = Some(updated_run.updated_at_ms + backoff_delay);

    updated_run.error = Some(format!(
        "stale run requeued (attempt {} of {})",
        updated_run.retry_count, updated_run.max_retries
    ));

    store.upsert(&updated_run)?;
    report.requeued.push(run.run_id.clone());

    Ok(())
}

fn fail_run(
    store: &PipelineRunStore,
    run: &PipelineRun,
    report: &mut ReaperReport,
) -> Result<(), ReaperError> {
    let mut updated_run = run.clone();
    updated_run.status = RunStatus::Failed;
    updated_run.stale = true;
    updated_run.updated_at_ms = current_timestamp_ms();

    if let Some(ref err) = updated_run.error {
        updated_run.last_error = Some(err.clone());
    }

    let error_msg = if updated_run.retry_count >= updated_run.max_retries {
        format!(
            "stale run failed: max retries ({}) exhausted. Last error: {}",
            updated_run.max_retries,
            updated_run.last_error.as_deref().unwrap_or("none")
        )
    } else {
        format!(
            "stale run failed: exceeded age threshold. Last error: {}",
            updated_run.last_error.as_deref().unwrap_or("none")
        )
    };
    updated_run.error = Some(error_msg);

    store.upsert(&updated_run)?;
    report.failed.push(run.run_id.clone());

    Ok(())
}
