//! Polling worker executing pipeline runs with bounded concurrency.
//!
//! One logical thread of control per document: the worker fans runs out to
//! at most `concurrency` concurrent orchestrator executions and each of those
//! is strictly sequential inside. The reaper sweep at the top of every tick
//! is what turns crash-orphaned runs back into claimable work.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{sync::watch, task::JoinSet};

use crate::services::orchestrator::PipelineOrchestrator;
use crate::services::reaper::{ReaperAction, ReaperConfig, ReaperError, reap_stale_runs};
use crate::services::records::{DocumentStatus, RecordStore, RecordStoreError};
use crate::services::runs::{PipelineRunStore, RunStatus, RunStoreError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Runs(#[from] RunStoreError),
    #[error(transparent)]
    Records(#[from] RecordStoreError),
    #[error(transparent)]
    Reaper(#[from] ReaperError),
}

/// Executes pending runs until told to stop.
#[derive(Clone, bon::Builder)]
pub struct Worker {
    orchestrator: Arc<PipelineOrchestrator>,
    runs: Arc<PipelineRunStore>,
    records: Arc<RecordStore>,
    #[builder(default = 4)]
    concurrency: usize,
    #[builder(default = Duration::from_secs(1))]
    poll_interval: Duration,
    #[builder(default)]
    reaper: ReaperConfig,
}

impl Worker {
    /// Poll for work until the shutdown signal flips.
    pub async fn run_until_shutdown(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            concurrency = self.concurrency,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(processed) if processed > 0 => {
                    tracing::debug!(processed, "worker tick complete");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "worker tick failed");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!("worker stopped");
    }

    /// One scheduling pass: recover stale runs, then execute due pending runs
    /// with bounded concurrency. Returns the number of runs executed.
    pub async fn tick(&self) -> Result<usize, WorkerError> {
        debug_assert!(self.concurrency > 0);

        self.sweep_stale_runs()?;

        let candidates = self
            .runs
            .list_by_status(RunStatus::Pending, self.concurrency.saturating_mul(2))?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut processed = 0_usize;
        let mut inflight: JoinSet<()> = JoinSet::new();

        for run in candidates {
            while inflight.len() >= self.concurrency {
                let _ = inflight.join_next().await;
            }

            let orchestrator = Arc::clone(&self.orchestrator);
            let document_id = run.document_id.clone();
            processed = processed.saturating_add(1);
            inflight.spawn(async move {
                match orchestrator.run(&document_id).await {
                    Ok(report) => {
                        tracing::info!(
                            document_id = document_id.as_str(),
                            extraction_id = report.extraction_id.as_str(),
                            "run completed"
                        );
                    }
                    Err(err) => {
                        // Terminal causes are already recorded on the run and
                        // the document by the orchestrator.
                        tracing::warn!(
                            document_id = document_id.as_str(),
                            error = %err,
                            "run failed"
                        );
                    }
                }
            });
        }

        while inflight.join_next().await.is_some() {}

        Ok(processed)
    }

    /// Requeue or fail stale runs, and propagate terminal reaper failures to
    /// the owning document rows.
    fn sweep_stale_runs(&self) -> Result<(), WorkerError> {
        let report = reap_stale_runs(&self.runs, &self.reaper, ReaperAction::Both)?;
        if report.is_empty() {
            return Ok(());
        }

        tracing::info!(
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            skipped = report.skipped,
            "reaped stale runs"
        );

        for run_id in &report.failed {
            let cause = self
                .runs
                .get(run_id)?
                .and_then(|run| run.error)
                .unwrap_or_else(|| "stale run failed".to_string());

            match self
                .records
                .set_document_status(run_id, DocumentStatus::Failed, Some(cause))
            {
                Ok(_) => {}
                Err(RecordStoreError::DocumentNotFound(_)) => {
                    tracing::warn!(
                        run_id = run_id.as_str(),
                        "document row missing for reaped run"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        run_id = run_id.as_str(),
                        error = %err,
                        "unable to fail document for reaped run"
                    );
                }
            }
        }

        Ok(())
    }
}
