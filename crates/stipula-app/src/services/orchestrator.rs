//! Durable pipeline orchestration: parse → extract → store.
//!
//! Each stage runs under its own attempt budget and timeout, and every stage
//! boundary is checkpointed in the run store, so a crashed or requeued run
//! resumes after its last completed stage with the extraction id it was
//! assigned at enqueue. Stages are strictly sequential: each one's output is
//! the next one's input.

use std::{future::Future, sync::Arc, time::Duration};

use serde::Serialize;
use thiserror::Error;

use crate::pdf::{ParseOutcome, PdfExtractError, TextExtractor};
use crate::pipeline::ClauseExtraction;
use crate::services::blob_store::BlobStore;
use crate::services::llm::ClauseExtractor;
use crate::services::persist::ResultStore;
use crate::services::records::{DocumentStatus, RecordStore, RecordStoreError};
use crate::services::retry::backoff_duration;
use crate::services::runs::{Checkpoint, PipelineRun, PipelineRunStore, RunStatus, RunStoreError};

/// Attempt budget and timing for one stage.
#[derive(Debug, Clone, Copy, bon::Builder)]
pub struct StagePolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
    #[builder(default = 1_000)]
    pub base_delay_ms: i64,
    #[builder(default = 10_000)]
    pub max_delay_ms: i64,
}

/// Per-stage policies. The extract stage gets a single orchestrator-level
/// attempt: the client's internal backoff loop is the authoritative retry
/// layer for transient API errors, so wrapping it again would compound
/// attempts.
#[derive(Debug, Clone, Copy)]
pub struct PipelinePolicies {
    pub parse: StagePolicy,
    pub extract: StagePolicy,
    pub store: StagePolicy,
}

impl Default for PipelinePolicies {
    fn default() -> Self {
        Self {
            parse: StagePolicy::builder()
                .max_attempts(2)
                .timeout(Duration::from_secs(300))
                .build(),
            extract: StagePolicy::builder()
                .max_attempts(1)
                .timeout(Duration::from_secs(120))
                .build(),
            store: StagePolicy::builder()
                .max_attempts(3)
                .timeout(Duration::from_secs(60))
                .base_delay_ms(500)
                .max_delay_ms(5_000)
                .build(),
        }
    }
}

/// Public outcome of a successful run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PipelineReport {
    pub status: &'static str,
    pub document_id: String,
    pub extraction_id: String,
}

/// Errors surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Runs(#[from] RunStoreError),
    #[error(transparent)]
    Records(#[from] RecordStoreError),
    #[error("{stage} stage failed: {cause}")]
    StageFailed { stage: &'static str, cause: String },
    #[error("run `{run_id}` cannot resume: {reason}")]
    ResumeInconsistent { run_id: String, reason: String },
}

/// One attempt's failure, classified for the retry policy.
#[derive(Debug)]
enum StageError {
    /// Never retried: more attempts cannot change the outcome.
    Terminal(String),
    /// Worth another attempt within the stage budget.
    Transient(String),
}

/// Sequences the three pipeline stages for one document.
#[derive(Clone, bon::Builder)]
pub struct PipelineOrchestrator {
    text_extractor: Arc<dyn TextExtractor>,
    clause_extractor: Arc<dyn ClauseExtractor>,
    result_store: ResultStore,
    blob: Arc<dyn BlobStore>,
    records: Arc<RecordStore>,
    runs: Arc<PipelineRunStore>,
    #[builder(into)]
    uploads_bucket: String,
    #[builder(default)]
    policies: PipelinePolicies,
}

impl PipelineOrchestrator {
    /// Execute (or resume) the pipeline run for a document. Creates and
    /// durably persists the run, extraction id included, before any stage
    /// executes, so re-execution after a crash reuses the same identifier.
    pub async fn run(&self, document_id: &str) -> Result<PipelineReport, PipelineError> {
        debug_assert!(!document_id.is_empty());

        let mut run = match self.runs.get(document_id)? {
            Some(run) => run,
            None => {
                let run = PipelineRun::new(document_id);
                self.runs.enqueue(&run)?;
                run
            }
        };

        if run.status == RunStatus::Completed {
            tracing::info!(document_id, "run already completed; nothing to do");
            return Ok(self.completed_report(&run));
        }

        tracing::info!(
            document_id,
            extraction_id = run.extraction_id.as_str(),
            checkpoint = ?run.checkpoint,
            "starting extraction pipeline"
        );
        run.set_status(RunStatus::Running, None);
        self.runs.upsert(&run)?;

        // Stage 1: parse. Skipped on resume; the parsed text lives on the
        // document row.
        let text = if run.checkpoint < Checkpoint::Parsed {
            let outcome = match execute_with_policy("parse", &self.policies.parse, || {
                self.parse_attempt(document_id)
            })
            .await
            {
                Ok(outcome) => outcome,
                Err(cause) => return Err(self.fail_run(&mut run, "parse", cause)),
            };
            tracing::info!(
                document_id,
                page_count = outcome.page_count,
                chars = outcome.text.len(),
                "document parsed"
            );
            run.checkpoint = Checkpoint::Parsed;
            self.runs.upsert(&run)?;
            outcome.text
        } else {
            match self.records.get_document(document_id)?.and_then(|doc| doc.raw_text) {
                Some(text) => text,
                None => {
                    return Err(PipelineError::ResumeInconsistent {
                        run_id: run.run_id.clone(),
                        reason: "parse checkpoint set but no extracted text on record".to_string(),
                    });
                }
            }
        };

        // Stage 2: extract. The adapter retries transient API errors itself.
        if run.checkpoint < Checkpoint::Extracted {
            let payload = match execute_with_policy("extract", &self.policies.extract, || {
                self.extract_attempt(&text)
            })
            .await
            {
                Ok(payload) => payload,
                Err(cause) => return Err(self.fail_run(&mut run, "extract", cause)),
            };
            tracing::info!(
                document_id,
                confidence = payload.confidence,
                "structured extraction complete"
            );
            run.pending_payload = Some(payload);
            run.checkpoint = Checkpoint::Extracted;
            self.runs.upsert(&run)?;
        }

        let Some(payload) = run.pending_payload.clone() else {
            return Err(PipelineError::ResumeInconsistent {
                run_id: run.run_id.clone(),
                reason: "extract checkpoint set but no pending payload on run".to_string(),
            });
        };

        // Stage 3: store. Idempotent by construction; retry freely.
        let extraction_id = run.extraction_id.clone();
        if let Err(cause) = execute_with_policy("store", &self.policies.store, || {
            self.store_attempt(&extraction_id, document_id, &payload)
        })
        .await
        {
            return Err(self.fail_run(&mut run, "store", cause));
        }

        run.pending_payload = None;
        run.set_status(RunStatus::Completed, None);
        self.runs.upsert(&run)?;
        tracing::info!(
            document_id,
            extraction_id = run.extraction_id.as_str(),
            "extraction pipeline completed"
        );

        Ok(self.completed_report(&run))
    }

    fn completed_report(&self, run: &PipelineRun) -> PipelineReport {
        PipelineReport {
            status: "completed",
            document_id: run.document_id.clone(),
            extraction_id: run.extraction_id.clone(),
        }
    }

    /// One parse attempt: fetch bytes, extract text off the async runtime,
    /// record the outcome on the document row.
    async fn parse_attempt(&self, document_id: &str) -> Result<ParseOutcome, StageError> {
        let key = format!("{document_id}.pdf");
        let (bytes, _meta) = self
            .blob
            .get(&self.uploads_bucket, &key)
            .await
            .map_err(|err| StageError::Transient(err.to_string()))?;

        if self
            .records
            .get_document(document_id)
            .map_err(|err| StageError::Transient(err.to_string()))?
            .is_none()
        {
            return Err(StageError::Terminal(format!(
                "document `{document_id}` not found"
            )));
        }

        let extractor = Arc::clone(&self.text_extractor);
        let outcome = tokio::task::spawn_blocking(move || extractor.extract(&bytes))
            .await
            .map_err(|err| StageError::Transient(format!("parse task join failed: {err}")))?;

        match outcome {
            Ok(parsed) => {
                self.records
                    .set_document_parsed(document_id, &parsed.text, parsed.page_count as u32)
                    .map_err(|err| match err {
                        RecordStoreError::InvalidTransition { .. } => {
                            StageError::Terminal(err.to_string())
                        }
                        other => StageError::Transient(other.to_string()),
                    })?;
                Ok(parsed)
            }
            Err(err @ PdfExtractError::Invalid(_)) => {
                // Record the terminal cause before surfacing it.
                let cause = err.to_string();
                if let Err(update_err) = self.records.set_document_status(
                    document_id,
                    DocumentStatus::Failed,
                    Some(cause.clone()),
                ) {
                    tracing::warn!(
                        document_id,
                        error = %update_err,
                        "unable to persist failed document state"
                    );
                }
                tracing::warn!(document_id, cause = cause.as_str(), "document rejected");
                Err(StageError::Terminal(cause))
            }
            Err(err) => Err(StageError::Transient(err.to_string())),
        }
    }

    async fn extract_attempt(&self, text: &str) -> Result<ClauseExtraction, StageError> {
        // Every ExtractError is stage-terminal here: the client has already
        // classified and retried what was worth retrying.
        self.clause_extractor
            .extract(text)
            .await
            .map_err(|err| StageError::Terminal(err.to_string()))
    }

    async fn store_attempt(
        &self,
        extraction_id: &str,
        document_id: &str,
        payload: &ClauseExtraction,
    ) -> Result<(), StageError> {
        self.result_store
            .store(extraction_id, document_id, payload)
            .await
            .map_err(|err| StageError::Transient(err.to_string()))
    }

    /// Record a terminal failure on the run and the document, then surface it.
    fn fail_run(&self, run: &mut PipelineRun, stage: &'static str, cause: String) -> PipelineError {
        tracing::warn!(
            document_id = run.document_id.as_str(),
            stage,
            cause = cause.as_str(),
            "pipeline run failed"
        );

        run.last_error = run.error.take();
        run.set_status(RunStatus::Failed, Some(cause.clone()));
        if let Err(err) = self.runs.upsert(run) {
            tracing::warn!(
                run_id = run.run_id.as_str(),
                error = %err,
                "unable to persist failed run state"
            );
        }

        match self.records.set_document_status(
            &run.document_id,
            DocumentStatus::Failed,
            Some(cause.clone()),
        ) {
            Ok(_) => {}
            Err(RecordStoreError::DocumentNotFound(_)) => {
                tracing::warn!(
                    document_id = run.document_id.as_str(),
                    "document row missing while recording failure"
                );
            }
            Err(err) => {
                tracing::warn!(
                    document_id = run.document_id.as_str(),
                    error = %err,
                    "unable to persist failed document state"
                );
            }
        }

        PipelineError::StageFailed { stage, cause }
    }
}

/// Run one stage under its policy: each attempt is time-bounded, transient
/// failures back off with the shared schedule, terminal failures abort.
async fn execute_with_policy<T, F, Fut>(
    stage: &'static str,
    policy: &StagePolicy,
    mut attempt_fn: F,
) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    debug_assert!(policy.max_attempts > 0);

    let mut attempt: u32 = 0;
    loop {
        let outcome = match tokio::time::timeout(policy.timeout, attempt_fn()).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Transient(format!(
                "{stage} stage attempt timed out after {}s",
                policy.timeout.as_secs()
            ))),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(StageError::Terminal(cause)) => return Err(cause),
            Err(StageError::Transient(cause)) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(cause);
                }
                let delay = backoff_duration(attempt - 1, policy.base_delay_ms, policy.max_delay_ms);
                tracing::warn!(
                    stage,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    cause = cause.as_str(),
                    "stage attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
