//! End-to-end pipeline tests over temp-dir-backed stores.
//!
//! The PDF engine and the model transport are replaced with scripted fakes
//! so every retry/resume path is observable: invocation counts, checkpoint
//! reuse, and idempotent storage are asserted directly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;

use stipula_app::paths::AppPaths;
use stipula_app::pdf::{ParseOutcome, PdfExtractError, PdfValidationError, TextExtractor};
use stipula_app::pipeline::{ClauseExtraction, Clauses, ContractDates, Parties};
use stipula_app::services::{
    ApiError, ChatChoice, ChatCompletions, ChatRequest, ChatResponse, ChatResponseMessage,
    ClauseExtractionEngine, ClauseExtractor, DefaultExtractionProvider, ExtractError, FsBlobStore,
    PipelineOrchestrator, PipelinePolicies, PipelineRunStore, RecordStore, ResultStore, RunStatus,
    StagePolicy, Worker,
};
use stipula_app::services::records::DocumentStatus;
use stipula_app::services::runs::Checkpoint;
use stipula_server::ExtractionProvider;

fn payload() -> ClauseExtraction {
    ClauseExtraction {
        parties: Parties {
            party_one: Some("Acme Corporation".to_string()),
            party_two: Some("Widget Industries Ltd".to_string()),
            additional_parties: vec![],
        },
        dates: ContractDates {
            effective_date: Some("2024-03-01".to_string()),
            termination_date: None,
            term_length: Some("3 years".to_string()),
        },
        clauses: Clauses {
            governing_law: Some("State of Delaware".to_string()),
            payment_terms: Some("Net 30 from invoice date.".to_string()),
            ..Clauses::default()
        },
        confidence: 0.87,
        summary: Some("Supply agreement between Acme and Widget.".to_string()),
    }
}

fn three_page_outcome() -> ParseOutcome {
    ParseOutcome {
        text: "Page one.\n\nPage two.\n\nPage three.".to_string(),
        page_count: 3,
    }
}

/// Text extractor replaying a fixed script of outcomes.
struct ScriptedParser {
    script: Mutex<Vec<Result<ParseOutcome, PdfExtractError>>>,
    calls: AtomicUsize,
}

impl ScriptedParser {
    fn new(script: Vec<Result<ParseOutcome, PdfExtractError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        })
    }

    fn always_ok() -> Arc<Self> {
        Self::new(vec![Ok(three_page_outcome())])
    }
}

impl TextExtractor for ScriptedParser {
    fn extract(&self, _bytes: &[u8]) -> Result<ParseOutcome, PdfExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().expect("parser script poisoned");
        if script.len() > 1 {
            script.remove(0)
        } else {
            match script.first().expect("parser script empty") {
                Ok(outcome) => Ok(outcome.clone()),
                Err(PdfExtractError::Invalid(_)) => {
                    Err(PdfValidationError::MissingHeader.into())
                }
                Err(PdfExtractError::Parse(msg)) => Err(PdfExtractError::Parse(msg.clone())),
            }
        }
    }
}

/// Clause extractor returning a fixed payload and counting invocations.
struct CountingExtractor {
    calls: AtomicUsize,
}

impl CountingExtractor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ClauseExtractor for CountingExtractor {
    async fn extract(&self, _text: &str) -> Result<ClauseExtraction, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(payload())
    }
}

/// Stand-ins that fail loudly when a resumed run re-executes a skipped stage.
struct PanickingParser;

impl TextExtractor for PanickingParser {
    fn extract(&self, _bytes: &[u8]) -> Result<ParseOutcome, PdfExtractError> {
        panic!("parse stage must not run after its checkpoint");
    }
}

struct PanickingExtractor;

#[async_trait]
impl ClauseExtractor for PanickingExtractor {
    async fn extract(&self, _text: &str) -> Result<ClauseExtraction, ExtractError> {
        panic!("extract stage must not run after its checkpoint");
    }
}

/// Chat transport replaying scripted outcomes, shared-state clone.
#[derive(Clone)]
struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Result<ChatResponse, ApiError>>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    fn new(script: Vec<Result<ChatResponse, ApiError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatCompletions for ScriptedTransport {
    async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .expect("transport script poisoned")
            .pop_front()
            .expect("transport script exhausted")
    }
}

fn valid_model_response() -> ChatResponse {
    ChatResponse {
        choices: vec![ChatChoice {
            message: ChatResponseMessage {
                content: Some(serde_json::to_string(&payload()).expect("serialize payload")),
            },
        }],
    }
}

struct Harness {
    _temp: TempDir,
    records: Arc<RecordStore>,
    runs: Arc<PipelineRunStore>,
    blob: Arc<FsBlobStore>,
    provider: DefaultExtractionProvider,
}

fn harness() -> Harness {
    let temp = TempDir::new().expect("temp dir");
    let paths = AppPaths::new(temp.path()).expect("app paths");
    let records = Arc::new(RecordStore::open(&paths).expect("open records"));
    let runs = Arc::new(PipelineRunStore::open(&paths).expect("open runs"));
    let blob = Arc::new(FsBlobStore::builder().paths(paths).build());
    let provider = DefaultExtractionProvider::builder()
        .records(Arc::clone(&records))
        .runs(Arc::clone(&runs))
        .blob(Arc::clone(&blob) as Arc<dyn stipula_app::services::BlobStore>)
        .uploads_bucket("uploads")
        .max_file_size_bytes(1024 * 1024)
        .build();
    Harness {
        _temp: temp,
        records,
        runs,
        blob,
        provider,
    }
}

fn fast_policies() -> PipelinePolicies {
    PipelinePolicies {
        parse: StagePolicy::builder()
            .max_attempts(2)
            .timeout(Duration::from_secs(5))
            .base_delay_ms(1)
            .max_delay_ms(2)
            .build(),
        extract: StagePolicy::builder()
            .max_attempts(1)
            .timeout(Duration::from_secs(5))
            .build(),
        store: StagePolicy::builder()
            .max_attempts(3)
            .timeout(Duration::from_secs(5))
            .base_delay_ms(1)
            .max_delay_ms(2)
            .build(),
    }
}

fn orchestrator_with(
    h: &Harness,
    parser: Arc<dyn TextExtractor>,
    clauses: Arc<dyn ClauseExtractor>,
) -> PipelineOrchestrator {
    let result_store = ResultStore::builder()
        .blob(Arc::clone(&h.blob) as Arc<dyn stipula_app::services::BlobStore>)
        .records(Arc::clone(&h.records))
        .artifact_bucket("extractions")
        .model_name("test-model")
        .build();

    PipelineOrchestrator::builder()
        .text_extractor(parser)
        .clause_extractor(clauses)
        .result_store(result_store)
        .blob(Arc::clone(&h.blob) as Arc<dyn stipula_app::services::BlobStore>)
        .records(Arc::clone(&h.records))
        .runs(Arc::clone(&h.runs))
        .uploads_bucket("uploads")
        .policies(fast_policies())
        .build()
}

async fn submit_sample(h: &Harness) -> String {
    h.provider
        .submit_document(
            "contract.pdf".to_string(),
            "application/pdf".to_string(),
            Bytes::from_static(b"%PDF-1.7 three pages of text"),
        )
        .await
        .expect("submission accepted")
        .document_id
}

#[tokio::test]
async fn end_to_end_pipeline_reaches_completed() {
    let h = harness();
    let document_id = submit_sample(&h).await;

    let parser = ScriptedParser::always_ok();
    let clauses = CountingExtractor::new();
    let orchestrator = orchestrator_with(&h, parser.clone(), clauses.clone());

    let report = orchestrator.run(&document_id).await.expect("run completes");
    assert_eq!(report.status, "completed");
    assert_eq!(report.document_id, document_id);

    let doc = h
        .records
        .get_document(&document_id)
        .expect("fetch")
        .expect("document exists");
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.page_count, Some(3));
    assert!(doc.error_message.is_none());

    let view = h
        .provider
        .latest_extraction(&document_id)
        .await
        .expect("extraction readable");
    assert_eq!(view.extraction_id, report.extraction_id);
    let confidence = view.extraction["confidence"]
        .as_f64()
        .expect("confidence present");
    assert!((0.0..=1.0).contains(&confidence));

    // The artifact landed at its deterministic key.
    use stipula_app::services::BlobStore;
    let artifact = h
        .blob
        .head("extractions", &format!("{document_id}.json"))
        .await
        .expect("head succeeds")
        .expect("artifact exists");
    assert!(artifact.size_bytes > 0);
}

#[tokio::test]
async fn invalid_document_never_reaches_the_extraction_stage() {
    let h = harness();
    let document_id = submit_sample(&h).await;

    let parser = ScriptedParser::new(vec![Err(PdfValidationError::MissingHeader.into())]);
    let clauses = CountingExtractor::new();
    let orchestrator = orchestrator_with(&h, parser.clone(), clauses.clone());

    let err = orchestrator
        .run(&document_id)
        .await
        .expect_err("invalid input fails the run");
    assert!(err.to_string().contains("missing PDF header"));

    assert_eq!(parser.calls.load(Ordering::SeqCst), 1, "no parse retry");
    assert_eq!(
        clauses.calls.load(Ordering::SeqCst),
        0,
        "extraction stage must never run"
    );

    let doc = h
        .records
        .get_document(&document_id)
        .expect("fetch")
        .expect("document exists");
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert_eq!(
        doc.error_message.as_deref(),
        Some("unsupported content: missing PDF header"),
        "cause is surfaced verbatim"
    );

    let run = h.runs.get(&document_id).expect("fetch run").expect("run");
    assert_eq!(run.status, RunStatus::Failed);

    // The cause is readable through the document-status API.
    let status = h
        .provider
        .document_status(&document_id)
        .await
        .expect("status readable");
    assert_eq!(status.status, "failed");
    assert_eq!(
        status.error_message.as_deref(),
        Some("unsupported content: missing PDF header")
    );
}

#[tokio::test]
async fn transient_parse_failure_retries_within_budget() {
    let h = harness();
    let document_id = submit_sample(&h).await;

    let parser = ScriptedParser::new(vec![
        Err(PdfExtractError::Parse("broken xref".to_string())),
        Ok(three_page_outcome()),
    ]);
    let clauses = CountingExtractor::new();
    let orchestrator = orchestrator_with(&h, parser.clone(), clauses.clone());

    let report = orchestrator
        .run(&document_id)
        .await
        .expect("second parse attempt succeeds");
    assert_eq!(report.status, "completed");
    assert_eq!(parser.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn rate_limits_then_success_invokes_model_exactly_three_times() {
    let h = harness();
    let document_id = submit_sample(&h).await;

    let transport = ScriptedTransport::new(vec![
        Err(ApiError::RateLimited("429".to_string())),
        Err(ApiError::RateLimited("429".to_string())),
        Ok(valid_model_response()),
    ]);
    let engine = ClauseExtractionEngine::builder()
        .transport(transport.clone())
        .model("test-model")
        .max_attempts(3)
        .base_delay_ms(1)
        .max_delay_ms(2)
        .build();

    let orchestrator = orchestrator_with(&h, ScriptedParser::always_ok(), Arc::new(engine));
    let report = orchestrator.run(&document_id).await.expect("run completes");
    assert_eq!(report.status, "completed");
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test]
async fn auth_failure_invokes_model_once_and_fails_terminally() {
    let h = harness();
    let document_id = submit_sample(&h).await;

    let transport =
        ScriptedTransport::new(vec![Err(ApiError::Auth("invalid api key".to_string()))]);
    let engine = ClauseExtractionEngine::builder()
        .transport(transport.clone())
        .model("test-model")
        .max_attempts(3)
        .base_delay_ms(1)
        .max_delay_ms(2)
        .build();

    let orchestrator = orchestrator_with(&h, ScriptedParser::always_ok(), Arc::new(engine));
    let err = orchestrator
        .run(&document_id)
        .await
        .expect_err("terminal model failure fails the run");
    assert!(err.to_string().contains("non-retryable API error"));
    assert_eq!(transport.call_count(), 1);

    let doc = h
        .records
        .get_document(&document_id)
        .expect("fetch")
        .expect("document exists");
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert!(
        doc.error_message
            .as_deref()
            .expect("cause recorded")
            .contains("non-retryable API error")
    );
}

#[tokio::test]
async fn resumed_run_reuses_extraction_id_without_reexecuting_stages() {
    let h = harness();
    let document_id = submit_sample(&h).await;

    // Drive to the post-extract checkpoint the way a real run would, then
    // simulate a crash before the store stage committed.
    h.records
        .set_document_parsed(&document_id, "Page one.", 1)
        .expect("record parse outcome");
    let mut run = h
        .runs
        .get(&document_id)
        .expect("fetch run")
        .expect("run enqueued at submit");
    let pre_crash_extraction_id = run.extraction_id.clone();
    run.checkpoint = Checkpoint::Extracted;
    run.pending_payload = Some(payload());
    h.runs.upsert(&run).expect("persist checkpoint");

    let orchestrator =
        orchestrator_with(&h, Arc::new(PanickingParser), Arc::new(PanickingExtractor));
    let report = orchestrator
        .run(&document_id)
        .await
        .expect("resume completes");

    assert_eq!(report.extraction_id, pre_crash_extraction_id);
    let stored = h
        .records
        .get_extraction(&pre_crash_extraction_id)
        .expect("fetch")
        .expect("extraction stored under the pre-crash id");
    assert_eq!(stored.document_id, document_id);
}

#[tokio::test]
async fn retried_store_stage_leaves_exactly_one_extraction_row() {
    let h = harness();
    let document_id = submit_sample(&h).await;

    let orchestrator = orchestrator_with(&h, ScriptedParser::always_ok(), CountingExtractor::new());
    let report = orchestrator.run(&document_id).await.expect("first run");

    // Re-run the store stage as a resumed run would after losing the
    // completion write.
    let mut run = h.runs.get(&document_id).expect("fetch").expect("run");
    run.status = RunStatus::Pending;
    run.checkpoint = Checkpoint::Extracted;
    run.pending_payload = Some(payload());
    h.runs.upsert(&run).expect("rewind run");

    let orchestrator =
        orchestrator_with(&h, Arc::new(PanickingParser), Arc::new(PanickingExtractor));
    let replay = orchestrator.run(&document_id).await.expect("replay succeeds");
    assert_eq!(replay.extraction_id, report.extraction_id);

    let (items, total) = h.records.list_extractions(1, 10).expect("list");
    assert_eq!(total, 1, "duplicate insert must be swallowed");
    assert_eq!(items[0].id, report.extraction_id);
}

#[tokio::test]
async fn worker_tick_processes_all_pending_runs() {
    let h = harness();
    let first = submit_sample(&h).await;
    let second = submit_sample(&h).await;

    let orchestrator = Arc::new(orchestrator_with(
        &h,
        ScriptedParser::always_ok(),
        CountingExtractor::new(),
    ));
    let worker = Worker::builder()
        .orchestrator(orchestrator)
        .runs(Arc::clone(&h.runs))
        .records(Arc::clone(&h.records))
        .concurrency(2)
        .build();

    let processed = worker.tick().await.expect("tick succeeds");
    assert_eq!(processed, 2);

    for document_id in [first, second] {
        let run = h.runs.get(&document_id).expect("fetch").expect("run");
        assert_eq!(run.status, RunStatus::Completed);
        let doc = h
            .records
            .get_document(&document_id)
            .expect("fetch")
            .expect("document");
        assert_eq!(doc.status, DocumentStatus::Completed);
    }
}
