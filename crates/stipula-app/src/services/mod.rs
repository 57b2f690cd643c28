//! Orchestration layer for IO-bound pipeline services.
//!
//! Modules exposed here coordinate external systems (storage, the structured
//! model, the run queue) and must avoid embedding pure transforms. Keep
//! stateless helpers in `crate::pdf` or `crate::pipeline` so concurrency and
//! resource accounting stay localized.

pub mod blob_store;
pub mod llm;
pub mod orchestrator;
pub mod persist;
pub mod provider;
pub mod reaper;
pub mod records;
pub mod retry;
pub mod runs;
pub mod worker;

pub use blob_store::{BlobError, BlobMeta, BlobStore, FsBlobStore, Locator};
pub use llm::{
    ApiError, ChatChoice, ChatCompletions, ChatRequest, ChatResponse, ChatResponseMessage,
    ClauseExtractionEngine, ClauseExtractor, ExtractError, GenericRateLimiter,
    HttpChatCompletions, build_extractor, truncate_text,
};
pub use orchestrator::{
    PipelineError, PipelineOrchestrator, PipelinePolicies, PipelineReport, StagePolicy,
};
pub use persist::{ResultStore, StoreError};
pub use provider::DefaultExtractionProvider;
pub use reaper::{ReaperAction, ReaperConfig, ReaperError, ReaperReport, reap_stale_runs};
pub use records::{
    DocumentRecord, DocumentStatus, ExtractionRecord, RecordStore, RecordStoreError,
};
pub use retry::{backoff_duration, calculate_retry_backoff};
pub use runs::{Checkpoint, PipelineRun, PipelineRunStore, RunStatus, RunStoreError};
pub use worker::{Worker, WorkerError};
