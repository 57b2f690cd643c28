//! Provider contract between the HTTP surface and the application.
//!
//! The server crate stays storage-agnostic: every route delegates to an
//! injected [`ExtractionProvider`] and only shapes requests and responses.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Response for an accepted upload. The document enters the pipeline in
/// `pending` state; results arrive asynchronously via the read endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentAccepted {
    pub document_id: String,
    pub filename: String,
    pub status: String,
}

/// Lifecycle view of one document, including the terminal failure cause when
/// the pipeline gave up on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentView {
    pub document_id: String,
    pub filename: String,
    pub status: String,
    pub page_count: Option<u32>,
    pub error_message: Option<String>,
    pub created_at: String,
}

/// One extraction joined with its source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionView {
    pub extraction_id: String,
    pub document_id: String,
    pub filename: String,
    pub status: String,
    pub model_used: String,
    pub extraction: JsonValue,
    pub created_at: String,
}

/// Newest-first page of extractions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionPage {
    pub items: Vec<ExtractionView>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// Failures surfaced by a provider, mapped onto HTTP statuses by the router.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unsupported content type `{got}`; only application/pdf is accepted")]
    UnsupportedContentType { got: String },
    #[error("file exceeds {max_bytes} byte limit ({size_bytes} bytes)")]
    FileTooLarge { size_bytes: u64, max_bytes: u64 },
    #[error("document `{0}` not found")]
    DocumentNotFound(String),
    #[error("no extraction found for document `{0}`")]
    ExtractionNotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl ProviderError {
    pub fn internal(message: impl Into<String>) -> Self {
        ProviderError::Internal(message.into())
    }
}

/// Application-side behavior behind the HTTP surface.
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    /// Accept an uploaded document, persist it, and enqueue a pipeline run.
    async fn submit_document(
        &self,
        filename: String,
        content_type: String,
        bytes: Bytes,
    ) -> Result<DocumentAccepted, ProviderError>;

    /// Lifecycle status of the given document.
    async fn document_status(&self, document_id: &str) -> Result<DocumentView, ProviderError>;

    /// Latest extraction for the given document.
    async fn latest_extraction(&self, document_id: &str)
    -> Result<ExtractionView, ProviderError>;

    /// Paginated listing of all extractions, newest first.
    async fn list_extractions(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<ExtractionPage, ProviderError>;
}
