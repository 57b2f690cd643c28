//! Storage-backed implementation of the HTTP surface's provider trait.
//!
//! Upload intake creates the document row, persists the blob under its
//! deterministic key, and enqueues the pipeline run; at that point the
//! run's stable extraction id is already durable. Read queries join
//! extraction rows with their documents.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use uuid::Uuid;

use stipula_server::{
    DocumentAccepted, DocumentView, ExtractionPage, ExtractionProvider, ExtractionView,
    ProviderError,
};

use crate::services::blob_store::BlobStore;
use crate::services::records::{DocumentRecord, ExtractionRecord, RecordStore};
use crate::services::runs::{PipelineRun, PipelineRunStore};

const PDF_CONTENT_TYPE: &str = "application/pdf";

#[derive(Clone, bon::Builder)]
pub struct DefaultExtractionProvider {
    records: Arc<RecordStore>,
    runs: Arc<PipelineRunStore>,
    blob: Arc<dyn BlobStore>,
    #[builder(into)]
    uploads_bucket: String,
    max_file_size_bytes: u64,
}

impl DefaultExtractionProvider {
    fn view_for(&self, ext: &ExtractionRecord, doc: Option<&DocumentRecord>) -> ExtractionView {
        ExtractionView {
            extraction_id: ext.id.clone(),
            document_id: ext.document_id.clone(),
            filename: doc
                .map(|d| d.filename.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            status: doc
                .map(|d| d.status.as_ref().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            model_used: ext.model_used.clone(),
            extraction: serde_json::to_value(&ext.payload).unwrap_or_default(),
            created_at: rfc3339_from_ms(ext.created_at_ms),
        }
    }
}

#[async_trait]
impl ExtractionProvider for DefaultExtractionProvider {
    async fn submit_document(
        &self,
        filename: String,
        content_type: String,
        bytes: Bytes,
    ) -> Result<DocumentAccepted, ProviderError> {
        if content_type != PDF_CONTENT_TYPE {
            return Err(ProviderError::UnsupportedContentType { got: content_type });
        }
        if bytes.len() as u64 > self.max_file_size_bytes {
            return Err(ProviderError::FileTooLarge {
                size_bytes: bytes.len() as u64,
                max_bytes: self.max_file_size_bytes,
            });
        }

        let document_id = Uuid::new_v4().to_string();
        let object_key = format!("{document_id}.pdf");

        let doc = DocumentRecord::new(
            document_id.clone(),
            filename.clone(),
            content_type,
            bytes.len() as u64,
            self.uploads_bucket.clone(),
            object_key.clone(),
        );
        self.records
            .insert_document(&doc)
            .map_err(|err| ProviderError::internal(err.to_string()))?;

        self.blob
            .ensure_bucket(&self.uploads_bucket)
            .await
            .map_err(|err| ProviderError::internal(err.to_string()))?;
        self.blob
            .put(&self.uploads_bucket, &object_key, bytes, PDF_CONTENT_TYPE)
            .await
            .map_err(|err| ProviderError::internal(err.to_string()))?;

        // First durable side effect of the run: the stable extraction id.
        let run = PipelineRun::new(document_id.clone());
        self.runs
            .enqueue(&run)
            .map_err(|err| ProviderError::internal(err.to_string()))?;

        tracing::info!(
            document_id = document_id.as_str(),
            filename = filename.as_str(),
            "document accepted for extraction"
        );

        Ok(DocumentAccepted {
            document_id,
            filename,
            status: "pending".to_string(),
        })
    }

    async fn document_status(&self, document_id: &str) -> Result<DocumentView, ProviderError> {
        let doc = self
            .records
            .get_document(document_id)
            .map_err(|err| ProviderError::internal(err.to_string()))?
            .ok_or_else(|| ProviderError::DocumentNotFound(document_id.to_string()))?;

        Ok(DocumentView {
            document_id: doc.id,
            filename: doc.filename,
            status: doc.status.as_ref().to_string(),
            page_count: doc.page_count,
            error_message: doc.error_message,
            created_at: rfc3339_from_ms(doc.created_at_ms),
        })
    }

    async fn latest_extraction(
        &self,
        document_id: &str,
    ) -> Result<ExtractionView, ProviderError> {
        let doc = self
            .records
            .get_document(document_id)
            .map_err(|err| ProviderError::internal(err.to_string()))?
            .ok_or_else(|| ProviderError::DocumentNotFound(document_id.to_string()))?;

        let ext = self
            .records
            .latest_extraction(document_id)
            .map_err(|err| ProviderError::internal(err.to_string()))?
            .ok_or_else(|| ProviderError::ExtractionNotFound(document_id.to_string()))?;

        Ok(self.view_for(&ext, Some(&doc)))
    }

    async fn list_extractions(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<ExtractionPage, ProviderError> {
        let (items, total) = self
            .records
            .list_extractions(page, page_size)
            .map_err(|err| ProviderError::internal(err.to_string()))?;

        let mut views = Vec::with_capacity(items.len());
        for ext in &items {
            let doc = self
                .records
                .get_document(&ext.document_id)
                .map_err(|err| ProviderError::internal(err.to_string()))?;
            views.push(self.view_for(ext, doc.as_ref()));
        }

        Ok(ExtractionPage {
            items: views,
            total,
            page,
            page_size,
        })
    }
}

fn rfc3339_from_ms(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}
