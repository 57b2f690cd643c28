//! Idempotent persistence of extraction results.
//!
//! The artifact write is overwrite-safe (same document, same key) and the
//! record insert is keyed by the run's stable extraction id, so the whole
//! stage can be retried any number of times. A duplicate-key insert from a
//! retried call is the one error deliberately converted to success: the
//! payload for a given extraction id is identical by construction.

use std::sync::Arc;

use thiserror::Error;

use crate::pipeline::ClauseExtraction;
use crate::services::blob_store::{BlobError, BlobStore};
use crate::services::records::{
    DocumentStatus, ExtractionRecord, RecordStore, RecordStoreError,
};
use crate::services::runs::current_timestamp_ms;

/// Errors emitted by the store stage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Records(#[from] RecordStoreError),
    #[error("failed to serialize extraction payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Persists structured results to the blob store and the record store.
#[derive(Clone, bon::Builder)]
pub struct ResultStore {
    blob: Arc<dyn BlobStore>,
    records: Arc<RecordStore>,
    #[builder(into)]
    artifact_bucket: String,
    #[builder(into)]
    model_name: String,
}

impl ResultStore {
    /// Store one extraction result. Safe to call repeatedly with the same
    /// `(extraction_id, document_id, payload)` triple.
    pub async fn store(
        &self,
        extraction_id: &str,
        document_id: &str,
        payload: &ClauseExtraction,
    ) -> Result<(), StoreError> {
        debug_assert!(!extraction_id.is_empty());
        debug_assert!(!document_id.is_empty());

        let artifact_key = format!("{document_id}.json");
        let json_bytes = serde_json::to_vec_pretty(payload)?;

        self.blob
            .put(
                &self.artifact_bucket,
                &artifact_key,
                json_bytes.into(),
                "application/json",
            )
            .await?;
        tracing::info!(
            bucket = self.artifact_bucket.as_str(),
            key = artifact_key.as_str(),
            "stored extraction artifact"
        );

        let record = ExtractionRecord {
            id: extraction_id.to_string(),
            document_id: document_id.to_string(),
            model_used: self.model_name.clone(),
            payload: payload.clone(),
            confidence: payload.confidence,
            artifact_bucket: self.artifact_bucket.clone(),
            artifact_key,
            created_at_ms: current_timestamp_ms(),
        };

        match self.records.insert_extraction(&record) {
            Ok(()) => {
                tracing::info!(extraction_id, document_id, "created extraction record");
            }
            Err(RecordStoreError::DuplicateExtraction(_)) => {
                // Retried call; the earlier insert already won.
                tracing::info!(
                    extraction_id,
                    "extraction already exists (idempotent retry), skipping insert"
                );
            }
            Err(err) => return Err(err.into()),
        }

        // Best-effort: the result is durable even if the document row is gone.
        match self
            .records
            .set_document_status(document_id, DocumentStatus::Completed, None)
        {
            Ok(_) => {
                tracing::info!(document_id, "document marked as completed");
            }
            Err(RecordStoreError::DocumentNotFound(_)) => {
                tracing::warn!(document_id, "document row missing during completion");
            }
            Err(err) => return Err(err.into()),
        }

        Ok(())
    }
}
