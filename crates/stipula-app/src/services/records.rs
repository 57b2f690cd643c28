//! LMDB-backed persistence for document and extraction rows.
//!
//! Three databases: `documents` (id → row), `extractions` (id → row), and
//! `extractions_by_doc`, a `{document_id}/{created_at_ms:020}/{extraction_id}`
//! secondary index standing in for a relational composite index so
//! latest-extraction lookups never scan unrelated documents.

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use thiserror::Error;

use crate::paths::{AppPaths, PathError};
use crate::pipeline::ClauseExtraction;
use crate::services::runs::current_timestamp_ms;

const RECORD_ENV_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB

/// Lifecycle state of a document. Transitions are monotonic: once a document
/// leaves `Pending` it can never return, and `Completed`/`Failed` are final.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    /// Re-asserting the current status is allowed so retried stages can
    /// refresh error messages without special cases.
    pub fn can_transition(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Pending, Processing) | (Pending, Completed) | (Pending, Failed) => true,
            (Processing, Completed) | (Processing, Failed) => true,
            _ => false,
        }
    }
}

/// One uploaded document and its pipeline-visible state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub filename: String,
    pub content_type: String,
    pub file_size: u64,
    #[serde(default)]
    pub page_count: Option<u32>,
    #[serde(default)]
    pub raw_text: Option<String>,
    pub status: DocumentStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    pub bucket: String,
    pub object_key: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl DocumentRecord {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        file_size: u64,
        bucket: impl Into<String>,
        object_key: impl Into<String>,
    ) -> Self {
        let id = id.into();
        debug_assert!(!id.is_empty());
        let now_ms = current_timestamp_ms();
        Self {
            id,
            filename: filename.into(),
            content_type: content_type.into(),
            file_size,
            page_count: None,
            raw_text: None,
            status: DocumentStatus::Pending,
            error_message: None,
            bucket: bucket.into(),
            object_key: object_key.into(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }
}

/// One persisted extraction result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub id: String,
    pub document_id: String,
    pub model_used: String,
    pub payload: ClauseExtraction,
    pub confidence: f64,
    pub artifact_bucket: String,
    pub artifact_key: String,
    pub created_at_ms: i64,
}

/// Errors emitted by the record store.
#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("document `{0}` already exists")]
    DuplicateDocument(String),
    #[error("extraction `{0}` already exists")]
    DuplicateExtraction(String),
    #[error("document `{0}` not found")]
    DocumentNotFound(String),
    #[error("illegal document status transition for `{id}`: {from:?} -> {to:?}")]
    InvalidTransition {
        id: String,
        from: DocumentStatus,
        to: DocumentStatus,
    },
}

/// LMDB-backed record store for documents and extractions.
#[derive(Debug)]
pub struct RecordStore {
    env: Env,
    documents: Database<Str, Bytes>,
    extractions: Database<Str, Bytes>,
    extractions_by_doc: Database<Str, Str>,
}

impl RecordStore {
    pub fn open(paths: &AppPaths) -> Result<Self, RecordStoreError> {
        let path = paths.records_lmdb_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(8);
        options.map_size(RECORD_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };

        let mut wtxn = env.write_txn()?;
        let documents = env.create_database::<Str, Bytes>(&mut wtxn, Some("documents"))?;
        let extractions = env.create_database::<Str, Bytes>(&mut wtxn, Some("extractions"))?;
        let extractions_by_doc =
            env.create_database::<Str, Str>(&mut wtxn, Some("extractions_by_doc"))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            documents,
            extractions,
            extractions_by_doc,
        })
    }

    pub fn insert_document(&self, doc: &DocumentRecord) -> Result<(), RecordStoreError> {
        debug_assert!(!doc.id.is_empty());

        let mut wtxn = self.env.write_txn()?;
        if self.documents.get(&wtxn, doc.id.as_str())?.is_some() {
            return Err(RecordStoreError::DuplicateDocument(doc.id.clone()));
        }
        let encoded = encode_to_vec(doc, config::standard())?;
        self.documents.put(&mut wtxn, doc.id.as_str(), &encoded)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>, RecordStoreError> {
        debug_assert!(!id.is_empty());
        let rtxn = self.env.read_txn()?;
        let value = self.documents.get(&rtxn, id)?;
        if let Some(raw) = value {
            let (doc, _) = decode_from_slice::<DocumentRecord, _>(raw, config::standard())?;
            Ok(Some(doc))
        } else {
            Ok(None)
        }
    }

    /// Update a document's lifecycle status, enforcing monotonic transitions.
    pub fn set_document_status(
        &self,
        id: &str,
        status: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<DocumentRecord, RecordStoreError> {
        self.update_document(id, |doc| {
            if !doc.status.can_transition(status) {
                return Err(RecordStoreError::InvalidTransition {
                    id: doc.id.clone(),
                    from: doc.status,
                    to: status,
                });
            }
            doc.status = status;
            doc.error_message = error_message;
            Ok(())
        })
    }

    /// Record a successful parse: extracted text, page count, and the move to
    /// `Processing`. Clears any prior error cause.
    pub fn set_document_parsed(
        &self,
        id: &str,
        raw_text: &str,
        page_count: u32,
    ) -> Result<DocumentRecord, RecordStoreError> {
        self.update_document(id, |doc| {
            if !doc.status.can_transition(DocumentStatus::Processing) {
                return Err(RecordStoreError::InvalidTransition {
                    id: doc.id.clone(),
                    from: doc.status,
                    to: DocumentStatus::Processing,
                });
            }
            doc.raw_text = Some(raw_text.to_owned());
            doc.page_count = Some(page_count);
            doc.status = DocumentStatus::Processing;
            doc.error_message = None;
            Ok(())
        })
    }

    fn update_document<F>(&self, id: &str, apply: F) -> Result<DocumentRecord, RecordStoreError>
    where
        F: FnOnce(&mut DocumentRecord) -> Result<(), RecordStoreError>,
    {
        debug_assert!(!id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        let existing = self.documents.get(&wtxn, id)?;
        let Some(raw) = existing else {
            return Err(RecordStoreError::DocumentNotFound(id.to_string()));
        };
        let (mut doc, _) = decode_from_slice::<DocumentRecord, _>(raw, config::standard())?;
        apply(&mut doc)?;
        doc.updated_at_ms = current_timestamp_ms();
        let encoded = encode_to_vec(&doc, config::standard())?;
        self.documents.put(&mut wtxn, id, &encoded)?;
        wtxn.commit()?;
        Ok(doc)
    }

    /// Insert an extraction row and its secondary-index entry. A duplicate id
    /// yields `DuplicateExtraction`; callers retrying an idempotent store
    /// stage downgrade that to success.
    pub fn insert_extraction(&self, ext: &ExtractionRecord) -> Result<(), RecordStoreError> {
        debug_assert!(!ext.id.is_empty());
        debug_assert!(!ext.document_id.is_empty());

        let mut wtxn = self.env.write_txn()?;
        if self.extractions.get(&wtxn, ext.id.as_str())?.is_some() {
            return Err(RecordStoreError::DuplicateExtraction(ext.id.clone()));
        }
        let encoded = encode_to_vec(ext, config::standard())?;
        self.extractions.put(&mut wtxn, ext.id.as_str(), &encoded)?;
        let index_key = composite_key(&ext.document_id, ext.created_at_ms, &ext.id);
        self.extractions_by_doc
            .put(&mut wtxn, index_key.as_str(), ext.id.as_str())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_extraction(&self, id: &str) -> Result<Option<ExtractionRecord>, RecordStoreError> {
        let rtxn = self.env.read_txn()?;
        let value = self.extractions.get(&rtxn, id)?;
        if let Some(raw) = value {
            let (ext, _) = decode_from_slice::<ExtractionRecord, _>(raw, config::standard())?;
            Ok(Some(ext))
        } else {
            Ok(None)
        }
    }

    /// Latest extraction for a document via the composite index. Keys sort
    /// ascending by zero-padded timestamp, so the last prefix match wins.
    pub fn latest_extraction(
        &self,
        document_id: &str,
    ) -> Result<Option<ExtractionRecord>, RecordStoreError> {
        debug_assert!(!document_id.is_empty());
        let rtxn = self.env.read_txn()?;
        let prefix = format!("{document_id}/");
        let mut latest_id: Option<String> = None;
        for entry in self.extractions_by_doc.prefix_iter(&rtxn, &prefix)? {
            let (_, id) = entry?;
            latest_id = Some(id.to_string());
        }
        drop(rtxn);

        match latest_id {
            Some(id) => self.get_extraction(&id),
            None => Ok(None),
        }
    }

    /// All extractions, newest first, paginated. `page` is one-based.
    pub fn list_extractions(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<ExtractionRecord>, usize), RecordStoreError> {
        debug_assert!(page >= 1);
        debug_assert!(page_size >= 1);

        let rtxn = self.env.read_txn()?;
        let mut all = Vec::new();
        for entry in self.extractions.iter(&rtxn)? {
            let (_, raw) = entry?;
            let (ext, _) = decode_from_slice::<ExtractionRecord, _>(raw, config::standard())?;
            all.push(ext);
        }
        drop(rtxn);

        let total = all.len();
        all.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| b.id.cmp(&a.id))
        });

        let offset = page.saturating_sub(1).saturating_mul(page_size);
        let items = all.into_iter().skip(offset).take(page_size).collect();
        Ok((items, total))
    }
}

fn composite_key(document_id: &str, created_at_ms: i64, extraction_id: &str) -> String {
    format!("{document_id}/{:020}/{extraction_id}", created_at_ms.max(0))
}
