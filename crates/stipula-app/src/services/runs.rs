use std::time::{SystemTime, UNIX_EPOCH};

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::paths::{AppPaths, PathError};
use crate::pipeline::ClauseExtraction;

const RUN_ENV_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB
const DEFAULT_MAX_RETRIES: u32 = 3;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Lifecycle state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Last stage whose output has been durably recorded. A resumed run starts
/// from the stage after its checkpoint, never from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Checkpoint {
    Queued,
    Parsed,
    Extracted,
}

/// Durable state for one logical pipeline run.
///
/// The `extraction_id` is assigned exactly once, when the run is enqueued,
/// and survives crash-resume untouched: it is the idempotency key the store
/// stage relies on. The extracted payload is parked on the run between the
/// extract and store stages so a resume never re-invokes the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub document_id: String,
    pub extraction_id: String,
    pub status: RunStatus,
    #[serde(default = "PipelineRun::default_checkpoint")]
    pub checkpoint: Checkpoint,
    #[serde(default)]
    pub pending_payload: Option<ClauseExtraction>,
    pub error: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub next_retry_at_ms: Option<i64>,
    #[serde(default)]
    pub stale: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl PipelineRun {
    fn default_checkpoint() -> Checkpoint {
        Checkpoint::Queued
    }

    #[must_use]
    pub fn new(document_id: impl Into<String>) -> Self {
        let document_id = document_id.into();
        debug_assert!(!document_id.is_empty());
        let now_ms = current_timestamp_ms();
        Self {
            run_id: document_id.clone(),
            document_id,
            extraction_id: Uuid::new_v4().to_string(),
            status: RunStatus::Pending,
            checkpoint: Checkpoint::Queued,
            pending_payload: None,
            error: None,
            last_error: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            next_retry_at_ms: None,
            stale: false,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn set_status(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.updated_at_ms = current_timestamp_ms();
    }
}

pub(crate) fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as i64
}

/// Errors emitted by the run store.
#[derive(Debug, Error)]
pub enum RunStoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("run `{0}` already exists")]
    Duplicate(String),
    #[error("run `{0}` not found")]
    NotFound(String),
}

/// LMDB-backed persistence for pipeline runs.
#[derive(Debug)]
pub struct PipelineRunStore {
    env: Env,
    runs: Database<Str, Bytes>,
}

impl PipelineRunStore {
    pub fn open(paths: &AppPaths) -> Result<Self, RunStoreError> {
        let path = paths.runs_lmdb_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(8);
        options.map_size(RUN_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };
        let runs = {
            let mut wtxn = env.write_txn()?;
            let db = env.create_database::<Str, Bytes>(&mut wtxn, Some("runs"))?;
            wtxn.commit()?;
            db
        };
        Ok(Self { env, runs })
    }

    /// Persist a freshly created run. This is the first durable side effect
    /// of a pipeline run: the extraction id is on disk before any stage
    /// executes. Duplicate enqueues are rejected so a document keeps exactly
    /// one logical run.
    pub fn enqueue(&self, run: &PipelineRun) -> Result<(), RunStoreError> {
        debug_assert!(!run.run_id.is_empty());
        debug_assert!(run.status == RunStatus::Pending);

        let mut wtxn = self.env.write_txn()?;
        if self.runs.get(&wtxn, run.run_id.as_str())?.is_some() {
            return Err(RunStoreError::Duplicate(run.run_id.clone()));
        }
        let encoded = encode_to_vec(run, config::standard())?;
        self.runs.put(&mut wtxn, run.run_id.as_str(), &encoded)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get(&self, run_id: &str) -> Result<Option<PipelineRun>, RunStoreError> {
        debug_assert!(!run_id.is_empty());
        let rtxn = self.env.read_txn()?;
        let value = self.runs.get(&rtxn, run_id)?;
        if let Some(raw) = value {
            let (run, _) = decode_from_slice::<PipelineRun, _>(raw, config::standard())?;
            Ok(Some(run))
        } else {
            Ok(None)
        }
    }

    pub fn upsert(&self, run: &PipelineRun) -> Result<(), RunStoreError> {
        debug_assert!(!run.run_id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        let encoded = encode_to_vec(run, config::standard())?;
        self.runs.put(&mut wtxn, run.run_id.as_str(), &encoded)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn update_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<PipelineRun, RunStoreError> {
        debug_assert!(!run_id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        let existing = self.runs.get(&wtxn, run_id)?;
        let Some(raw) = existing else {
            return Err(RunStoreError::NotFound(run_id.to_string()));
        };
        let (mut run, _) = decode_from_slice::<PipelineRun, _>(raw, config::standard())?;
        run.set_status(status, error);
        let encoded = encode_to_vec(&run, config::standard())?;
        self.runs.put(&mut wtxn, run_id, &encoded)?;
        wtxn.commit()?;
        Ok(run)
    }

    /// List runs by status, respecting exponential backoff scheduling.
    ///
    /// Runs whose `next_retry_at_ms` lies in the future are skipped so the
    /// backoff takes effect and recently failed runs are not immediately
    /// re-processed.
    pub fn list_by_status(
        &self,
        status: RunStatus,
        limit: usize,
    ) -> Result<Vec<PipelineRun>, RunStoreError> {
        debug_assert!(limit > 0);
        let now_ms = current_timestamp_ms();
        let rtxn = self.env.read_txn()?;
        let iter = self.runs.iter(&rtxn)?;
        let mut out = Vec::new();
        for entry in iter {
            let (_, raw) = entry?;
            let (run, _) = decode_from_slice::<PipelineRun, _>(raw, config::standard())?;
            if run.status != status {
                continue;
            }
            if let Some(retry_at) = run.next_retry_at_ms
                && retry_at > now_ms
            {
                continue;
            }
            out.push(run);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn count_by_status(&self, status: RunStatus) -> Result<usize, RunStoreError> {
        let rtxn = self.env.read_txn()?;
        let iter = self.runs.iter(&rtxn)?;
        let mut count = 0_usize;
        for entry in iter {
            let (_, raw) = entry?;
            let (run, _) = decode_from_slice::<PipelineRun, _>(raw, config::standard())?;
            if run.status == status {
                count = count.saturating_add(1);
            }
        }
        Ok(count)
    }

    /// List runs with the given status that have not been updated within the
    /// threshold. Used by the reaper to recover runs orphaned by a crash.
    pub fn list_stale_runs(
        &self,
        status: RunStatus,
        age_threshold_ms: i64,
        limit: usize,
    ) -> Result<Vec<PipelineRun>, RunStoreError> {
        debug_assert!(limit > 0);
        debug_assert!(age_threshold_ms > 0);
        let now_ms = current_timestamp_ms();
        let cutoff_ms = now_ms.saturating_sub(age_threshold_ms);

        let rtxn = self.env.read_txn()?;
        let iter = self.runs.iter(&rtxn)?;
        let mut out = Vec::new();
        for entry in iter {
            let (_, raw) = entry?;
            let (run, _) = decode_from_slice::<PipelineRun, _>(raw, config::standard())?;
            if run.status == status && run.updated_at_ms <= cutoff_ms {
                if let Some(retry_at) = run.next_retry_at_ms
                    && retry_at > now_ms
                {
                    continue;
                }
                out.push(run);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }
}
