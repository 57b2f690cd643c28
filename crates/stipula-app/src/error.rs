//! Application-level error type shared across binaries and services.

use std::path::PathBuf;

use thiserror::Error;

use crate::config;
use crate::paths::PathError;
use crate::pdf::PdfExtractError;
use crate::services::{
    BlobError, ExtractError, PipelineError, ReaperError, RecordStoreError, RunStoreError,
    StoreError, WorkerError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Server(#[from] stipula_server::ServerError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Pdf(#[from] PdfExtractError),
    #[error(transparent)]
    BlobStore(#[from] BlobError),
    #[error(transparent)]
    Records(#[from] RecordStoreError),
    #[error(transparent)]
    Runs(#[from] RunStoreError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Reaper(#[from] ReaperError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
