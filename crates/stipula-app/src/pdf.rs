//! PDF validation and text extraction.
//!
//! Pure over bytes: callers fetch the document from blob storage and persist
//! the outcome themselves. Failures are split into a terminal validation
//! class and a retryable parse class so the orchestrator can decide what to
//! retry.

use std::env;
use std::path::{Path, PathBuf};

use bon::Builder;
use pdfium_render::prelude::{Pdfium, PdfiumError};
use thiserror::Error;

/// Result of a successful text extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOutcome {
    pub text: String,
    pub page_count: usize,
}

/// Pre-parse validation failures. Terminal: retrying the same bytes can
/// never succeed.
#[derive(Debug, Error)]
pub enum PdfValidationError {
    #[error("unsupported content: missing PDF header")]
    MissingHeader,
    #[error("file too large: {size_bytes} bytes > {max_bytes} bytes")]
    TooLarge { size_bytes: u64, max_bytes: u64 },
    #[error("too many pages: {pages} > {max_pages}")]
    TooManyPages { pages: usize, max_pages: usize },
    #[error("no text content: PDF may be scanned/image-only (OCR not supported)")]
    NoExtractableText,
}

/// Errors emitted while extracting text from PDF documents.
#[derive(Debug, Error)]
pub enum PdfExtractError {
    #[error(transparent)]
    Invalid(#[from] PdfValidationError),

    #[error("failed to parse PDF document: {0}")]
    Parse(String),
}

impl PdfExtractError {
    /// Terminal failures are never retried by the orchestrator.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PdfExtractError::Invalid(_))
    }
}

/// Extracts plain text and a page count from document bytes.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Result<ParseOutcome, PdfExtractError>;
}

/// Pdfium-backed extractor with configurable validation limits.
#[derive(Debug, Clone, Builder)]
pub struct PdfExtractor {
    #[builder(default = 25 * 1024 * 1024)]
    pub max_size_bytes: u64,
    #[builder(default = 100)]
    pub max_pages: usize,
}

impl TextExtractor for PdfExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<ParseOutcome, PdfExtractError> {
        extract_text_and_pages(bytes, self.max_size_bytes, self.max_pages)
    }
}

/// Validate and extract, cheapest checks first: header, size, open, page
/// count, per-page text. Pages are joined with a blank line and the whole
/// result is trimmed.
pub fn extract_text_and_pages(
    bytes: &[u8],
    max_size_bytes: u64,
    max_pages: usize,
) -> Result<ParseOutcome, PdfExtractError> {
    debug_assert!(max_pages > 0);

    if !bytes.starts_with(b"%PDF") {
        return Err(PdfValidationError::MissingHeader.into());
    }

    if bytes.len() as u64 > max_size_bytes {
        return Err(PdfValidationError::TooLarge {
            size_bytes: bytes.len() as u64,
            max_bytes: max_size_bytes,
        }
        .into());
    }

    let pdfium = load_pdfium().map_err(|err| PdfExtractError::Parse(err.to_string()))?;
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|err| PdfExtractError::Parse(err.to_string()))?;

    let page_count = document.pages().len() as usize;
    if page_count > max_pages {
        return Err(PdfValidationError::TooManyPages {
            pages: page_count,
            max_pages,
        }
        .into());
    }

    let mut pages_text = Vec::with_capacity(page_count);
    let mut has_any_text = false;

    for (page_index, page) in document.pages().iter().enumerate() {
        let text = page
            .text()
            .map_err(|err| PdfExtractError::Parse(format!("page {page_index}: {err}")))?
            .all();
        let stripped = text.trim().to_owned();
        if !stripped.is_empty() {
            has_any_text = true;
        }
        pages_text.push(stripped);
    }

    if !has_any_text {
        return Err(PdfValidationError::NoExtractableText.into());
    }

    let full_text = pages_text.join("\n\n").trim().to_owned();
    Ok(ParseOutcome {
        text: full_text,
        page_count,
    })
}

fn load_pdfium() -> Result<Pdfium, PdfiumError> {
    if let Some(result) = try_bind_from_env("PDFIUM_LIBRARY_PATH") {
        return result;
    }

    for candidate in candidate_paths() {
        if let Some(result) = try_bind_from_path(candidate)
            && result.is_ok()
        {
            return result;
        }
    }

    match Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./")) {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(primary_err) => match Pdfium::bind_to_system_library() {
            Ok(bindings) => Ok(Pdfium::new(bindings)),
            Err(_) => Err(primary_err),
        },
    }
}

fn try_bind_from_env(var: &str) -> Option<Result<Pdfium, PdfiumError>> {
    let value = env::var_os(var)?;
    let path = PathBuf::from(&value);
    try_bind_from_path(path)
}

fn try_bind_from_path(path: impl AsRef<Path>) -> Option<Result<Pdfium, PdfiumError>> {
    let path = path.as_ref();
    if path.is_dir() {
        let lib_path = Pdfium::pdfium_platform_library_name_at_path(path);
        Some(Pdfium::bind_to_library(lib_path).map(Pdfium::new))
    } else if path.exists() {
        Some(Pdfium::bind_to_library(path).map(Pdfium::new))
    } else {
        None
    }
}

const DEFAULT_PDFIUM_LOCATIONS: &[&str] = &[
    "third_party/pdfium/lib/libpdfium.so",
    "pdfium/lib/libpdfium.so",
    "libpdfium.so",
];

fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let workspace_root = Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map(Path::to_path_buf);

    for candidate in DEFAULT_PDFIUM_LOCATIONS {
        paths.push(PathBuf::from(candidate));
        if let Some(root) = &workspace_root {
            paths.push(root.join(candidate));
        }
    }

    paths
}
