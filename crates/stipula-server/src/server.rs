//! Web server entrypoints live here.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;

use crate::api::{ExtractionProvider, ProviderError};
use crate::config::ServerConfig;

const HEALTHZ_PATH: &str = "/v1/healthz";
const DOCUMENTS_PATH: &str = "/v1/documents";
const EXTRACTIONS_PATH: &str = "/v1/extractions";
const HEALTHZ_STATUS: &str = "ok";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const PAGE_SIZE_MAX: usize = 100;
const PAGE_SIZE_DEFAULT: usize = 10;

const ERROR_INVALID_REQUEST: &str = "invalid_request";
const ERROR_PAYLOAD_TOO_LARGE: &str = "payload_too_large";
const ERROR_NOT_FOUND: &str = "not_found";
const ERROR_INTERNAL: &str = "internal_server_error";

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    Pending,
    CtrlC,
    SigTerm,
    ListenerFailed,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

type SharedProvider = Arc<dyn ExtractionProvider>;

pub fn build_api_router(provider: SharedProvider, max_upload_bytes: usize) -> Router {
    debug_assert!(HEALTHZ_PATH.starts_with("/v1/"));
    debug_assert!(max_upload_bytes > 0);

    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(DOCUMENTS_PATH, post(submit_document))
        .route(&format!("{DOCUMENTS_PATH}/{{document_id}}"), get(document_status))
        .route(EXTRACTIONS_PATH, get(list_extractions))
        .route(&format!("{EXTRACTIONS_PATH}/{{document_id}}"), get(latest_extraction))
        .layer(DefaultBodyLimit::max(max_upload_bytes.saturating_add(64 * 1024)))
        .with_state(provider)
}

pub async fn serve(config: ServerConfig, provider: SharedProvider) -> Result<(), ServerError> {
    debug_assert!(config.listen_addr.len() <= 128);
    debug_assert!(!config.listen_addr.contains('\n'));

    let listen_addr = parse_listen_addr(&config.listen_addr)?;
    let listener = bind_listener(listen_addr).await?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "stipula server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownEvent::Pending);
    let shutdown_future = broadcast_shutdown(shutdown_tx);

    let app = build_api_router(provider, config.max_upload_bytes())
        .layer(TraceLayer::new_for_http());

    let mut server_future = Box::pin(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_future)
            .await
    });

    let drain_rx = shutdown_rx.clone();
    let mut drain_timeout = Box::pin(drain_timeout_future(drain_rx));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {
            // Timeout elapsed; dropping the server future forces termination.
        }
    }

    let final_event = *shutdown_rx.borrow();
    if final_event == ShutdownEvent::Pending {
        tracing::info!("server stopped without external shutdown signal");
    } else {
        tracing::info!(?final_event, "server shutdown complete");
    }

    Ok(())
}

async fn healthz() -> impl IntoResponse {
    debug_assert_eq!(HEALTHZ_STATUS, "ok");

    Json(HealthzResponse {
        status: HEALTHZ_STATUS,
    })
}

async fn submit_document(
    State(provider): State<SharedProvider>,
    mut multipart: Multipart,
) -> Result<Response, ApiFailure> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiFailure::bad_request(format!("malformed multipart body: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field
            .file_name()
            .map(str::to_owned)
            .unwrap_or_else(|| "unnamed.pdf".to_string());
        let content_type = field
            .content_type()
            .map(str::to_owned)
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiFailure::bad_request(format!("failed to read upload: {err}")))?;

        let accepted = provider
            .submit_document(filename, content_type, bytes)
            .await?;
        return Ok((StatusCode::ACCEPTED, Json(accepted)).into_response());
    }

    Err(ApiFailure::bad_request(
        "multipart body must contain a `file` field",
    ))
}

async fn document_status(
    State(provider): State<SharedProvider>,
    Path(document_id): Path<String>,
) -> Result<Response, ApiFailure> {
    let view = provider.document_status(&document_id).await?;
    Ok(Json(view).into_response())
}

async fn latest_extraction(
    State(provider): State<SharedProvider>,
    Path(document_id): Path<String>,
) -> Result<Response, ApiFailure> {
    let view = provider.latest_extraction(&document_id).await?;
    Ok(Json(view).into_response())
}

#[derive(Debug, Deserialize)]
struct ListParams {
    page: Option<usize>,
    page_size: Option<usize>,
}

async fn list_extractions(
    State(provider): State<SharedProvider>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiFailure> {
    let page = params.page.unwrap_or(1).max(1);
    let page_size = params
        .page_size
        .unwrap_or(PAGE_SIZE_DEFAULT)
        .clamp(1, PAGE_SIZE_MAX);

    let listing = provider.list_extractions(page, page_size).await?;
    Ok(Json(listing).into_response())
}

/// Route-level failure carrying its HTTP representation.
#[derive(Debug)]
struct ApiFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiFailure {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: ERROR_INVALID_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ProviderError> for ApiFailure {
    fn from(err: ProviderError) -> Self {
        let (status, code) = match &err {
            ProviderError::UnsupportedContentType { .. } => {
                (StatusCode::BAD_REQUEST, ERROR_INVALID_REQUEST)
            }
            ProviderError::FileTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, ERROR_PAYLOAD_TOO_LARGE)
            }
            ProviderError::DocumentNotFound(_) | ProviderError::ExtractionNotFound(_) => {
                (StatusCode::NOT_FOUND, ERROR_NOT_FOUND)
            }
            ProviderError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, ERROR_INTERNAL),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "provider failure");
        }
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.code,
                message: self.message,
            }),
        )
            .into_response()
    }
}

async fn wait_for_shutdown() -> ShutdownEvent {
    debug_assert!(DRAIN_TIMEOUT >= Duration::from_secs(1));

    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }

    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    debug_assert!(addr.ip().is_ipv4() || addr.ip().is_ipv6());

    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

fn broadcast_shutdown(
    sender: watch::Sender<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    debug_assert!(!sender.is_closed());
    async move {
        let event = wait_for_shutdown().await;
        debug_assert!(event != ShutdownEvent::Pending);
        if let Err(error) = sender.send(event) {
            tracing::warn!(?event, %error, "failed to broadcast shutdown event");
        }
    }
}

fn drain_timeout_future(
    mut receiver: watch::Receiver<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    debug_assert!(DRAIN_TIMEOUT.as_secs() >= 1);
    async move {
        if receiver.changed().await.is_ok() {
            let event = *receiver.borrow_and_update();
            debug_assert!(event != ShutdownEvent::Pending);
            tracing::info!(?event, "shutdown signal received; draining connections");
            tokio::time::sleep(DRAIN_TIMEOUT).await;
            tracing::warn!(
                ?event,
                seconds = DRAIN_TIMEOUT.as_secs(),
                "graceful shutdown timed out; continuing shutdown"
            );
        }
    }
}
